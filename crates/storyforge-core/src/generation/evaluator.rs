//! Automated candidate scoring.

use async_trait::async_trait;

use crate::error::Result;
use crate::generation::metadata::word_count;
use crate::model::{Candidate, Evaluation, OutlineEntry};

/// Scores a candidate for the reviewer. Scores are advisory; selection is
/// always an explicit caller action.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        candidate: &Candidate,
        outline: Option<&OutlineEntry>,
    ) -> Result<Evaluation>;
}

/// Cheap structural heuristics: length against the target, dialogue
/// balance, and paragraph structure.
#[derive(Debug, Clone)]
pub struct HeuristicEvaluator {
    pub default_target_words: u32,
}

impl Default for HeuristicEvaluator {
    fn default() -> Self {
        Self {
            default_target_words: 2_500,
        }
    }
}

const LENGTH_WEIGHT: f64 = 50.0;
const DIALOGUE_WEIGHT: f64 = 25.0;
const STRUCTURE_WEIGHT: f64 = 25.0;

impl HeuristicEvaluator {
    #[must_use]
    pub fn score(&self, text: &str, target_words: u32) -> Evaluation {
        let mut notes = Vec::new();

        let words = word_count(text);
        let target = f64::from(target_words.max(1));
        let ratio = words as f64 / target;
        let length = LENGTH_WEIGHT * (1.0 - (1.0 - ratio).abs()).max(0.0);
        if ratio < 0.75 {
            notes.push(format!("short: {words} of ~{target_words} words"));
        } else if ratio > 1.25 {
            notes.push(format!("long: {words} of ~{target_words} words"));
        }

        let paragraphs: Vec<&str> = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let with_dialogue = paragraphs.iter().filter(|p| has_dialogue(p)).count();
        let dialogue_share = if paragraphs.is_empty() {
            0.0
        } else {
            with_dialogue as f64 / paragraphs.len() as f64
        };
        let dialogue = if (0.15..=0.6).contains(&dialogue_share) {
            DIALOGUE_WEIGHT
        } else if dialogue_share < 0.15 {
            notes.push("little dialogue".to_string());
            DIALOGUE_WEIGHT * dialogue_share / 0.15
        } else {
            notes.push("dialogue-heavy".to_string());
            DIALOGUE_WEIGHT * (1.0 - dialogue_share) / 0.4
        };

        let avg_words = if paragraphs.is_empty() {
            0.0
        } else {
            words as f64 / paragraphs.len() as f64
        };
        let structure = if paragraphs.len() < 2 {
            notes.push("single block of text".to_string());
            STRUCTURE_WEIGHT * 0.2
        } else if (20.0..=220.0).contains(&avg_words) {
            STRUCTURE_WEIGHT
        } else {
            notes.push(format!("average paragraph of {avg_words:.0} words"));
            STRUCTURE_WEIGHT * 0.6
        };

        let total = (length + dialogue + structure).round().clamp(0.0, 100.0);
        Evaluation {
            score: total as u8,
            notes,
        }
    }
}

fn has_dialogue(paragraph: &str) -> bool {
    paragraph.contains(['"', '“', '”', '「', '」', '『', '』'])
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn evaluate(
        &self,
        candidate: &Candidate,
        outline: Option<&OutlineEntry>,
    ) -> Result<Evaluation> {
        let target = outline
            .and_then(|entry| entry.target_words)
            .unwrap_or(self.default_target_words);
        Ok(self.score(&candidate.text, target))
    }
}
