//! Layered context assembly under a token budget.
//!
//! Three tiers, filled in order:
//!
//! - **required**: title/premise, style notes, core world facts, the name
//!   list, this unit's outline entry, and the ending of the preceding unit.
//!   Never trimmed; `over_budget` is set when it alone exceeds the budget.
//! - **important**: state snapshots of the characters and threads this unit's
//!   outline names, the top retrieved chunks, and summaries of the nearest
//!   preceding units.
//! - **reference**: remaining world facts and lower-ranked retrieved chunks.
//!
//! Important and reference items are ranked by how often they reference the
//! outline's entities, then by similarity. Filling is a prefix fill: items
//! are taken in tier order until the budget runs out, the boundary item is
//! cut to fit, and everything after it is dropped. Lowering the budget can
//! therefore only shorten the kept prefix.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::budget::TokenEstimator;
use super::entity_index::EntityIndex;
use crate::config::ContextConfig;
use crate::error::{LifecycleError, Result};
use crate::model::{EntityKey, OutlineEntry, ProjectBible, UnitKey};
use crate::search::embedder::Embedder;
use crate::search::vector_index::{QueryFilter, VectorIndex};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Required,
    Important,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Premise,
    StyleNotes,
    CoreFact,
    NameList,
    Outline,
    PrecedingEnding,
    EntityState,
    RetrievedChunk,
    PrecedingSummary,
    WorldFact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub kind: ItemKind,
    pub label: String,
    pub text: String,
    pub tokens: usize,
    /// Mentions of the current outline's entities.
    pub reference_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub truncated: bool,
}

impl ContextItem {
    #[must_use]
    pub fn new(
        estimator: &TokenEstimator,
        kind: ItemKind,
        label: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            kind,
            label: label.into(),
            tokens: estimator.estimate(&text),
            text,
            reference_count: 0,
            score: None,
            truncated: false,
        }
    }

    #[must_use]
    pub fn with_rank(mut self, reference_count: u32, score: Option<f64>) -> Self {
        self.reference_count = reference_count;
        self.score = score;
        self
    }
}

/// Ranking within the important and reference tiers.
fn rank(items: &mut [ContextItem]) {
    items.sort_by(|a, b| {
        b.reference_count.cmp(&a.reference_count).then_with(|| {
            b.score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0))
        })
    });
}

/// Everything gathered for one unit before the budget is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCandidates {
    pub unit: UnitKey,
    pub required: Vec<ContextItem>,
    pub important: Vec<ContextItem>,
    pub reference: Vec<ContextItem>,
}

impl ContextCandidates {
    /// Rank the lower tiers and apply `budget_tokens`.
    #[must_use]
    pub fn fit(mut self, budget_tokens: usize, estimator: &TokenEstimator) -> LayeredContext {
        rank(&mut self.important);
        rank(&mut self.reference);

        let required_tokens: usize = self.required.iter().map(|item| item.tokens).sum();
        let over_budget = required_tokens > budget_tokens;
        let mut remaining = budget_tokens.saturating_sub(required_tokens);
        let mut trimmed_items = 0usize;

        let mut fill = |items: Vec<ContextItem>| -> Vec<ContextItem> {
            let mut kept = Vec::with_capacity(items.len());
            for mut item in items {
                if remaining == 0 {
                    trimmed_items += 1;
                    continue;
                }
                if item.tokens <= remaining {
                    remaining -= item.tokens;
                    kept.push(item);
                    continue;
                }
                let cut = estimator.truncate(&item.text, remaining).to_string();
                trimmed_items += 1;
                remaining = 0;
                if !cut.is_empty() {
                    item.tokens = estimator.estimate(&cut);
                    item.text = cut;
                    item.truncated = true;
                    kept.push(item);
                }
            }
            kept
        };
        let important = fill(self.important);
        let reference = fill(self.reference);

        let used_tokens = required_tokens
            + important.iter().map(|i| i.tokens).sum::<usize>()
            + reference.iter().map(|i| i.tokens).sum::<usize>();

        LayeredContext {
            unit: self.unit,
            budget_tokens,
            required_tokens,
            used_tokens,
            over_budget,
            trimmed_items,
            required: self.required,
            important,
            reference,
        }
    }
}

/// Assembled context for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeredContext {
    pub unit: UnitKey,
    pub budget_tokens: usize,
    pub required_tokens: usize,
    pub used_tokens: usize,
    /// The required tier alone exceeds the budget.
    pub over_budget: bool,
    /// Lower-tier items dropped or cut to fit.
    pub trimmed_items: usize,
    pub required: Vec<ContextItem>,
    pub important: Vec<ContextItem>,
    pub reference: Vec<ContextItem>,
}

impl LayeredContext {
    #[must_use]
    pub fn tier(&self, tier: Tier) -> &[ContextItem] {
        match tier {
            Tier::Required => &self.required,
            Tier::Important => &self.important,
            Tier::Reference => &self.reference,
        }
    }
}

/// Gathers structured facts, entity snapshots and retrieved chunks for a
/// unit and fits them into a budget.
pub struct ContextAssembler {
    store: SharedStore,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    entities: Arc<EntityIndex>,
    config: ContextConfig,
    estimator: TokenEstimator,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(
        store: SharedStore,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        entities: Arc<EntityIndex>,
        config: ContextConfig,
    ) -> Self {
        Self {
            estimator: TokenEstimator::from_config(&config),
            store,
            index,
            embedder,
            entities,
            config,
        }
    }

    #[must_use]
    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Assemble context for `unit`; `budget_tokens` defaults to the
    /// configured `context_budget_tokens`.
    pub async fn assemble(
        &self,
        unit: &UnitKey,
        budget_tokens: Option<usize>,
    ) -> Result<LayeredContext> {
        let budget = budget_tokens.unwrap_or(self.config.context_budget_tokens);
        let candidates = self.gather(unit).await?;
        let context = candidates.fit(budget, &self.estimator);
        if context.over_budget {
            warn!(
                unit = %unit,
                required_tokens = context.required_tokens,
                budget_tokens = budget,
                "Required context exceeds budget"
            );
        }
        debug!(
            unit = %unit,
            required = context.required.len(),
            important = context.important.len(),
            reference = context.reference.len(),
            used_tokens = context.used_tokens,
            trimmed = context.trimmed_items,
            "Context assembled"
        );
        Ok(context)
    }

    /// Collect every tier item for `unit` without applying a budget.
    pub async fn gather(&self, unit: &UnitKey) -> Result<ContextCandidates> {
        let bible = self
            .store
            .bible(&unit.project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(unit.project_id.clone()))?;
        let outline = bible.outline_entry(unit.ordinal).cloned();
        let terms = outline_terms(outline.as_ref());
        let est = &self.estimator;

        let mut required = Vec::new();
        let mut important = Vec::new();
        let mut reference = Vec::new();

        // -- required ---------------------------------------------------------
        let mut header = String::new();
        if !bible.title.is_empty() {
            header.push_str(&format!("Title: {}", bible.title));
        }
        if !bible.premise.is_empty() {
            if !header.is_empty() {
                header.push('\n');
            }
            header.push_str(&format!("Premise: {}", bible.premise));
        }
        if !header.is_empty() {
            required.push(ContextItem::new(est, ItemKind::Premise, "premise", header));
        }
        if !bible.style_notes.is_empty() {
            required.push(ContextItem::new(
                est,
                ItemKind::StyleNotes,
                "style",
                bible.style_notes.clone(),
            ));
        }
        for fact in bible.world_facts.iter().filter(|f| f.core) {
            required.push(ContextItem::new(est, ItemKind::CoreFact, &fact.id, fact.text.clone()));
        }
        if let Some(names) = name_list(&bible) {
            required.push(ContextItem::new(est, ItemKind::NameList, "characters", names));
        }
        required.push(ContextItem::new(
            est,
            ItemKind::Outline,
            format!("unit {}", unit.ordinal),
            render_outline(unit.ordinal, outline.as_ref()),
        ));
        if let Some((ordinal, ending)) = self.preceding_ending(&bible, unit).await? {
            required.push(ContextItem::new(
                est,
                ItemKind::PrecedingEnding,
                format!("unit {ordinal} ending"),
                ending,
            ));
        }

        // -- important: entity snapshots ---------------------------------------
        if let Some(entry) = &outline {
            let snapshots = self
                .entities
                .latest_before(&unit.project_id, unit.ordinal)
                .await?;
            let outline_text = format!("{} {}", entry.title, entry.summary);
            let keys = entry
                .characters
                .iter()
                .map(|name| EntityKey::Character(name.clone()))
                .chain(entry.threads.iter().map(|id| EntityKey::Thread(id.clone())));
            for key in keys {
                let Some(snapshot) = snapshots.get(&key) else {
                    continue;
                };
                let listed_mentions = outline_text.matches(key.id()).count() as u32 + 1;
                let text = format!(
                    "{} (as of unit {}, {} mention(s)): {}",
                    key.id(),
                    snapshot.as_of,
                    snapshot.mention_count,
                    snapshot.excerpt
                );
                important.push(
                    ContextItem::new(est, ItemKind::EntityState, key.to_string(), text)
                        .with_rank(listed_mentions, None),
                );
            }
        }

        // -- important/reference: retrieved chunks -------------------------------
        let query_text = match &outline {
            Some(entry) => render_outline(unit.ordinal, Some(entry)),
            None => bible.premise.clone(),
        };
        let hits = self.retrieve(unit, &query_text).await;
        for (rank_pos, hit) in hits.into_iter().enumerate() {
            let mentions = count_terms(&hit.meta.text, &terms);
            let item = ContextItem::new(
                est,
                ItemKind::RetrievedChunk,
                format!("unit {} chunk {}", hit.meta.unit.ordinal, hit.meta.seq),
                hit.meta.text,
            )
            .with_rank(mentions, Some(hit.score));
            if rank_pos < self.config.important_top_k {
                important.push(item);
            } else {
                reference.push(item);
            }
        }

        // -- important: preceding summaries -------------------------------------
        let mut units = self.store.list_units(&unit.project_id).await?;
        units.retain(|u| u.key.ordinal < unit.ordinal && u.selected.is_some());
        units.sort_by(|a, b| b.key.ordinal.cmp(&a.key.ordinal));
        for prior in units.into_iter().take(self.config.preceding_summaries) {
            let Some(id) = prior.selected else { continue };
            let Some(candidate) = self.store.candidate(id).await? else {
                continue;
            };
            if candidate.summary.is_empty() {
                continue;
            }
            let mentions = count_terms(&candidate.summary, &terms);
            important.push(
                ContextItem::new(
                    est,
                    ItemKind::PrecedingSummary,
                    format!("unit {} summary", prior.key.ordinal),
                    candidate.summary,
                )
                .with_rank(mentions, None),
            );
        }

        // -- reference: background facts ----------------------------------------
        for fact in bible.world_facts.iter().filter(|f| !f.core) {
            let mentions = count_terms(&fact.text, &terms);
            reference.push(
                ContextItem::new(est, ItemKind::WorldFact, &fact.id, fact.text.clone())
                    .with_rank(mentions, None),
            );
        }

        Ok(ContextCandidates {
            unit: unit.clone(),
            required,
            important,
            reference,
        })
    }

    /// Retrieval never fails assembly: errors degrade to no hits.
    async fn retrieve(
        &self,
        unit: &UnitKey,
        query_text: &str,
    ) -> Vec<crate::search::vector_index::SearchHit> {
        let k = self.config.important_top_k + self.config.reference_top_k;
        if k == 0 || self.index.is_empty() || query_text.trim().is_empty() {
            return Vec::new();
        }
        let vector = match self.embedder.embed(query_text).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(unit = %unit, error = %err, "Query embedding failed; skipping retrieval");
                return Vec::new();
            }
        };
        let filter = QueryFilter::project(unit.project_id.clone()).before(unit.ordinal);
        match self.index.query_async(vector, k, filter).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(unit = %unit, error = %err, "Vector query failed; skipping retrieval");
                Vec::new()
            }
        }
    }

    /// Tail of the immediately preceding unit's selected text.
    async fn preceding_ending(
        &self,
        bible: &ProjectBible,
        unit: &UnitKey,
    ) -> Result<Option<(u32, String)>> {
        let previous = bible
            .unit_ordinals()
            .into_iter()
            .filter(|o| *o < unit.ordinal)
            .max()
            .or_else(|| unit.ordinal.checked_sub(1));
        let Some(previous) = previous else {
            return Ok(None);
        };
        let key = UnitKey::new(unit.project_id.clone(), previous);
        let Some(selected) = self.store.unit(&key).await?.and_then(|u| u.selected) else {
            return Ok(None);
        };
        let Some(candidate) = self.store.candidate(selected).await? else {
            return Ok(None);
        };
        let tail = ending_tail(&candidate.text, self.config.ending_chars);
        if tail.is_empty() {
            return Ok(None);
        }
        Ok(Some((previous, tail)))
    }
}

fn name_list(bible: &ProjectBible) -> Option<String> {
    if bible.characters.is_empty() {
        return None;
    }
    let mut out = String::from("Characters:");
    for character in &bible.characters {
        out.push_str("\n- ");
        out.push_str(&character.name);
        if !character.description.is_empty() {
            out.push_str(": ");
            out.push_str(&character.description);
        }
    }
    Some(out)
}

fn render_outline(ordinal: u32, entry: Option<&OutlineEntry>) -> String {
    let Some(entry) = entry else {
        return format!("Unit {ordinal} (no outline entry)");
    };
    let mut out = format!("Unit {ordinal}: {}", entry.title);
    if !entry.summary.is_empty() {
        out.push('\n');
        out.push_str(&entry.summary);
    }
    if !entry.characters.is_empty() {
        out.push_str("\nCharacters: ");
        out.push_str(&entry.characters.join(", "));
    }
    if !entry.threads.is_empty() {
        out.push_str("\nThreads: ");
        out.push_str(&entry.threads.join(", "));
    }
    if let Some(words) = entry.target_words {
        out.push_str(&format!("\nTarget length: about {words} words"));
    }
    out
}

fn outline_terms(entry: Option<&OutlineEntry>) -> Vec<String> {
    entry
        .map(|e| {
            e.characters
                .iter()
                .chain(e.threads.iter())
                .filter(|t| !t.trim().is_empty())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn count_terms(text: &str, terms: &[String]) -> u32 {
    terms.iter().map(|t| text.matches(t.as_str()).count() as u32).sum()
}

/// Last `max_chars` characters, starting after a whitespace boundary when
/// one exists in the window.
fn ending_tail(text: &str, max_chars: usize) -> String {
    let text = text.trim_end();
    let total = text.chars().count();
    if total <= max_chars {
        return text.trim_start().to_string();
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map_or(0, |(idx, _)| idx);
    let window = &text[start..];
    match window.find(char::is_whitespace) {
        Some(ws) if ws + 1 < window.len() => window[ws..].trim_start().to_string(),
        _ => window.to_string(),
    }
}
