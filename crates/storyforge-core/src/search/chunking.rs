//! Paragraph chunking of unit text.
//!
//! Chunks follow paragraph boundaries so that a local edit only changes the
//! chunks it touches; everything else keeps its content hash and therefore
//! its cached embedding. Paragraphs longer than `max_chars` are cut at
//! sentence ends (hard cut as a last resort), and paragraphs shorter than
//! `min_chars` are glued onto their neighbour.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::IndexConfig;
use crate::model::UnitKey;

/// Length bounds for chunks, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    pub max_chars: usize,
    pub min_chars: usize,
}

impl ChunkPolicy {
    #[must_use]
    pub fn new(max_chars: usize, min_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            min_chars: min_chars.min(max_chars),
        }
    }

    #[must_use]
    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(config.max_chunk_chars, config.min_chunk_chars)
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::new(1_200, 80)
    }
}

/// One span of text cut from a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub seq: u32,
    pub text: String,
    pub content_hash: String,
}

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Index-wide chunk id: unit address, hash prefix, and how many earlier
/// chunks of the same unit had the same hash.
#[must_use]
pub fn chunk_id(unit: &UnitKey, content_hash: &str, occurrence: u32) -> String {
    let prefix = content_hash.get(..16).unwrap_or(content_hash);
    format!(
        "{}:{}:{prefix}:{occurrence}",
        unit.project_id, unit.ordinal
    )
}

/// Split `text` into chunks. Pure and deterministic.
#[must_use]
pub fn split_into_chunks(text: &str, policy: &ChunkPolicy) -> Vec<TextChunk> {
    let mut pieces: Vec<String> = Vec::new();
    for paragraph in text.lines().map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(paragraph) <= policy.max_chars {
            pieces.push(paragraph.to_string());
        } else {
            pieces.extend(split_long(paragraph, policy.max_chars));
        }
    }

    let mut spans: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        if current.is_empty() {
            current = piece;
            continue;
        }
        let current_len = char_len(&current);
        if current_len < policy.min_chars
            && current_len + 1 + char_len(&piece) <= policy.max_chars
        {
            current.push('\n');
            current.push_str(&piece);
        } else {
            spans.push(std::mem::replace(&mut current, piece));
        }
    }
    if !current.is_empty() {
        // glue a tiny tail onto the previous span when it fits
        let tail_len = char_len(&current);
        match spans.last_mut() {
            Some(prev)
                if tail_len < policy.min_chars
                    && char_len(prev) + 1 + tail_len <= policy.max_chars =>
            {
                prev.push('\n');
                prev.push_str(&current);
            }
            _ => spans.push(current),
        }
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(seq, text)| TextChunk {
            seq: seq as u32,
            content_hash: sha256_hex(text.as_bytes()),
            text,
        })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…')
}

/// Cut an over-long paragraph at sentence ends, packing sentences up to
/// `max_chars`.
fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    let mut sentence = String::new();
    let mut chars = paragraph.chars().peekable();
    while let Some(c) = chars.next() {
        sentence.push(c);
        if is_sentence_end(c) {
            let wide = !c.is_ascii();
            match chars.peek() {
                None => {}
                Some(next) if next.is_whitespace() || wide => {
                    sentences.push(std::mem::take(&mut sentence));
                }
                Some(_) => {}
            }
        }
    }
    if !sentence.is_empty() {
        sentences.push(sentence);
    }

    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let sentence_len = char_len(sentence);
        if sentence_len > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.extend(hard_split(sentence, max_chars));
            continue;
        }
        if current.is_empty() {
            current.push_str(sentence);
        } else if char_len(&current) + 1 + sentence_len <= max_chars {
            current.push(' ');
            current.push_str(sentence);
        } else {
            out.push(std::mem::replace(&mut current, sentence.to_string()));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
