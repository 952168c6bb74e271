//! Project data model: units, candidates, chunk records, index entries and
//! the structured story bible.
//!
//! Units are addressed by `(project_id, ordinal)`. Candidates are append-only
//! and carry a store-assigned [`CandidateId`] that never changes; callers must
//! not rely on a candidate's position in a list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BatchFailureReport;

/// Address of one generatable unit (chapter) inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub project_id: String,
    pub ordinal: u32,
}

impl UnitKey {
    #[must_use]
    pub fn new(project_id: impl Into<String>, ordinal: u32) -> Self {
        Self {
            project_id: project_id.into(),
            ordinal,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project_id, self.ordinal)
    }
}

/// Stable candidate identity, assigned by the store on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl std::str::FromStr for CandidateId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('c').unwrap_or(s).parse().map(Self)
    }
}

/// Per-unit generation state.
///
/// ```text
/// not_started -> generating -> evaluating -> selecting -> done
///                    |                          |          |
///                    +-> failed -> generating    +----------+-> generating (regenerate)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    NotStarted,
    Generating,
    Evaluating,
    Selecting,
    Done,
    Failed,
}

impl GenerationStatus {
    /// Whether `self -> next` is a legal edge of the unit state machine.
    ///
    /// `Done -> Generating` is only legal as an explicit regeneration, which
    /// callers must pair with invalidation of the previous selection.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted | Self::Failed | Self::Selecting | Self::Done, Self::Generating)
                | (Self::Generating, Self::Evaluating | Self::Selecting | Self::Failed)
                | (Self::Evaluating, Self::Selecting)
                | (Self::Selecting | Self::Done, Self::Done)
        )
    }

    /// A generation call is currently running for the unit.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Generating | Self::Evaluating)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Generating => "generating",
            Self::Evaluating => "evaluating",
            Self::Selecting => "selecting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "generating" => Some(Self::Generating),
            "evaluating" => Some(Self::Evaluating),
            "selecting" => Some(Self::Selecting),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generatable content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub key: UnitKey,
    pub status: GenerationStatus,
    /// Must reference a candidate of this unit when set.
    pub selected: Option<CandidateId>,
    /// Attempt index handed to the next batch.
    pub next_attempt: u32,
    /// Slot count of the most recent batch.
    pub last_batch_slots: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<BatchFailureReport>,
    pub updated_at: i64,
}

impl Unit {
    #[must_use]
    pub fn new(key: UnitKey) -> Self {
        Self {
            key,
            status: GenerationStatus::NotStarted,
            selected: None,
            next_attempt: 0,
            last_batch_slots: 0,
            last_failure: None,
            updated_at: now_epoch_ms(),
        }
    }
}

/// Automated evaluation result attached to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// 0..=100
    pub score: u8,
    pub notes: Vec<String>,
}

/// Payload handed to the store; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub unit: UnitKey,
    pub slot: u32,
    pub attempt: u32,
    pub text: String,
    pub word_count: usize,
    pub summary: String,
}

/// One generated variant of a unit's content. Immutable once created apart
/// from the evaluation annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub unit: UnitKey,
    pub slot: u32,
    pub attempt: u32,
    pub text: String,
    pub word_count: usize,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    pub created_at: i64,
}

/// Indexing state of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Indexed,
    Failed,
}

impl ChunkState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "indexed" => Some(Self::Indexed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted record of one indexed span of a unit's selected candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub unit: UnitKey,
    pub candidate_id: CandidateId,
    pub seq: u32,
    pub content_hash: String,
    /// Hash of the full candidate text the chunk was cut from.
    pub source_hash: String,
    pub text: String,
    pub state: ChunkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// What an [`IndexEntry`] tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityKey {
    Character(String),
    Thread(String),
}

impl EntityKey {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Character(_) => "character",
            Self::Thread(_) => "thread",
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Character(id) | Self::Thread(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: impl Into<String>) -> Option<Self> {
        match kind {
            "character" => Some(Self::Character(id.into())),
            "thread" => Some(Self::Thread(id.into())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// State snapshot of a character or plot thread as of one unit.
///
/// Derived from selected candidates; safe to drop and rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub project_id: String,
    pub key: EntityKey,
    pub as_of: u32,
    pub mention_count: u32,
    pub excerpt: String,
}

/// A named character in the story bible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A background fact about the world. `core` facts are always sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldFact {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub core: bool,
}

/// Outline entry for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub ordinal: u32,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    /// Character names this unit explicitly involves.
    #[serde(default)]
    pub characters: Vec<String>,
    /// Plot-thread ids this unit advances.
    #[serde(default)]
    pub threads: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
}

/// Structured project data consumed by context assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectBible {
    pub project_id: String,
    pub title: String,
    pub premise: String,
    pub style_notes: String,
    pub characters: Vec<Character>,
    pub world_facts: Vec<WorldFact>,
    pub outline: Vec<OutlineEntry>,
}

impl ProjectBible {
    #[must_use]
    pub fn outline_entry(&self, ordinal: u32) -> Option<&OutlineEntry> {
        self.outline.iter().find(|entry| entry.ordinal == ordinal)
    }

    /// Ordinals the project is expected to produce, ascending.
    #[must_use]
    pub fn unit_ordinals(&self) -> Vec<u32> {
        let mut ordinals: Vec<u32> = self.outline.iter().map(|entry| entry.ordinal).collect();
        ordinals.sort_unstable();
        ordinals.dedup();
        ordinals
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_state_machine_edges() {
        use GenerationStatus::*;
        assert!(NotStarted.can_transition(Generating));
        assert!(Generating.can_transition(Evaluating));
        assert!(Generating.can_transition(Selecting));
        assert!(Generating.can_transition(Failed));
        assert!(Evaluating.can_transition(Selecting));
        assert!(Selecting.can_transition(Done));
        assert!(Done.can_transition(Generating));
        assert!(Failed.can_transition(Generating));

        assert!(!NotStarted.can_transition(Done));
        assert!(!NotStarted.can_transition(Selecting));
        assert!(!Evaluating.can_transition(Done));
        assert!(!Failed.can_transition(Selecting));
        assert!(!Generating.can_transition(Done));
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            GenerationStatus::NotStarted,
            GenerationStatus::Generating,
            GenerationStatus::Evaluating,
            GenerationStatus::Selecting,
            GenerationStatus::Done,
            GenerationStatus::Failed,
        ] {
            assert_eq!(GenerationStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(GenerationStatus::parse("pending"), None);
    }

    #[test]
    fn candidate_id_parses_with_or_without_prefix() {
        assert_eq!("c42".parse::<CandidateId>().unwrap(), CandidateId(42));
        assert_eq!("42".parse::<CandidateId>().unwrap(), CandidateId(42));
        assert!("cx".parse::<CandidateId>().is_err());
        assert_eq!(CandidateId(7).to_string(), "c7");
    }

    #[test]
    fn unit_key_display() {
        assert_eq!(UnitKey::new("saga", 12).to_string(), "saga#12");
    }

    #[test]
    fn entity_key_serde_shape() {
        let key = EntityKey::Character("Mara".to_string());
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["kind"], "character");
        assert_eq!(json["id"], "Mara");
        assert_eq!(EntityKey::from_parts("thread", "heist"), Some(EntityKey::Thread("heist".into())));
        assert_eq!(EntityKey::from_parts("place", "x"), None);
    }

    #[test]
    fn bible_unit_ordinals_sorted_and_deduped() {
        let entry = |ordinal| OutlineEntry {
            ordinal,
            title: format!("Chapter {ordinal}"),
            summary: String::new(),
            characters: Vec::new(),
            threads: Vec::new(),
            target_words: None,
        };
        let bible = ProjectBible {
            project_id: "p".into(),
            outline: vec![entry(3), entry(1), entry(2), entry(3)],
            ..ProjectBible::default()
        };
        assert_eq!(bible.unit_ordinals(), vec![1, 2, 3]);
        assert_eq!(bible.outline_entry(2).unwrap().title, "Chapter 2");
        assert!(bible.outline_entry(9).is_none());
    }
}
