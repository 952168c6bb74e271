//! In-memory store backed by ordered maps behind a tokio `RwLock`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ProjectStore, PurgeCounts};
use crate::error::{LifecycleError, Result, StorageError};
use crate::lifecycle::ProjectState;
use crate::model::{
    Candidate, CandidateId, Character, ChunkRecord, Evaluation, GenerationStatus, IndexEntry,
    NewCandidate, OutlineEntry, ProjectBible, Unit, UnitKey, WorldFact, now_epoch_ms,
};

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<String, ProjectState>,
    bibles: BTreeMap<String, ProjectBible>,
    units: BTreeMap<UnitKey, Unit>,
    candidates: BTreeMap<CandidateId, Candidate>,
    chunks: BTreeMap<UnitKey, Vec<ChunkRecord>>,
    entries: BTreeMap<String, Vec<IndexEntry>>,
    next_candidate: u64,
}

impl Inner {
    fn bible_mut(&mut self, project_id: &str) -> Result<&mut ProjectBible> {
        self.bibles
            .get_mut(project_id)
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()).into())
    }

    fn remove_candidates_of(&mut self, key: &UnitKey) -> usize {
        let before = self.candidates.len();
        self.candidates.retain(|_, c| &c.unit != key);
        before - self.candidates.len()
    }
}

/// Process-local [`ProjectStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(&self, bible: &ProjectBible) -> Result<ProjectState> {
        let mut inner = self.inner.write().await;
        if inner.states.contains_key(&bible.project_id) {
            return Err(LifecycleError::ProjectExists(bible.project_id.clone()).into());
        }
        let state = ProjectState::new(bible.project_id.clone());
        inner.states.insert(bible.project_id.clone(), state.clone());
        inner.bibles.insert(bible.project_id.clone(), bible.clone());
        Ok(state)
    }

    async fn project_state(&self, project_id: &str) -> Result<Option<ProjectState>> {
        Ok(self.inner.read().await.states.get(project_id).cloned())
    }

    async fn put_project_state(&self, state: &ProjectState) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.states.contains_key(&state.project_id) {
            return Err(LifecycleError::ProjectNotFound(state.project_id.clone()).into());
        }
        inner.states.insert(state.project_id.clone(), state.clone());
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectState>> {
        Ok(self.inner.read().await.states.values().cloned().collect())
    }

    async fn bible(&self, project_id: &str) -> Result<Option<ProjectBible>> {
        Ok(self.inner.read().await.bibles.get(project_id).cloned())
    }

    async fn put_bible_header(&self, bible: &ProjectBible) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner.bible_mut(&bible.project_id)?;
        stored.title.clone_from(&bible.title);
        stored.premise.clone_from(&bible.premise);
        stored.style_notes.clone_from(&bible.style_notes);
        Ok(())
    }

    async fn put_character(&self, project_id: &str, character: &Character) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bible = inner.bible_mut(project_id)?;
        match bible.characters.iter_mut().find(|c| c.name == character.name) {
            Some(existing) => *existing = character.clone(),
            None => bible.characters.push(character.clone()),
        }
        Ok(())
    }

    async fn put_world_fact(&self, project_id: &str, fact: &WorldFact) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bible = inner.bible_mut(project_id)?;
        match bible.world_facts.iter_mut().find(|f| f.id == fact.id) {
            Some(existing) => *existing = fact.clone(),
            None => bible.world_facts.push(fact.clone()),
        }
        Ok(())
    }

    async fn put_outline_entry(&self, project_id: &str, entry: &OutlineEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bible = inner.bible_mut(project_id)?;
        match bible.outline.iter_mut().find(|e| e.ordinal == entry.ordinal) {
            Some(existing) => *existing = entry.clone(),
            None => {
                bible.outline.push(entry.clone());
                bible.outline.sort_by_key(|e| e.ordinal);
            }
        }
        Ok(())
    }

    async fn unit(&self, key: &UnitKey) -> Result<Option<Unit>> {
        Ok(self.inner.read().await.units.get(key).cloned())
    }

    async fn put_unit(&self, unit: &Unit) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.states.contains_key(&unit.key.project_id) {
            return Err(LifecycleError::ProjectNotFound(unit.key.project_id.clone()).into());
        }
        if let Some(selected) = unit.selected {
            let owned = inner
                .candidates
                .get(&selected)
                .is_some_and(|c| c.unit == unit.key);
            if !owned {
                return Err(StorageError::Constraint(format!(
                    "candidate {selected} does not belong to unit {}",
                    unit.key
                ))
                .into());
            }
        }
        inner.units.insert(unit.key.clone(), unit.clone());
        Ok(())
    }

    async fn list_units(&self, project_id: &str) -> Result<Vec<Unit>> {
        Ok(self
            .inner
            .read()
            .await
            .units
            .values()
            .filter(|u| u.key.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn commit_selection(
        &self,
        key: &UnitKey,
        selected: Option<CandidateId>,
        status: GenerationStatus,
    ) -> Result<Unit> {
        // single write guard: readers see both fields change together
        let mut inner = self.inner.write().await;
        if let Some(id) = selected {
            let owned = inner.candidates.get(&id).is_some_and(|c| &c.unit == key);
            if !owned {
                return Err(StorageError::Constraint(format!(
                    "candidate {id} does not belong to unit {key}"
                ))
                .into());
            }
        }
        let unit = inner
            .units
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(format!("unit {key}")))?;
        unit.selected = selected;
        unit.status = status;
        unit.updated_at = now_epoch_ms();
        Ok(unit.clone())
    }

    async fn delete_unit(&self, key: &UnitKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.units.remove(key).is_some();
        inner.remove_candidates_of(key);
        inner.chunks.remove(key);
        Ok(existed)
    }

    async fn purge_unit_outputs(&self, key: &UnitKey) -> Result<PurgeCounts> {
        let mut inner = self.inner.write().await;
        let candidates = inner.remove_candidates_of(key);
        let chunks = inner.chunks.remove(key).map_or(0, |c| c.len());
        if let Some(unit) = inner.units.get_mut(key) {
            unit.selected = None;
            unit.status = GenerationStatus::NotStarted;
            unit.last_failure = None;
            unit.last_batch_slots = 0;
            unit.updated_at = now_epoch_ms();
        }
        Ok(PurgeCounts { candidates, chunks })
    }

    async fn append_candidate(&self, candidate: &NewCandidate) -> Result<Candidate> {
        let mut inner = self.inner.write().await;
        if !inner.units.contains_key(&candidate.unit) {
            return Err(StorageError::NotFound(format!("unit {}", candidate.unit)).into());
        }
        inner.next_candidate += 1;
        let id = CandidateId(inner.next_candidate);
        let stored = Candidate {
            id,
            unit: candidate.unit.clone(),
            slot: candidate.slot,
            attempt: candidate.attempt,
            text: candidate.text.clone(),
            word_count: candidate.word_count,
            summary: candidate.summary.clone(),
            evaluation: None,
            created_at: now_epoch_ms(),
        };
        inner.candidates.insert(id, stored.clone());
        Ok(stored)
    }

    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        Ok(self.inner.read().await.candidates.get(&id).cloned())
    }

    async fn list_candidates(&self, key: &UnitKey) -> Result<Vec<Candidate>> {
        // ids are monotonic, so map order is creation order
        Ok(self
            .inner
            .read()
            .await
            .candidates
            .values()
            .filter(|c| &c.unit == key)
            .cloned()
            .collect())
    }

    async fn set_evaluation(&self, id: CandidateId, evaluation: &Evaluation) -> Result<()> {
        let mut inner = self.inner.write().await;
        let candidate = inner
            .candidates
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("candidate {id}")))?;
        candidate.evaluation = Some(evaluation.clone());
        Ok(())
    }

    async fn replace_chunk_records(&self, key: &UnitKey, records: &[ChunkRecord]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.units.contains_key(key) {
            return Err(StorageError::NotFound(format!("unit {key}")).into());
        }
        let mut records = records.to_vec();
        records.sort_by_key(|r| r.seq);
        inner.chunks.insert(key.clone(), records);
        Ok(())
    }

    async fn chunk_records(&self, key: &UnitKey) -> Result<Vec<ChunkRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .chunks
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn project_chunk_records(&self, project_id: &str) -> Result<Vec<ChunkRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .chunks
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect())
    }

    async fn delete_chunk_records(&self, key: &UnitKey) -> Result<usize> {
        Ok(self
            .inner
            .write()
            .await
            .chunks
            .remove(key)
            .map_or(0, |records| records.len()))
    }

    async fn put_index_entries(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            let list = inner.entries.entry(entry.project_id.clone()).or_default();
            match list
                .iter_mut()
                .find(|e| e.key == entry.key && e.as_of == entry.as_of)
            {
                Some(existing) => *existing = entry.clone(),
                None => list.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn index_entries(
        &self,
        project_id: &str,
        before_ordinal: u32,
    ) -> Result<Vec<IndexEntry>> {
        let inner = self.inner.read().await;
        let mut out: Vec<IndexEntry> = inner
            .entries
            .get(project_id)
            .map(|list| {
                list.iter()
                    .filter(|e| e.as_of < before_ordinal)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.key.cmp(&b.key).then(a.as_of.cmp(&b.as_of)));
        Ok(out)
    }

    async fn delete_index_entries_from(
        &self,
        project_id: &str,
        from_ordinal: u32,
    ) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.entries.get_mut(project_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|e| e.as_of < from_ordinal);
        Ok(before - list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bible() -> ProjectBible {
        ProjectBible {
            project_id: "p1".to_string(),
            title: "Test".to_string(),
            ..ProjectBible::default()
        }
    }

    fn new_candidate(unit: &UnitKey, slot: u32) -> NewCandidate {
        NewCandidate {
            unit: unit.clone(),
            slot,
            attempt: 0,
            text: format!("text {slot}"),
            word_count: 2,
            summary: String::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_project_rejected() {
        let store = MemoryStore::new();
        store.create_project(&bible()).await.unwrap();
        let err = store.create_project(&bible()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn candidate_ids_are_stable_and_ordered() {
        let store = MemoryStore::new();
        store.create_project(&bible()).await.unwrap();
        let key = UnitKey::new("p1", 1);
        store.put_unit(&Unit::new(key.clone())).await.unwrap();
        let a = store.append_candidate(&new_candidate(&key, 0)).await.unwrap();
        let b = store.append_candidate(&new_candidate(&key, 1)).await.unwrap();
        assert!(a.id < b.id);
        let listed = store.list_candidates(&key).await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
    }

    #[tokio::test]
    async fn commit_selection_rejects_foreign_candidate() {
        let store = MemoryStore::new();
        store.create_project(&bible()).await.unwrap();
        let one = UnitKey::new("p1", 1);
        let two = UnitKey::new("p1", 2);
        store.put_unit(&Unit::new(one.clone())).await.unwrap();
        store.put_unit(&Unit::new(two.clone())).await.unwrap();
        let foreign = store.append_candidate(&new_candidate(&two, 0)).await.unwrap();

        let err = store
            .commit_selection(&one, Some(foreign.id), GenerationStatus::Done)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
        let unit = store.unit(&one).await.unwrap().unwrap();
        assert_eq!(unit.status, GenerationStatus::NotStarted);
        assert!(unit.selected.is_none());
    }

    #[tokio::test]
    async fn purge_resets_unit() {
        let store = MemoryStore::new();
        store.create_project(&bible()).await.unwrap();
        let key = UnitKey::new("p1", 1);
        store.put_unit(&Unit::new(key.clone())).await.unwrap();
        let c = store.append_candidate(&new_candidate(&key, 0)).await.unwrap();
        store
            .commit_selection(&key, Some(c.id), GenerationStatus::Done)
            .await
            .unwrap();

        let counts = store.purge_unit_outputs(&key).await.unwrap();
        assert_eq!(counts.candidates, 1);
        let unit = store.unit(&key).await.unwrap().unwrap();
        assert_eq!(unit.status, GenerationStatus::NotStarted);
        assert!(unit.selected.is_none());
        assert!(store.list_candidates(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outline_entries_upsert_by_ordinal() {
        let store = MemoryStore::new();
        store.create_project(&bible()).await.unwrap();
        let entry = |ordinal: u32, title: &str| OutlineEntry {
            ordinal,
            title: title.to_string(),
            summary: String::new(),
            characters: Vec::new(),
            threads: Vec::new(),
            target_words: None,
        };
        store.put_outline_entry("p1", &entry(2, "Two")).await.unwrap();
        store.put_outline_entry("p1", &entry(1, "One")).await.unwrap();
        store.put_outline_entry("p1", &entry(2, "Two again")).await.unwrap();
        let bible = store.bible("p1").await.unwrap().unwrap();
        assert_eq!(bible.outline.len(), 2);
        assert_eq!(bible.outline[0].ordinal, 1);
        assert_eq!(bible.outline[1].title, "Two again");
    }
}
