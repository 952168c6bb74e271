//! Character and plot-thread snapshots derived from selected candidates.
//!
//! Snapshot `as_of = n` reflects units `<= n`. Entries are a cache: they are
//! dropped from position N onward whenever unit N's selection changes and
//! rebuilt from the store.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::model::{EntityKey, IndexEntry, ProjectBible};
use crate::store::SharedStore;

const EXCERPT_CHARS: usize = 240;

pub struct EntityIndex {
    store: SharedStore,
}

impl EntityIndex {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Latest snapshot per entity among units before `before_ordinal`.
    pub async fn latest_before(
        &self,
        project_id: &str,
        before_ordinal: u32,
    ) -> Result<BTreeMap<EntityKey, IndexEntry>> {
        let mut latest: BTreeMap<EntityKey, IndexEntry> = BTreeMap::new();
        for entry in self.store.index_entries(project_id, before_ordinal).await? {
            match latest.get(&entry.key) {
                Some(existing) if existing.as_of >= entry.as_of => {}
                _ => {
                    latest.insert(entry.key.clone(), entry);
                }
            }
        }
        Ok(latest)
    }

    pub async fn invalidate_from(&self, project_id: &str, from_ordinal: u32) -> Result<usize> {
        self.store
            .delete_index_entries_from(project_id, from_ordinal)
            .await
    }

    /// Drop snapshots from `from_ordinal` onward and recompute them from the
    /// selected candidates. Returns the number of entries written.
    pub async fn rebuild_from(&self, project_id: &str, from_ordinal: u32) -> Result<usize> {
        self.invalidate_from(project_id, from_ordinal).await?;
        let Some(bible) = self.store.bible(project_id).await? else {
            return Ok(0);
        };
        let mut running = self.latest_before(project_id, from_ordinal).await?;
        let mut written = 0;

        for unit in self.store.list_units(project_id).await? {
            if unit.key.ordinal < from_ordinal {
                continue;
            }
            let Some(selected) = unit.selected else {
                continue;
            };
            let Some(candidate) = self.store.candidate(selected).await? else {
                continue;
            };
            let entries = snapshot_unit(
                &bible,
                unit.key.ordinal,
                &candidate.text,
                &candidate.summary,
                &running,
            );
            if entries.is_empty() {
                continue;
            }
            self.store.put_index_entries(&entries).await?;
            written += entries.len();
            for entry in entries {
                running.insert(entry.key.clone(), entry);
            }
        }
        debug!(project_id, from_ordinal, written, "Entity index rebuilt");
        Ok(written)
    }
}

/// Entries changed by one unit's text.
fn snapshot_unit(
    bible: &ProjectBible,
    ordinal: u32,
    text: &str,
    summary: &str,
    running: &BTreeMap<EntityKey, IndexEntry>,
) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let previous_count =
        |key: &EntityKey| running.get(key).map(|entry| entry.mention_count).unwrap_or(0);

    for character in &bible.characters {
        let name = character.name.trim();
        if name.is_empty() {
            continue;
        }
        let mentions = text.matches(name).count() as u32;
        if mentions == 0 {
            continue;
        }
        let key = EntityKey::Character(name.to_string());
        let excerpt = text
            .rfind(name)
            .map(|pos| sentence_around(text, pos))
            .unwrap_or_default();
        entries.push(IndexEntry {
            project_id: bible.project_id.clone(),
            mention_count: previous_count(&key) + mentions,
            key,
            as_of: ordinal,
            excerpt,
        });
    }

    if let Some(outline) = bible.outline_entry(ordinal) {
        for thread in &outline.threads {
            let key = EntityKey::Thread(thread.clone());
            let excerpt = if summary.is_empty() {
                outline.summary.clone()
            } else {
                summary.to_string()
            };
            entries.push(IndexEntry {
                project_id: bible.project_id.clone(),
                mention_count: previous_count(&key) + 1,
                key,
                as_of: ordinal,
                excerpt: clip(&excerpt, EXCERPT_CHARS),
            });
        }
    }
    entries
}

fn is_boundary(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '\n')
}

/// The sentence containing byte offset `pos`.
fn sentence_around(text: &str, pos: usize) -> String {
    let start = text[..pos]
        .char_indices()
        .rev()
        .find(|(_, c)| is_boundary(*c))
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);
    let end = text[pos..]
        .char_indices()
        .find(|(_, c)| is_boundary(*c))
        .map(|(idx, c)| pos + idx + c.len_utf8())
        .unwrap_or(text.len());
    clip(text[start..end].trim(), EXCERPT_CHARS)
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
