//! SQLite-backed [`ProjectStore`].
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Foreign keys cascade deletes from units to candidates and chunk records,
//! and from candidates to the chunk records cut from them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use super::{ProjectStore, PurgeCounts};
use crate::error::{Error, LifecycleError, Result, StorageError};
use crate::lifecycle::{PhaseTransition, ProjectPhase, ProjectState};
use crate::model::{
    Candidate, CandidateId, Character, ChunkRecord, ChunkState, EntityKey, Evaluation,
    GenerationStatus, IndexEntry, NewCandidate, OutlineEntry, ProjectBible, Unit, UnitKey,
    WorldFact, now_epoch_ms,
};

/// Durable store in a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Runtime("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Runtime(format!("sqlite task failed: {e}")))?
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    premise TEXT NOT NULL,
    style_notes TEXT NOT NULL,
    phase TEXT NOT NULL CHECK(phase IN ('setup', 'outlined', 'drafting', 'completed')),
    epoch INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS phase_history (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    from_phase TEXT NOT NULL,
    to_phase TEXT NOT NULL,
    at INTEGER NOT NULL,
    automatic INTEGER NOT NULL,
    reason TEXT,
    PRIMARY KEY(project_id, seq)
);

CREATE TABLE IF NOT EXISTS characters (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY(project_id, name)
);

CREATE TABLE IF NOT EXISTS world_facts (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    fact_id TEXT NOT NULL,
    text TEXT NOT NULL,
    core INTEGER NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY(project_id, fact_id)
);

CREATE TABLE IF NOT EXISTS outline_entries (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    target_words INTEGER,
    PRIMARY KEY(project_id, ordinal)
);

CREATE TABLE IF NOT EXISTS outline_refs (
    project_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('character', 'thread')),
    ref_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY(project_id, ordinal, kind, ref_id),
    FOREIGN KEY(project_id, ordinal)
        REFERENCES outline_entries(project_id, ordinal)
        ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS units (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    status TEXT NOT NULL,
    selected_candidate INTEGER,
    next_attempt INTEGER NOT NULL,
    last_batch_slots INTEGER NOT NULL,
    last_failure TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(project_id, ordinal)
);

CREATE TABLE IF NOT EXISTS candidates (
    candidate_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    text TEXT NOT NULL,
    word_count INTEGER NOT NULL,
    summary TEXT NOT NULL,
    eval_score INTEGER,
    eval_notes TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY(project_id, ordinal)
        REFERENCES units(project_id, ordinal)
        ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_candidates_unit ON candidates(project_id, ordinal);

CREATE TABLE IF NOT EXISTS chunks (
    project_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    chunk_id TEXT NOT NULL,
    candidate_id INTEGER NOT NULL REFERENCES candidates(candidate_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    source_hash TEXT NOT NULL,
    text TEXT NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('indexed', 'failed')),
    embedding BLOB,
    PRIMARY KEY(project_id, ordinal, chunk_id),
    FOREIGN KEY(project_id, ordinal)
        REFERENCES units(project_id, ordinal)
        ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS index_entries (
    project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK(kind IN ('character', 'thread')),
    entity_id TEXT NOT NULL,
    as_of INTEGER NOT NULL,
    mention_count INTEGER NOT NULL,
    excerpt TEXT NOT NULL,
    PRIMARY KEY(project_id, kind, entity_id, as_of)
);
";

// -- row helpers ------------------------------------------------------------

fn usize_to_i64(value: usize, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::IntegerOverflow(field).into())
}

fn u64_to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::IntegerOverflow(field).into())
}

fn column_usize(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn column_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn invalid(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(StorageError::InvalidDbValue(message)),
    )
}

fn column_phase(row: &Row<'_>, idx: usize) -> rusqlite::Result<ProjectPhase> {
    let raw: String = row.get(idx)?;
    ProjectPhase::parse(&raw).ok_or_else(|| invalid(idx, format!("unknown phase: {raw}")))
}

fn encode_f32_embedding_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_embedding_blob(blob: &[u8]) -> std::result::Result<Vec<f32>, String> {
    if blob.len() % std::mem::size_of::<f32>() != 0 {
        return Err(format!("invalid embedding byte length: {}", blob.len()));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err("embedding contains non-finite values".to_string());
        }
        out.push(value);
    }
    Ok(out)
}

const UNIT_COLUMNS: &str = "project_id, ordinal, status, selected_candidate, next_attempt, \
     last_batch_slots, last_failure, updated_at";

fn decode_unit_row(row: &Row<'_>) -> rusqlite::Result<Unit> {
    let status_raw: String = row.get(2)?;
    let status = GenerationStatus::parse(&status_raw)
        .ok_or_else(|| invalid(2, format!("unknown generation status: {status_raw}")))?;
    let selected: Option<i64> = row.get(3)?;
    let selected = selected
        .map(|raw| {
            u64::try_from(raw)
                .map(CandidateId)
                .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, raw))
        })
        .transpose()?;
    let failure_raw: Option<String> = row.get(6)?;
    let last_failure = failure_raw
        .map(|raw| serde_json::from_str(&raw).map_err(|e| invalid(6, e.to_string())))
        .transpose()?;
    Ok(Unit {
        key: UnitKey::new(row.get::<_, String>(0)?, row.get(1)?),
        status,
        selected,
        next_attempt: row.get(4)?,
        last_batch_slots: row.get(5)?,
        last_failure,
        updated_at: row.get(7)?,
    })
}

const CANDIDATE_COLUMNS: &str = "candidate_id, project_id, ordinal, slot, attempt, text, \
     word_count, summary, eval_score, eval_notes, created_at";

fn decode_candidate_row(row: &Row<'_>) -> rusqlite::Result<Candidate> {
    let score: Option<u8> = row.get(8)?;
    let notes_raw: Option<String> = row.get(9)?;
    let evaluation = match score {
        Some(score) => {
            let notes = notes_raw
                .map(|raw| serde_json::from_str(&raw).map_err(|e| invalid(9, e.to_string())))
                .transpose()?
                .unwrap_or_default();
            Some(Evaluation { score, notes })
        }
        None => None,
    };
    Ok(Candidate {
        id: CandidateId(column_u64(row, 0)?),
        unit: UnitKey::new(row.get::<_, String>(1)?, row.get(2)?),
        slot: row.get(3)?,
        attempt: row.get(4)?,
        text: row.get(5)?,
        word_count: column_usize(row, 6)?,
        summary: row.get(7)?,
        evaluation,
        created_at: row.get(10)?,
    })
}

const CHUNK_COLUMNS: &str = "project_id, ordinal, chunk_id, candidate_id, seq, content_hash, \
     source_hash, text, state, embedding";

fn decode_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let state_raw: String = row.get(8)?;
    let state = ChunkState::parse(&state_raw)
        .ok_or_else(|| invalid(8, format!("unknown chunk state: {state_raw}")))?;
    let blob: Option<Vec<u8>> = row.get(9)?;
    let embedding = blob
        .map(|bytes| decode_f32_embedding_blob(&bytes).map_err(|msg| invalid(9, msg)))
        .transpose()?;
    Ok(ChunkRecord {
        unit: UnitKey::new(row.get::<_, String>(0)?, row.get(1)?),
        chunk_id: row.get(2)?,
        candidate_id: CandidateId(column_u64(row, 3)?),
        seq: row.get(4)?,
        content_hash: row.get(5)?,
        source_hash: row.get(6)?,
        text: row.get(7)?,
        state,
        embedding,
    })
}

fn decode_entry_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    let kind: String = row.get(1)?;
    let id: String = row.get(2)?;
    let key = EntityKey::from_parts(&kind, id)
        .ok_or_else(|| invalid(1, format!("unknown entity kind: {kind}")))?;
    Ok(IndexEntry {
        project_id: row.get(0)?,
        key,
        as_of: row.get(3)?,
        mention_count: row.get(4)?,
        excerpt: row.get(5)?,
    })
}

fn load_state(conn: &Connection, project_id: &str) -> Result<Option<ProjectState>> {
    let head = conn
        .query_row(
            "SELECT phase, epoch FROM projects WHERE project_id = ?1",
            params![project_id],
            |row| Ok((column_phase(row, 0)?, column_u64(row, 1)?)),
        )
        .optional()?;
    let Some((phase, epoch)) = head else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT from_phase, to_phase, at, automatic, reason
         FROM phase_history WHERE project_id = ?1 ORDER BY seq",
    )?;
    let history = stmt
        .query_map(params![project_id], |row| {
            Ok(PhaseTransition {
                from: column_phase(row, 0)?,
                to: column_phase(row, 1)?,
                at: row.get(2)?,
                automatic: row.get(3)?,
                reason: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(ProjectState {
        project_id: project_id.to_string(),
        phase,
        history,
        epoch,
    }))
}

fn load_bible(conn: &Connection, project_id: &str) -> Result<Option<ProjectBible>> {
    let head = conn
        .query_row(
            "SELECT title, premise, style_notes FROM projects WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((title, premise, style_notes)) = head else {
        return Ok(None);
    };

    let characters = conn
        .prepare(
            "SELECT name, description FROM characters WHERE project_id = ?1 ORDER BY position",
        )?
        .query_map(params![project_id], |row| {
            Ok(Character {
                name: row.get(0)?,
                description: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let world_facts = conn
        .prepare(
            "SELECT fact_id, text, core FROM world_facts WHERE project_id = ?1 ORDER BY position",
        )?
        .query_map(params![project_id], |row| {
            Ok(WorldFact {
                id: row.get(0)?,
                text: row.get(1)?,
                core: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut outline = conn
        .prepare(
            "SELECT ordinal, title, summary, target_words
             FROM outline_entries WHERE project_id = ?1 ORDER BY ordinal",
        )?
        .query_map(params![project_id], |row| {
            Ok(OutlineEntry {
                ordinal: row.get(0)?,
                title: row.get(1)?,
                summary: row.get(2)?,
                characters: Vec::new(),
                threads: Vec::new(),
                target_words: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut refs = conn.prepare(
        "SELECT ordinal, kind, ref_id FROM outline_refs
         WHERE project_id = ?1 ORDER BY ordinal, position",
    )?;
    let rows = refs.query_map(params![project_id], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for item in rows {
        let (ordinal, kind, ref_id) = item?;
        if let Some(entry) = outline.iter_mut().find(|e| e.ordinal == ordinal) {
            if kind == "character" {
                entry.characters.push(ref_id);
            } else {
                entry.threads.push(ref_id);
            }
        }
    }

    Ok(Some(ProjectBible {
        project_id: project_id.to_string(),
        title,
        premise,
        style_notes,
        characters,
        world_facts,
        outline,
    }))
}

fn ensure_project(tx: &Transaction<'_>, project_id: &str) -> Result<()> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM projects WHERE project_id = ?1",
            params![project_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(LifecycleError::ProjectNotFound(project_id.to_string()).into())
    }
}

fn next_position(tx: &Transaction<'_>, table: &str, project_id: &str) -> Result<i64> {
    let sql = format!("SELECT COALESCE(MAX(position), -1) + 1 FROM {table} WHERE project_id = ?1");
    Ok(tx.query_row(&sql, params![project_id], |row| row.get(0))?)
}

fn upsert_character(tx: &Transaction<'_>, project_id: &str, character: &Character) -> Result<()> {
    let position = next_position(tx, "characters", project_id)?;
    tx.execute(
        "INSERT INTO characters (project_id, name, description, position)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(project_id, name) DO UPDATE SET description = excluded.description",
        params![project_id, character.name, character.description, position],
    )?;
    Ok(())
}

fn upsert_world_fact(tx: &Transaction<'_>, project_id: &str, fact: &WorldFact) -> Result<()> {
    let position = next_position(tx, "world_facts", project_id)?;
    tx.execute(
        "INSERT INTO world_facts (project_id, fact_id, text, core, position)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(project_id, fact_id) DO UPDATE SET
            text = excluded.text, core = excluded.core",
        params![project_id, fact.id, fact.text, fact.core, position],
    )?;
    Ok(())
}

fn upsert_outline_entry(tx: &Transaction<'_>, project_id: &str, entry: &OutlineEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO outline_entries (project_id, ordinal, title, summary, target_words)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(project_id, ordinal) DO UPDATE SET
            title = excluded.title,
            summary = excluded.summary,
            target_words = excluded.target_words",
        params![
            project_id,
            entry.ordinal,
            entry.title,
            entry.summary,
            entry.target_words
        ],
    )?;
    tx.execute(
        "DELETE FROM outline_refs WHERE project_id = ?1 AND ordinal = ?2",
        params![project_id, entry.ordinal],
    )?;
    let refs = entry
        .characters
        .iter()
        .map(|name| ("character", name))
        .chain(entry.threads.iter().map(|thread| ("thread", thread)));
    for (position, (kind, ref_id)) in refs.enumerate() {
        tx.execute(
            "INSERT OR IGNORE INTO outline_refs (project_id, ordinal, kind, ref_id, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                entry.ordinal,
                kind,
                ref_id,
                usize_to_i64(position, "outline_refs.position")?
            ],
        )?;
    }
    Ok(())
}

fn write_state(tx: &Transaction<'_>, state: &ProjectState) -> Result<()> {
    let updated = tx.execute(
        "UPDATE projects SET phase = ?2, epoch = ?3 WHERE project_id = ?1",
        params![
            state.project_id,
            state.phase.as_str(),
            u64_to_i64(state.epoch, "projects.epoch")?
        ],
    )?;
    if updated == 0 {
        return Err(LifecycleError::ProjectNotFound(state.project_id.clone()).into());
    }
    tx.execute(
        "DELETE FROM phase_history WHERE project_id = ?1",
        params![state.project_id],
    )?;
    for (seq, record) in state.history.iter().enumerate() {
        tx.execute(
            "INSERT INTO phase_history (project_id, seq, from_phase, to_phase, at, automatic, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.project_id,
                usize_to_i64(seq, "phase_history.seq")?,
                record.from.as_str(),
                record.to.as_str(),
                record.at,
                record.automatic,
                record.reason
            ],
        )?;
    }
    Ok(())
}

fn read_unit(conn: &Connection, key: &UnitKey) -> Result<Option<Unit>> {
    let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE project_id = ?1 AND ordinal = ?2");
    Ok(conn
        .query_row(&sql, params![key.project_id, key.ordinal], decode_unit_row)
        .optional()?)
}

fn candidate_owner(conn: &Connection, id: CandidateId) -> Result<Option<UnitKey>> {
    Ok(conn
        .query_row(
            "SELECT project_id, ordinal FROM candidates WHERE candidate_id = ?1",
            params![u64_to_i64(id.0, "candidates.candidate_id")?],
            |row| Ok(UnitKey::new(row.get::<_, String>(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn ensure_owned(conn: &Connection, key: &UnitKey, id: CandidateId) -> Result<()> {
    if candidate_owner(conn, id)?.as_ref() == Some(key) {
        Ok(())
    } else {
        Err(StorageError::Constraint(format!("candidate {id} does not belong to unit {key}")).into())
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn create_project(&self, bible: &ProjectBible) -> Result<ProjectState> {
        let bible = bible.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM projects WHERE project_id = ?1",
                    params![bible.project_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(LifecycleError::ProjectExists(bible.project_id.clone()).into());
            }
            let state = ProjectState::new(bible.project_id.clone());
            tx.execute(
                "INSERT INTO projects (project_id, title, premise, style_notes, phase, epoch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    bible.project_id,
                    bible.title,
                    bible.premise,
                    bible.style_notes,
                    state.phase.as_str(),
                    now_epoch_ms()
                ],
            )?;
            for character in &bible.characters {
                upsert_character(&tx, &bible.project_id, character)?;
            }
            for fact in &bible.world_facts {
                upsert_world_fact(&tx, &bible.project_id, fact)?;
            }
            for entry in &bible.outline {
                upsert_outline_entry(&tx, &bible.project_id, entry)?;
            }
            tx.commit()?;
            Ok(state)
        })
        .await
    }

    async fn project_state(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let project_id = project_id.to_string();
        self.call(move |conn| load_state(conn, &project_id)).await
    }

    async fn put_project_state(&self, state: &ProjectState) -> Result<()> {
        let state = state.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            write_state(&tx, &state)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_projects(&self) -> Result<Vec<ProjectState>> {
        self.call(|conn| {
            let ids = conn
                .prepare("SELECT project_id FROM projects ORDER BY project_id")?
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(state) = load_state(conn, &id)? {
                    out.push(state);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn bible(&self, project_id: &str) -> Result<Option<ProjectBible>> {
        let project_id = project_id.to_string();
        self.call(move |conn| load_bible(conn, &project_id)).await
    }

    async fn put_bible_header(&self, bible: &ProjectBible) -> Result<()> {
        let bible = bible.clone();
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE projects SET title = ?2, premise = ?3, style_notes = ?4
                 WHERE project_id = ?1",
                params![bible.project_id, bible.title, bible.premise, bible.style_notes],
            )?;
            if updated == 0 {
                return Err(LifecycleError::ProjectNotFound(bible.project_id.clone()).into());
            }
            Ok(())
        })
        .await
    }

    async fn put_character(&self, project_id: &str, character: &Character) -> Result<()> {
        let project_id = project_id.to_string();
        let character = character.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            ensure_project(&tx, &project_id)?;
            upsert_character(&tx, &project_id, &character)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_world_fact(&self, project_id: &str, fact: &WorldFact) -> Result<()> {
        let project_id = project_id.to_string();
        let fact = fact.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            ensure_project(&tx, &project_id)?;
            upsert_world_fact(&tx, &project_id, &fact)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_outline_entry(&self, project_id: &str, entry: &OutlineEntry) -> Result<()> {
        let project_id = project_id.to_string();
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            ensure_project(&tx, &project_id)?;
            upsert_outline_entry(&tx, &project_id, &entry)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn unit(&self, key: &UnitKey) -> Result<Option<Unit>> {
        let key = key.clone();
        self.call(move |conn| read_unit(conn, &key)).await
    }

    async fn put_unit(&self, unit: &Unit) -> Result<()> {
        let unit = unit.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            ensure_project(&tx, &unit.key.project_id)?;
            if let Some(id) = unit.selected {
                ensure_owned(&tx, &unit.key, id)?;
            }
            let failure = unit
                .last_failure
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let selected = unit
                .selected
                .map(|id| u64_to_i64(id.0, "units.selected_candidate"))
                .transpose()?;
            tx.execute(
                "INSERT INTO units (project_id, ordinal, status, selected_candidate, next_attempt,
                                    last_batch_slots, last_failure, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(project_id, ordinal) DO UPDATE SET
                    status = excluded.status,
                    selected_candidate = excluded.selected_candidate,
                    next_attempt = excluded.next_attempt,
                    last_batch_slots = excluded.last_batch_slots,
                    last_failure = excluded.last_failure,
                    updated_at = excluded.updated_at",
                params![
                    unit.key.project_id,
                    unit.key.ordinal,
                    unit.status.as_str(),
                    selected,
                    unit.next_attempt,
                    unit.last_batch_slots,
                    failure,
                    unit.updated_at
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_units(&self, project_id: &str) -> Result<Vec<Unit>> {
        let project_id = project_id.to_string();
        self.call(move |conn| {
            let sql =
                format!("SELECT {UNIT_COLUMNS} FROM units WHERE project_id = ?1 ORDER BY ordinal");
            Ok(conn
                .prepare(&sql)?
                .query_map(params![project_id], decode_unit_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn commit_selection(
        &self,
        key: &UnitKey,
        selected: Option<CandidateId>,
        status: GenerationStatus,
    ) -> Result<Unit> {
        let key = key.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if let Some(id) = selected {
                ensure_owned(&tx, &key, id)?;
            }
            let selected_raw = selected
                .map(|id| u64_to_i64(id.0, "units.selected_candidate"))
                .transpose()?;
            let updated = tx.execute(
                "UPDATE units SET selected_candidate = ?3, status = ?4, updated_at = ?5
                 WHERE project_id = ?1 AND ordinal = ?2",
                params![
                    key.project_id,
                    key.ordinal,
                    selected_raw,
                    status.as_str(),
                    now_epoch_ms()
                ],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("unit {key}")).into());
            }
            let unit = read_unit(&tx, &key)?
                .ok_or_else(|| StorageError::NotFound(format!("unit {key}")))?;
            tx.commit()?;
            Ok(unit)
        })
        .await
    }

    async fn delete_unit(&self, key: &UnitKey) -> Result<bool> {
        let key = key.clone();
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM units WHERE project_id = ?1 AND ordinal = ?2",
                params![key.project_id, key.ordinal],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn purge_unit_outputs(&self, key: &UnitKey) -> Result<PurgeCounts> {
        let key = key.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let chunks = tx.execute(
                "DELETE FROM chunks WHERE project_id = ?1 AND ordinal = ?2",
                params![key.project_id, key.ordinal],
            )?;
            let candidates = tx.execute(
                "DELETE FROM candidates WHERE project_id = ?1 AND ordinal = ?2",
                params![key.project_id, key.ordinal],
            )?;
            tx.execute(
                "UPDATE units SET selected_candidate = NULL, status = ?3, last_failure = NULL,
                                  last_batch_slots = 0, updated_at = ?4
                 WHERE project_id = ?1 AND ordinal = ?2",
                params![
                    key.project_id,
                    key.ordinal,
                    GenerationStatus::NotStarted.as_str(),
                    now_epoch_ms()
                ],
            )?;
            tx.commit()?;
            Ok(PurgeCounts { candidates, chunks })
        })
        .await
    }

    async fn append_candidate(&self, candidate: &NewCandidate) -> Result<Candidate> {
        let candidate = candidate.clone();
        self.call(move |conn| {
            let created_at = now_epoch_ms();
            let inserted = conn.execute(
                "INSERT INTO candidates (project_id, ordinal, slot, attempt, text, word_count,
                                         summary, eval_score, eval_notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8)",
                params![
                    candidate.unit.project_id,
                    candidate.unit.ordinal,
                    candidate.slot,
                    candidate.attempt,
                    candidate.text,
                    usize_to_i64(candidate.word_count, "candidates.word_count")?,
                    candidate.summary,
                    created_at
                ],
            );
            if let Err(rusqlite::Error::SqliteFailure(err, _)) = &inserted {
                if err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return Err(StorageError::NotFound(format!("unit {}", candidate.unit)).into());
                }
            }
            inserted?;
            let raw_id = conn.last_insert_rowid();
            let id = u64::try_from(raw_id)
                .map_err(|_| StorageError::IntegerOverflow("candidates.candidate_id"))?;
            Ok(Candidate {
                id: CandidateId(id),
                unit: candidate.unit,
                slot: candidate.slot,
                attempt: candidate.attempt,
                text: candidate.text,
                word_count: candidate.word_count,
                summary: candidate.summary,
                evaluation: None,
                created_at,
            })
        })
        .await
    }

    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        self.call(move |conn| {
            let sql = format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE candidate_id = ?1");
            Ok(conn
                .query_row(
                    &sql,
                    params![u64_to_i64(id.0, "candidates.candidate_id")?],
                    decode_candidate_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_candidates(&self, key: &UnitKey) -> Result<Vec<Candidate>> {
        let key = key.clone();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {CANDIDATE_COLUMNS} FROM candidates
                 WHERE project_id = ?1 AND ordinal = ?2 ORDER BY candidate_id"
            );
            Ok(conn
                .prepare(&sql)?
                .query_map(params![key.project_id, key.ordinal], decode_candidate_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn set_evaluation(&self, id: CandidateId, evaluation: &Evaluation) -> Result<()> {
        let evaluation = evaluation.clone();
        self.call(move |conn| {
            let notes = serde_json::to_string(&evaluation.notes)?;
            let updated = conn.execute(
                "UPDATE candidates SET eval_score = ?2, eval_notes = ?3 WHERE candidate_id = ?1",
                params![
                    u64_to_i64(id.0, "candidates.candidate_id")?,
                    evaluation.score,
                    notes
                ],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("candidate {id}")).into());
            }
            Ok(())
        })
        .await
    }

    async fn replace_chunk_records(&self, key: &UnitKey, records: &[ChunkRecord]) -> Result<()> {
        let key = key.clone();
        let records = records.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM chunks WHERE project_id = ?1 AND ordinal = ?2",
                params![key.project_id, key.ordinal],
            )?;
            for record in &records {
                let blob = record.embedding.as_deref().map(encode_f32_embedding_blob);
                tx.execute(
                    "INSERT INTO chunks (project_id, ordinal, chunk_id, candidate_id, seq,
                                         content_hash, source_hash, text, state, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        key.project_id,
                        key.ordinal,
                        record.chunk_id,
                        u64_to_i64(record.candidate_id.0, "chunks.candidate_id")?,
                        record.seq,
                        record.content_hash,
                        record.source_hash,
                        record.text,
                        record.state.as_str(),
                        blob
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn chunk_records(&self, key: &UnitKey) -> Result<Vec<ChunkRecord>> {
        let key = key.clone();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ?1 AND ordinal = ?2 ORDER BY seq"
            );
            Ok(conn
                .prepare(&sql)?
                .query_map(params![key.project_id, key.ordinal], decode_chunk_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn project_chunk_records(&self, project_id: &str) -> Result<Vec<ChunkRecord>> {
        let project_id = project_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ?1 ORDER BY ordinal, seq"
            );
            Ok(conn
                .prepare(&sql)?
                .query_map(params![project_id], decode_chunk_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_chunk_records(&self, key: &UnitKey) -> Result<usize> {
        let key = key.clone();
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM chunks WHERE project_id = ?1 AND ordinal = ?2",
                params![key.project_id, key.ordinal],
            )?)
        })
        .await
    }

    async fn put_index_entries(&self, entries: &[IndexEntry]) -> Result<()> {
        let entries = entries.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for entry in &entries {
                tx.execute(
                    "INSERT INTO index_entries (project_id, kind, entity_id, as_of, mention_count, excerpt)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(project_id, kind, entity_id, as_of) DO UPDATE SET
                        mention_count = excluded.mention_count,
                        excerpt = excluded.excerpt",
                    params![
                        entry.project_id,
                        entry.key.kind(),
                        entry.key.id(),
                        entry.as_of,
                        entry.mention_count,
                        entry.excerpt
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn index_entries(
        &self,
        project_id: &str,
        before_ordinal: u32,
    ) -> Result<Vec<IndexEntry>> {
        let project_id = project_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .prepare(
                    "SELECT project_id, kind, entity_id, as_of, mention_count, excerpt
                     FROM index_entries WHERE project_id = ?1 AND as_of < ?2
                     ORDER BY kind, entity_id, as_of",
                )?
                .query_map(params![project_id, before_ordinal], decode_entry_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_index_entries_from(
        &self,
        project_id: &str,
        from_ordinal: u32,
    ) -> Result<usize> {
        let project_id = project_id.to_string();
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM index_entries WHERE project_id = ?1 AND as_of >= ?2",
                params![project_id, from_ordinal],
            )?)
        })
        .await
    }
}
