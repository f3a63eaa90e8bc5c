use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::audit::PromptHistoryEntry;
use crate::error::Result;
use crate::voting::Candidate;

/// Durable string key/value map
pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    /// Apply every write or none of them. `None` removes the key.
    fn set_many(&mut self, writes: &[(String, Option<String>)]) -> Result<()>;
    /// Delete every key in one step
    fn clear(&mut self) -> Result<()>;
}

const UPSERT: &str = r#"
    INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
"#;

/// SQLite-backed store: a single `kv` table
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!("Failed to create directory: {}", e)),
                )
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;
        Ok(SqliteStore { conn })
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(UPSERT, params![key, value])?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn set_many(&mut self, writes: &[(String, Option<String>)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in writes {
            match value {
                Some(value) => tx.execute(UPSERT, params![key, value])?,
                None => tx.execute("DELETE FROM kv WHERE key = ?1", [key])?,
            };
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM kv", [])?;
        tx.commit()?;
        Ok(())
    }
}

/// Volatile store for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    map: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn set_many(&mut self, writes: &[(String, Option<String>)]) -> Result<()> {
        for (key, value) in writes {
            match value {
                Some(value) => self.map.insert(key.clone(), value.clone()),
                None => self.map.remove(key),
            };
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.map.clear();
        Ok(())
    }
}

pub mod keys {
    use crate::voting::Candidate;

    pub const CURRENT_IMAGE: &str = "current_image";
    pub const HISTORY: &str = "history";
    pub const PROMPT_HISTORY: &str = "prompt_history";
    pub const REFLECTION: &str = "reflection";
    pub const CURRENT_PROMPT: &str = "current_image_prompt";

    pub fn votes(c: Candidate) -> String {
        format!("variant{}Votes", c.number())
    }

    pub fn text(c: Candidate) -> String {
        format!("variant{}_text", c.number())
    }

    pub fn image(c: Candidate) -> String {
        format!("variant{}_img", c.number())
    }

    pub fn instruction(c: Candidate) -> String {
        format!("variant{}_instruction", c.number())
    }

    pub fn vote_trigger(c: Candidate) -> String {
        format!("variant{}_vote_trigger", c.number())
    }
}

/// Writes staged for one [`SessionStore::commit`]
#[derive(Debug, Default)]
pub struct Batch {
    writes: Vec<(String, Option<String>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.writes.push((key.into(), Some(value.into())));
        self
    }

    fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.writes.push((key.into(), None));
        self
    }

    fn put_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<&mut Self> {
        let raw = serde_json::to_string(value)?;
        Ok(self.put(key, raw))
    }

    pub fn current_image(&mut self, url: &str) -> &mut Self {
        self.put(keys::CURRENT_IMAGE, url)
    }

    pub fn history(&mut self, history: &[String]) -> Result<&mut Self> {
        self.put_json(keys::HISTORY, history)
    }

    pub fn current_prompt(&mut self, prompt: &str) -> &mut Self {
        self.put(keys::CURRENT_PROMPT, prompt)
    }

    pub fn prompt_history(&mut self, entries: &[PromptHistoryEntry]) -> Result<&mut Self> {
        self.put_json(keys::PROMPT_HISTORY, entries)
    }

    pub fn votes(&mut self, c: Candidate, votes: u32) -> &mut Self {
        self.put(keys::votes(c), votes.to_string())
    }

    pub fn text(&mut self, c: Candidate, text: &str) -> &mut Self {
        self.put(keys::text(c), text)
    }

    pub fn image(&mut self, c: Candidate, url: &str) -> &mut Self {
        self.put(keys::image(c), url)
    }

    /// An empty or missing instruction removes the key
    pub fn instruction(&mut self, c: Candidate, instruction: Option<&str>) -> &mut Self {
        match instruction.filter(|s| !s.is_empty()) {
            Some(v) => self.put(keys::instruction(c), v),
            None => self.delete(keys::instruction(c)),
        }
    }

    pub fn reflection(&mut self, text: &str) -> &mut Self {
        self.put(keys::REFLECTION, text)
    }

    pub fn vote_trigger(&mut self, c: Candidate, millis: i64) -> &mut Self {
        self.put(keys::vote_trigger(c), millis.to_string())
    }

    /// Every round-scoped key removed and the counters zeroed. Session
    /// keys (current image, history, current prompt, prompt history) stay.
    pub fn clear_round(&mut self) -> &mut Self {
        for c in Candidate::ALL {
            self.delete(keys::text(c))
                .delete(keys::image(c))
                .delete(keys::instruction(c))
                .votes(c, 0);
        }
        self.delete(keys::REFLECTION)
    }
}

/// Typed view over a [`KvStore`]. Reads never fail: a missing or
/// unparsable value reads as empty/default. Writes go through a [`Batch`]
/// so a round step lands completely or not at all.
#[derive(Debug)]
pub struct SessionStore<S: KvStore> {
    kv: S,
}

impl<S: KvStore> SessionStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    pub fn inner(&self) -> &S {
        &self.kv
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.kv.get(key) {
            Ok(v) => v.filter(|s| !s.is_empty()),
            Err(err) => {
                tracing::warn!(key, %err, "store read failed");
                None
            }
        }
    }

    fn read_json<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.read(key)
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(v) => Some(v),
                Err(err) => {
                    tracing::warn!(key, %err, "discarding unparsable stored value");
                    None
                }
            })
            .unwrap_or_default()
    }

    pub fn commit(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.set_many(&batch.writes)
    }

    // -- session --

    pub fn current_image(&self) -> Option<String> {
        self.read(keys::CURRENT_IMAGE)
    }

    pub fn history(&self) -> Vec<String> {
        self.read_json(keys::HISTORY)
    }

    pub fn current_prompt(&self) -> Option<String> {
        self.read(keys::CURRENT_PROMPT)
    }

    pub fn prompt_history(&self) -> Vec<PromptHistoryEntry> {
        self.read_json(keys::PROMPT_HISTORY)
    }

    // -- round --

    pub fn votes(&self, c: Candidate) -> u32 {
        self.read(&keys::votes(c))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn text(&self, c: Candidate) -> Option<String> {
        self.read(&keys::text(c))
    }

    pub fn image(&self, c: Candidate) -> Option<String> {
        self.read(&keys::image(c))
    }

    pub fn instruction(&self, c: Candidate) -> Option<String> {
        self.read(&keys::instruction(c))
    }

    pub fn reflection(&self) -> Option<String> {
        self.read(keys::REFLECTION)
    }

    pub fn clear_round(&mut self) -> Result<()> {
        let mut batch = Batch::new();
        batch.clear_round();
        self.commit(batch)
    }

    pub fn clear_all(&mut self) -> Result<()> {
        self.kv.clear()
    }
}
