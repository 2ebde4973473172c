//! In-memory SQLite store, kept durable by page-level snapshots to one file.

mod flush;
mod keys;
mod links;
mod snapshot;

pub use flush::{Flusher, SnapshotTarget};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::epoch::parse_rfc3339;
use crate::error::LedgerError;
use flush::FlushMsg;

/// Applied in full, in this order, at every open and after every restore.
/// Each file must be safe to re-run.
const MIGRATIONS: [(&str, &str); 4] = [
    ("0001_characters.sql", include_str!("../../migrations/0001_characters.sql")),
    ("0002_completed_keys.sql", include_str!("../../migrations/0002_completed_keys.sql")),
    ("0003_log_links.sql", include_str!("../../migrations/0003_log_links.sql")),
    ("0004_characters_name_index.sql", include_str!("../../migrations/0004_characters_name_index.sql")),
];

/// Columns added after the first release. SQLite has no `ADD COLUMN IF NOT
/// EXISTS`, so each is probed before altering.
const ADDED_COLUMNS: [(&str, &str, &str); 1] = [
    ("characters", "rating_score", "ALTER TABLE characters ADD COLUMN rating_score REAL"),
];

pub(crate) fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub region: String,
    pub realm: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_score: Option<f64>,
}

impl Character {
    pub fn new(region: &str, realm: &str, name: &str) -> Self {
        Self {
            region: fold(region),
            realm: fold(realm),
            name: fold(name),
            rating_score: None,
        }
    }

    /// Parse a roster entry of the form `region/realm/name`.
    pub fn parse(entry: &str) -> Result<Self, LedgerError> {
        let parts: Vec<&str> = entry.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [region, realm, name] if !region.is_empty() && !realm.is_empty() && !name.is_empty() => {
                Ok(Self::new(region, realm, name))
            }
            _ => Err(LedgerError::Validation(format!(
                "roster entry '{entry}' must look like region/realm/name"
            ))),
        }
    }

    /// Case-folded natural key.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", fold(&self.region), fold(&self.realm), fold(&self.name))
    }
}

impl fmt::Display for Character {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({})", self.name, self.realm, self.region)
    }
}

/// One dungeon-key clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedKey {
    /// Native id from the profile source; 0 when the source has none.
    #[serde(default)]
    pub key_id: i64,
    pub character: String,
    pub region: String,
    pub realm: String,
    pub dungeon: String,
    pub key_level: i32,
    #[serde(default)]
    pub run_time_ms: i64,
    #[serde(default)]
    pub par_time_ms: i64,
    pub completed_at: String,
    #[serde(default)]
    pub source: String,
}

impl CompletedKey {
    pub fn owner(&self) -> Character {
        Character::new(&self.region, &self.realm, &self.character)
    }

    /// The id the row is stored under: native when present, synthetic otherwise.
    pub fn resolved_id(&self) -> i64 {
        if self.key_id > 0 {
            self.key_id
        } else {
            self.synthetic_id()
        }
    }

    /// Hex SHA-256 over the normalized identifying fields.
    pub fn synthetic_digest(&self) -> String {
        hex::encode(self.synthetic_hash())
    }

    /// First 8 digest bytes, big-endian, masked to a positive i64. Never 0.
    pub fn synthetic_id(&self) -> i64 {
        let sum = self.synthetic_hash();
        let mut head = [0u8; 8];
        head.copy_from_slice(&sum[..8]);
        let value = (u64::from_be_bytes(head) & 0x7FFF_FFFF_FFFF_FFFF) as i64;
        if value == 0 { 1 } else { value }
    }

    fn synthetic_hash(&self) -> [u8; 32] {
        let tuple = [
            fold(&self.region),
            fold(&self.realm),
            fold(&self.character),
            fold(&self.dungeon),
            self.key_level.to_string(),
            self.run_time_ms.to_string(),
            self.par_time_ms.to_string(),
            fold(&self.completed_at),
        ]
        .join("|");
        Sha256::digest(tuple.as_bytes()).into()
    }

    pub fn completed_at_utc(&self) -> Result<DateTime<Utc>, LedgerError> {
        parse_rfc3339(&self.completed_at)
    }
}

/// Reject records the store cannot index. Returns the parsed completion time.
fn validate_key(key: &CompletedKey) -> Result<DateTime<Utc>, LedgerError> {
    if key.character.trim().is_empty() || key.realm.trim().is_empty() || key.region.trim().is_empty() {
        return Err(LedgerError::Malformed("key has no owning character".into()));
    }
    if key.dungeon.trim().is_empty() {
        return Err(LedgerError::Malformed("key has no dungeon".into()));
    }
    if key.key_level < 1 {
        return Err(LedgerError::Malformed(format!("key level {} below 1", key.key_level)));
    }
    key.completed_at_utc()
}

/// Association between a stored key and a combat-log report/fight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLink {
    /// Resolved key id (see [`CompletedKey::resolved_id`]).
    pub key_id: i64,
    pub region: String,
    pub realm: String,
    pub character: String,
    pub report_code: String,
    pub fight_id: Option<i64>,
    pub pull_id: Option<i64>,
    pub url: String,
    #[serde(default)]
    pub inserted_at: String,
}

impl LogLink {
    pub fn for_key(key: &CompletedKey, report_code: &str, fight_id: Option<i64>, pull_id: Option<i64>) -> Self {
        let owner = key.owner();
        Self {
            key_id: key.resolved_id(),
            region: owner.region,
            realm: owner.realm,
            character: owner.name,
            report_code: report_code.trim().to_string(),
            fight_id,
            pull_id,
            url: build_report_url(report_code, fight_id, pull_id),
            inserted_at: String::new(),
        }
    }
}

const REPORT_BASE_URL: &str = "https://www.warcraftlogs.com/reports";

/// Deep link to a report, narrowed to a fight (preferred) or pull when known.
pub fn build_report_url(code: &str, fight_id: Option<i64>, pull_id: Option<i64>) -> String {
    let code = code.trim();
    if code.is_empty() {
        return String::new();
    }
    let base = format!("{REPORT_BASE_URL}/{code}");
    match (fight_id, pull_id) {
        (Some(f), _) => format!("{base}#fight={f}"),
        (None, Some(p)) => format!("{base}#pull={p}"),
        (None, None) => base,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountRow {
    pub character: Character,
    pub key_count: i64,
}

/// The storage engine. One in-memory connection behind one lock; the
/// snapshot file is the durability boundary.
pub struct KeyStore {
    conn: Mutex<Option<Connection>>,
    snapshot_path: Option<PathBuf>,
    flush_tx: OnceLock<mpsc::UnboundedSender<FlushMsg>>,
    mutations: AtomicU64,
}

impl KeyStore {
    /// Open an empty in-memory database, migrate it, then pull in the
    /// snapshot at `snapshot_path` if one exists. Migration failure is fatal.
    pub fn open(snapshot_path: Option<&Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        apply_migrations(&conn)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
            snapshot_path: snapshot_path.map(Path::to_path_buf),
            flush_tx: OnceLock::new(),
            mutations: AtomicU64::new(0),
        };
        if store.restore_from_disk()? {
            tracing::info!(path = %store.snapshot_display(), "restored snapshot");
        }
        Ok(store)
    }

    /// Memory-only store with no snapshot file.
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::open(None)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn snapshot_display(&self) -> String {
        self.snapshot_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    /// Run `f` against the live connection under the store lock.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(LedgerError::StoreClosed)?;
        f(conn)
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Drop the connection without flushing. Later calls fail with `StoreClosed`.
    pub fn close(&self) {
        if self.conn.lock().take().is_some() {
            tracing::debug!("store closed");
        }
    }

    /// Committed mutations since open. Restores and no-op writes don't count.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Count the mutation and arm the debounced flush, if a flusher is attached.
    fn mark_dirty(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = self.flush_tx.get() {
            let _ = tx.send(FlushMsg::Dirty);
        }
    }
}

fn apply_migrations(conn: &Connection) -> Result<(), LedgerError> {
    for (name, sql) in MIGRATIONS {
        let sql = sql.trim();
        if sql.is_empty() {
            continue;
        }
        conn.execute_batch(sql)
            .map_err(|source| LedgerError::Migration { name, source })?;
    }
    for (table, column, ddl) in ADDED_COLUMNS {
        if conn.prepare(&format!("SELECT {column} FROM {table} LIMIT 0")).is_err() {
            conn.execute(ddl, [])
                .map_err(|source| LedgerError::Migration { name: column, source })?;
        }
    }
    Ok(())
}

/// Column order: key_id, region, realm, name, dungeon, key_lvl,
/// run_time_ms, par_time_ms, completed_at, source
const KEY_COLUMNS: &str = "k.key_id, c.region, c.realm, c.name, k.dungeon, k.key_lvl, \
     k.run_time_ms, k.par_time_ms, k.completed_at, k.source";

fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<CompletedKey> {
    Ok(CompletedKey {
        key_id: row.get(0)?,
        region: row.get(1)?,
        realm: row.get(2)?,
        character: row.get(3)?,
        dungeon: row.get(4)?,
        key_level: row.get(5)?,
        run_time_ms: row.get(6)?,
        par_time_ms: row.get(7)?,
        completed_at: row.get(8)?,
        source: row.get(9)?,
    })
}

fn row_to_character(row: &rusqlite::Row) -> rusqlite::Result<Character> {
    Ok(Character {
        region: row.get("region")?,
        realm: row.get("realm")?,
        name: row.get("name")?,
        rating_score: row.get("rating_score")?,
    })
}
