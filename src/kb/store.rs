// kb/store.rs - Append-only versioned storage
//
//! The KB persistence layer: one relational table, append-only.
//!
//! Every write inserts a fresh `(key, version)` row; nothing is updated in
//! place. `UNIQUE (key, version)` is the arbiter under concurrency — a
//! losing writer observes the constraint (or an `if_match` mismatch read
//! inside the same transaction) and surfaces [`StoreError::Conflict`].
//! Reads never return soft-deleted rows.
//!
//! The sqlite driver blocks, so the async wrappers hop onto the blocking
//! pool; agent tasks only ever await.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("version conflict on {key}: if_match {expected:?}, current v{found}")]
    Conflict {
        key: String,
        expected: String,
        found: i64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad timestamp: {0:?}")]
    BadTimestamp(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("value serialization: {0}")]
    Value(#[from] serde_json::Error),

    #[error("blocking task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One stored row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredItem {
    pub key: String,
    pub version: i64,
    pub etag: String,
    pub content_type: String,
    pub value: Value,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub created_at: String,
    pub created_by: String,
}

/// Parameters for one STORE
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub key: String,
    pub content_type: String,
    pub value: Value,
    pub tags: Vec<String>,
    pub created_by: String,
    pub if_match: Option<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kb_items (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    key          TEXT NOT NULL,
    version      INTEGER NOT NULL,
    etag         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    value        TEXT NOT NULL,
    tags         TEXT NOT NULL DEFAULT '[]',
    session_id   TEXT,
    created_at   TEXT NOT NULL,
    created_by   TEXT NOT NULL,
    deleted      INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS kb_items_key_version_uq ON kb_items(key, version);
CREATE INDEX IF NOT EXISTS kb_items_key_version_desc ON kb_items(key, version DESC);
CREATE INDEX IF NOT EXISTS kb_items_session ON kb_items(session_id);
CREATE TABLE IF NOT EXISTS kb_tags (
    item_id INTEGER NOT NULL REFERENCES kb_items(id) ON DELETE CASCADE,
    tag     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS kb_tags_tag ON kb_tags(tag);
";

/// Keys are exactly five `[a-z0-9._-]+` segments joined by `:`
pub fn validate_key(key: &str) -> bool {
    let segments: Vec<&str> = key.split(':').collect();
    segments.len() == 5
        && segments.iter().all(|seg| {
            !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
        })
}

/// `session:<id>:...` keys bind the row to a session
pub fn session_of(key: &str) -> Option<String> {
    let mut segments = key.split(':');
    match (segments.next(), segments.next()) {
        (Some("session"), Some(id)) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

fn now_created_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Normalize an `as_of` input to the stored text format so string
/// comparison orders correctly.
fn normalize_as_of(raw: &str) -> Result<String, StoreError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| StoreError::BadTimestamp(raw.to_string()))?;
    Ok(parsed
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Handle to the KB database. Clones share one serialized connection; the
/// async methods run the driver on the blocking pool.
#[derive(Clone)]
pub struct KbStore {
    conn: Arc<Mutex<Connection>>,
}

impl KbStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-process database, used by tests and demo nodes
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one version (async wrapper)
    pub async fn store(&self, req: StoreRequest) -> Result<StoredItem, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || store_blocking(&mut conn.lock(), req)).await?
    }

    /// Read one version (async wrapper); `version` wins over `as_of`
    pub async fn get(
        &self,
        key: &str,
        version: Option<i64>,
        as_of: Option<String>,
    ) -> Result<StoredItem, StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || get_blocking(&conn.lock(), &key, version, as_of.as_deref()))
            .await?
    }

    /// Synchronous read for the admin CLI
    pub fn get_sync(
        &self,
        key: &str,
        version: Option<i64>,
        as_of: Option<&str>,
    ) -> Result<StoredItem, StoreError> {
        get_blocking(&self.conn.lock(), key, version, as_of)
    }

    /// `(key, version, etag, created_at)` rows for a session, ordered
    pub fn dump_session_sync(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, i64, String, String)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, version, etag, created_at FROM kb_items
             WHERE session_id = ?1 AND deleted = 0
             ORDER BY key, version",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn store_blocking(conn: &mut Connection, req: StoreRequest) -> Result<StoredItem, StoreError> {
    if !validate_key(&req.key) {
        return Err(StoreError::InvalidKey(req.key));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<(i64, String)> = tx
        .query_row(
            "SELECT version, etag FROM kb_items WHERE key = ?1 ORDER BY version DESC LIMIT 1",
            params![req.key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (cur_version, cur_etag) = match current {
        Some((v, e)) => (v, Some(e)),
        None => (0, None),
    };

    if let Some(expected) = &req.if_match {
        let matches = match expected.strip_prefix('v').and_then(|n| n.parse::<i64>().ok()) {
            Some(num) => num == cur_version,
            None => cur_etag.as_deref() == Some(expected.as_str()),
        };
        if !matches {
            return Err(StoreError::Conflict {
                key: req.key,
                expected: expected.clone(),
                found: cur_version,
            });
        }
    }

    let version = cur_version + 1;
    let etag = uuid::Uuid::new_v4().to_string();
    let created_at = now_created_at();
    let session_id = session_of(&req.key);
    let value_text = serde_json::to_string(&req.value)?;
    let tags_text = serde_json::to_string(&req.tags)?;

    let inserted = tx.execute(
        "INSERT INTO kb_items (key, version, etag, content_type, value, tags, session_id, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            req.key,
            version,
            etag,
            req.content_type,
            value_text,
            tags_text,
            session_id,
            created_at,
            req.created_by
        ],
    );
    match inserted {
        Ok(_) => {}
        // a racing writer took this version first
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(StoreError::Conflict {
                key: req.key,
                expected: req.if_match.unwrap_or_else(|| format!("v{cur_version}")),
                found: version,
            });
        }
        Err(e) => return Err(e.into()),
    }

    let item_id = tx.last_insert_rowid();
    for tag in &req.tags {
        tx.execute(
            "INSERT INTO kb_tags (item_id, tag) VALUES (?1, ?2)",
            params![item_id, tag],
        )?;
    }
    tx.commit()?;

    debug!(key = %req.key, version, "kb stored");
    Ok(StoredItem {
        key: req.key,
        version,
        etag,
        content_type: req.content_type,
        value: req.value,
        tags: req.tags,
        session_id,
        created_at,
        created_by: req.created_by,
    })
}

fn get_blocking(
    conn: &Connection,
    key: &str,
    version: Option<i64>,
    as_of: Option<&str>,
) -> Result<StoredItem, StoreError> {
    if !validate_key(key) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, String, String, String, String, Option<String>, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    };

    let row = if let Some(version) = version {
        conn.query_row(
            "SELECT version, etag, content_type, value, tags, session_id, created_at, created_by
             FROM kb_items WHERE key = ?1 AND version = ?2 AND deleted = 0 LIMIT 1",
            params![key, version],
            map_row,
        )
        .optional()?
    } else if let Some(as_of) = as_of {
        let cutoff = normalize_as_of(as_of)?;
        conn.query_row(
            "SELECT version, etag, content_type, value, tags, session_id, created_at, created_by
             FROM kb_items WHERE key = ?1 AND created_at <= ?2 AND deleted = 0
             ORDER BY version DESC LIMIT 1",
            params![key, cutoff],
            map_row,
        )
        .optional()?
    } else {
        conn.query_row(
            "SELECT version, etag, content_type, value, tags, session_id, created_at, created_by
             FROM kb_items WHERE key = ?1 AND deleted = 0
             ORDER BY version DESC LIMIT 1",
            params![key],
            map_row,
        )
        .optional()?
    };

    let Some((version, etag, content_type, value_text, tags_text, session_id, created_at, created_by)) =
        row
    else {
        return Err(StoreError::NotFound(key.to_string()));
    };

    Ok(StoredItem {
        key: key.to_string(),
        version,
        etag,
        content_type,
        value: serde_json::from_str(&value_text)?,
        tags: serde_json::from_str(&tags_text)?,
        session_id,
        created_at,
        created_by,
    })
}
