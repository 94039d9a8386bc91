//! Measurement persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT,
    recorded_at TEXT NOT NULL
)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub room_id: String,
    pub kind: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection poisoned")]
    Poisoned,
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError>;
}

/// One row per measurement in the `measurements` table of a SQLite file.
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database and make sure the table exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn insert(conn: &Connection, record: &MeasurementRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO measurements (room_id, kind, value, unit, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.room_id,
            record.kind,
            record.value,
            record.unit,
            record.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl MeasurementStore for SqliteStore {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let row = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            insert(&conn, &row).map_err(StoreError::from)
        })
        .await??;

        tracing::debug!(path = %self.path.display(), kind = %record.kind, "Measurement stored");
        Ok(())
    }
}
