//! SQLite-backed slot store.
//!
//! One row per slot in `instances`, plus an append-only `instance_logs`
//! table. All access goes through a single connection on the blocking pool;
//! callers serialize per-slot decisions themselves (see `manager`).

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::slot::{Slot, SlotId, SlotStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instances (
    id          INTEGER PRIMARY KEY,
    port        INTEGER NOT NULL,
    status      TEXT NOT NULL DEFAULT 'IDLE' CHECK (status IN ('IDLE', 'RUNNING', 'ERROR')),
    start_time  TEXT,
    last_active TEXT,
    worker_ref  TEXT
);
CREATE TABLE IF NOT EXISTS instance_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id INTEGER NOT NULL,
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    detail      TEXT,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS instance_logs_by_instance ON instance_logs (instance_id, id);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("slot {0} not found")]
    NotFound(SlotId),
    #[error("slot {id} is {actual}, expected {expected}")]
    Conflict {
        id: SlotId,
        expected: SlotStatus,
        actual: SlotStatus,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Target state of a store transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Sets `start_time` and attaches the worker reference.
    Running { worker_ref: String },
    /// Clears `start_time` and the worker reference.
    Idle,
    /// Clears `start_time`; keeps a worker reference if one is still attached.
    Error { worker_ref: Option<String> },
}

impl Transition {
    pub fn status(&self) -> SlotStatus {
        match self {
            Transition::Running { .. } => SlotStatus::Running,
            Transition::Idle => SlotStatus::Idle,
            Transition::Error { .. } => SlotStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Allocate,
    Start,
    Stop,
    Error,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocate => "allocate",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub slot_id: SlotId,
    pub actor: String,
    pub action: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of all slots.
#[derive(Clone)]
pub struct SlotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SlotStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))??;

        tracing::debug!("Slot store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    /// Ensure exactly the given slots exist with the given ports.
    ///
    /// New rows start IDLE. Existing rows keep their status; rows outside the
    /// layout are dropped.
    pub async fn provision(&self, layout: Vec<(SlotId, u16)>) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut upsert = tx.prepare(
                    "INSERT INTO instances (id, port, status) VALUES (?1, ?2, 'IDLE')
                     ON CONFLICT(id) DO UPDATE SET port = excluded.port",
                )?;
                for (id, port) in &layout {
                    upsert.execute(params![id.get(), port])?;
                }
            }
            let max = layout.iter().map(|(id, _)| id.get()).max().unwrap_or(0);
            let removed = tx.execute("DELETE FROM instances WHERE id > ?1", params![max])?;
            tx.commit()?;
            if removed > 0 {
                tracing::info!(removed, "Dropped slot rows outside the configured pool");
            }
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: SlotId) -> Result<Slot, StoreError> {
        self.call(move |conn| read_slot(conn, id)?.ok_or(StoreError::NotFound(id)))
            .await
    }

    /// All slots ordered by id.
    pub async fn list(&self) -> Result<Vec<Slot>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, port, status, start_time, last_active, worker_ref
                 FROM instances ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_slot)?;
            let mut slots = Vec::new();
            for row in rows {
                slots.push(row??);
            }
            Ok(slots)
        })
        .await
    }

    /// Atomically move a slot to a new status.
    ///
    /// When `expected` is set, the transition only applies if the current
    /// status matches; otherwise `Conflict` is returned and nothing changes.
    pub async fn transition(
        &self,
        id: SlotId,
        expected: Option<SlotStatus>,
        to: Transition,
    ) -> Result<Slot, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_slot(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            if let Some(expected) = expected
                && current.status != expected
            {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: current.status,
                });
            }

            let now = Utc::now();
            let (start_time, worker_ref) = match &to {
                Transition::Running { worker_ref } => (Some(now), Some(worker_ref.clone())),
                Transition::Idle => (None, None),
                Transition::Error { worker_ref } => (None, worker_ref.clone()),
            };
            tx.execute(
                "UPDATE instances
                 SET status = ?2, start_time = ?3, last_active = ?4, worker_ref = ?5
                 WHERE id = ?1",
                params![id.get(), to.status().as_str(), start_time, now, worker_ref],
            )?;
            let updated = read_slot(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Refresh `last_active` of a RUNNING slot. Returns false if the slot is
    /// not RUNNING.
    pub async fn touch(&self, id: SlotId) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE instances SET last_active = ?2 WHERE id = ?1 AND status = 'RUNNING'",
                params![id.get(), Utc::now()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn log_activity(
        &self,
        slot_id: SlotId,
        actor: impl Into<String>,
        action: ActivityAction,
        detail: Option<String>,
    ) -> Result<ActivityEntry, StoreError> {
        let actor = actor.into();
        self.call(move |conn| {
            let timestamp = Utc::now();
            conn.execute(
                "INSERT INTO instance_logs (instance_id, actor, action, detail, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![slot_id.get(), actor, action.as_str(), detail, timestamp],
            )?;
            Ok(ActivityEntry {
                id: conn.last_insert_rowid(),
                slot_id,
                actor,
                action: action.as_str().to_string(),
                detail,
                timestamp,
            })
        })
        .await
    }

    /// Most recent activity for a slot, newest first.
    pub async fn activity(&self, slot_id: SlotId, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, instance_id, actor, action, detail, timestamp
                 FROM instance_logs WHERE instance_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![slot_id.get(), limit], |row| {
                Ok(ActivityEntry {
                    id: row.get(0)?,
                    slot_id: SlotId::new(row.get(1)?),
                    actor: row.get(2)?,
                    action: row.get(3)?,
                    detail: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn read_slot(conn: &Connection, id: SlotId) -> Result<Option<Slot>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, port, status, start_time, last_active, worker_ref
             FROM instances WHERE id = ?1",
            params![id.get()],
            row_to_slot,
        )
        .optional()?;
    row.transpose()
}

/// Row mapping; an unknown status string is reported as an unavailable store
/// rather than guessed.
fn row_to_slot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Slot, StoreError>> {
    let status: String = row.get(2)?;
    let slot = status
        .parse::<SlotStatus>()
        .map_err(|e| StoreError::Unavailable(e.to_string()));
    Ok(match slot {
        Ok(status) => Ok(Slot {
            id: SlotId::new(row.get(0)?),
            port: row.get(1)?,
            status,
            start_time: row.get(3)?,
            last_active: row.get(4)?,
            worker_ref: row.get(5)?,
        }),
        Err(e) => Err(e),
    })
}
