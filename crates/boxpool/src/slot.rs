//! Slot identity, status and read-only views.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a pool slot, `1..=pool_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u32);

impl SlotId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a slot as recorded in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Available for allocation
    #[default]
    Idle,
    /// Worker active, port in use
    Running,
    /// Allocation or teardown failed; must be reclaimed before reuse
    Error,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown slot status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for SlotStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "RUNNING" => Ok(Self::Running),
            "ERROR" => Ok(Self::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Durable record of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub port: u16,
    pub status: SlotStatus,
    /// Set on the transition to RUNNING, cleared on any transition away.
    pub start_time: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    /// Worker reference (process id) recorded while a worker is attached.
    pub worker_ref: Option<String>,
}

impl Slot {
    pub fn is_running(&self) -> bool {
        self.status == SlotStatus::Running
    }

    /// `now - start_time` while RUNNING, otherwise `None`.
    pub fn running_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.start_time) {
            (SlotStatus::Running, Some(start)) => Some((now - start).max(chrono::Duration::zero())),
            _ => None,
        }
    }
}

/// Read-only status view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub port: u16,
    pub status: SlotStatus,
    pub running_duration_seconds: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

impl SlotSnapshot {
    pub fn from_slot(slot: &Slot, now: DateTime<Utc>) -> Self {
        Self {
            id: slot.id,
            port: slot.port,
            status: slot.status,
            running_duration_seconds: slot.running_duration(now).map(|d| d.num_seconds()),
            start_time: slot.start_time,
            last_active: slot.last_active,
        }
    }
}
