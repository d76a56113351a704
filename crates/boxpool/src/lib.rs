//! boxpool: a fixed pool of supervised worker slots, each bound to its own port.

mod health;
mod version;

pub mod artifact;
pub mod config;
pub mod heartbeat;
pub mod manager;
pub mod reclaim;
pub mod slot;
pub mod store;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use manager::{
    Allocation, HealthSnapshot, LivenessLease, SlotError, SlotManager, SweepReason, SweepReport,
};

pub use artifact::ArtifactLayout;
pub use config::{ConfigError, HeartbeatConfig, PoolConfig};
pub use health::{Health, HealthResponse};
pub use heartbeat::{ChannelOutcome, HeartbeatFrame, HeartbeatMonitor};
pub use reclaim::{ReclaimOutcome, ReclaimTrigger};
pub use slot::{Slot, SlotId, SlotSnapshot, SlotStatus};
pub use store::{ActivityEntry, SlotStore, StoreError};
pub use transport::{ServerConfig, serve};
pub use version::{BOXPOOL_VERSION, VersionInfo};
pub use worker::{LaunchError, ProcessSupervisor, ScriptSpawner, WorkerSpawner};
