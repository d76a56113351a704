//! Idempotent slot teardown.
//!
//! Every path that returns a slot to the pool (release, heartbeat loss,
//! unclaimed allocation, sweep, startup/shutdown reset, failed allocation)
//! goes through [`Reclaimer::reclaim`] while holding the slot's runtime lock.

use std::fmt;
use std::sync::Arc;

use crate::artifact::ArtifactLayout;
use crate::manager::SlotRuntime;
use crate::slot::{SlotId, SlotStatus};
use crate::store::{ActivityAction, SlotStore, StoreError, Transition};
use crate::worker::{ProcessSupervisor, TerminateError};

/// Actor recorded for reclaims not caused by a client.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimTrigger {
    Release,
    HeartbeatTimeout,
    ChannelClosed,
    Unclaimed,
    Sweep,
    Reset,
    AllocationFailure,
}

impl ReclaimTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ChannelClosed => "channel_closed",
            Self::Unclaimed => "unclaimed",
            Self::Sweep => "sweep",
            Self::Reset => "reset",
            Self::AllocationFailure => "allocation_failure",
        }
    }
}

impl fmt::Display for ReclaimTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Nothing to do; the slot was already IDLE with no worker.
    AlreadyIdle,
    Reclaimed,
    /// Slot is IDLE but some teardown steps failed.
    PartialFailure { failures: Vec<String> },
    /// Worker could not be killed; slot left in ERROR for the next sweep.
    Stuck { pid: u32 },
}

impl ReclaimOutcome {
    pub fn is_idle(&self) -> bool {
        !matches!(self, Self::Stuck { .. })
    }
}

pub struct Reclaimer {
    store: SlotStore,
    supervisor: Arc<ProcessSupervisor>,
    layout: ArtifactLayout,
}

impl Reclaimer {
    pub fn new(store: SlotStore, supervisor: Arc<ProcessSupervisor>, layout: ArtifactLayout) -> Self {
        Self {
            store,
            supervisor,
            layout,
        }
    }

    /// Return a slot to IDLE.
    ///
    /// Without `force`, an IDLE slot with no attached worker is left alone.
    /// With `force`, every teardown step runs regardless of recorded state.
    /// Only store failures are returned as errors; teardown failures are
    /// reported in the outcome.
    pub async fn reclaim(
        &self,
        id: SlotId,
        runtime: &mut SlotRuntime,
        trigger: ReclaimTrigger,
        actor: &str,
        force: bool,
    ) -> Result<ReclaimOutcome, StoreError> {
        let current = self.store.get(id).await?;
        if !force && current.status == SlotStatus::Idle && runtime.worker.is_none() {
            tracing::debug!(slot = %id, %trigger, "Slot already idle");
            return Ok(ReclaimOutcome::AlreadyIdle);
        }

        // Invalidate this allocation: watchdogs and channels bound to it no
        // longer apply.
        runtime.generation += 1;
        runtime.liveness_bound = false;
        if let Some(binding) = runtime.liveness.take() {
            binding.cancel.cancel();
        }

        let mut failures = Vec::new();

        if let Some(mut handle) = runtime.worker.take() {
            match self.supervisor.terminate(&mut handle).await {
                Ok(()) => {}
                Err(TerminateError::Unkillable { pid }) => {
                    runtime.worker = Some(handle);
                    return self.mark_stuck(id, pid, trigger, actor).await;
                }
            }
        } else if let Some(reference) = &current.worker_ref {
            // Recorded by a process that no longer owns it: stop it by pid so
            // it cannot keep the slot's port.
            match reference.parse::<u32>() {
                Ok(pid) => {
                    if let Err(TerminateError::Unkillable { pid }) =
                        self.supervisor.terminate_orphan(id, pid).await
                    {
                        return self.mark_stuck(id, pid, trigger, actor).await;
                    }
                }
                Err(_) => {
                    tracing::warn!(slot = %id, worker = %reference, "Unrecognized worker reference");
                }
            }
        }

        if let Err(e) = self.supervisor.cleanup(id).await {
            tracing::warn!(slot = %id, error = %e, "Cleanup command failed");
            failures.push(format!("cleanup: {e}"));
        }

        let layout = self.layout.clone();
        match tokio::task::spawn_blocking(move || layout.remove(id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(slot = %id, error = %e, "Failed to remove artifact directory");
                failures.push(format!("artifact: {e}"));
            }
            Err(e) => {
                tracing::warn!(slot = %id, error = %e, "Artifact removal task failed");
                failures.push(format!("artifact: {e}"));
            }
        }

        self.store.transition(id, None, Transition::Idle).await?;

        let detail = if failures.is_empty() {
            trigger.to_string()
        } else {
            format!("{trigger} ({})", failures.join("; "))
        };
        self.record(id, actor, ActivityAction::Stop, detail).await;

        if failures.is_empty() {
            tracing::info!(slot = %id, %trigger, "Slot reclaimed");
            Ok(ReclaimOutcome::Reclaimed)
        } else {
            tracing::warn!(slot = %id, %trigger, failures = failures.len(), "Slot reclaimed with failures");
            Ok(ReclaimOutcome::PartialFailure { failures })
        }
    }

    /// Leave the slot in ERROR with the surviving pid recorded; the sweep
    /// retries it.
    async fn mark_stuck(
        &self,
        id: SlotId,
        pid: u32,
        trigger: ReclaimTrigger,
        actor: &str,
    ) -> Result<ReclaimOutcome, StoreError> {
        tracing::error!(slot = %id, pid, %trigger, "Worker unkillable, marking slot ERROR");
        self.store
            .transition(
                id,
                None,
                Transition::Error {
                    worker_ref: Some(pid.to_string()),
                },
            )
            .await?;
        self.record(id, actor, ActivityAction::Error, format!("{trigger}: worker {pid} unkillable"))
            .await;
        Ok(ReclaimOutcome::Stuck { pid })
    }

    async fn record(&self, id: SlotId, actor: &str, action: ActivityAction, detail: String) {
        if let Err(e) = self.store.log_activity(id, actor, action, Some(detail)).await {
            tracing::warn!(slot = %id, %action, error = %e, "Failed to record activity");
        }
    }
}
