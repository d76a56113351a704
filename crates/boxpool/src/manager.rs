//! SlotManager: allocation, liveness and reclamation of pool slots.
//!
//! This manager owns:
//! - One runtime cell per slot, each behind its own async mutex
//! - The process supervisor and the reclaimer
//! - Health tracking and shutdown coordination
//!
//! Every mutating operation on a slot holds that slot's lock for its whole
//! duration; operations on different slots never contend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{Sink, Stream};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactLayout;
use crate::config::PoolConfig;
use crate::health::{Health, HealthResponse};
use crate::heartbeat::{ChannelOutcome, HeartbeatFrame, HeartbeatMonitor, Inbound};
use crate::reclaim::{ReclaimOutcome, ReclaimTrigger, Reclaimer, SYSTEM_ACTOR};
use crate::slot::{SlotId, SlotSnapshot, SlotStatus};
use crate::store::{ActivityAction, ActivityEntry, SlotStore, StoreError, Transition};
use crate::version::VersionInfo;
use crate::worker::{LaunchRequest, ProcessSupervisor, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot {0} not found")]
    NotFound(SlotId),
    #[error("slot {0} is busy")]
    Busy(SlotId),
    #[error("slot {0} is not running")]
    NotRunning(SlotId),
    #[error("unsupported artifact: {0:?}")]
    UnsupportedArtifact(String),
    #[error("allocation of slot {slot} failed: {reason}")]
    Allocation { slot: SlotId, reason: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("shutting down")]
    ShuttingDown,
}

impl From<StoreError> for SlotError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SlotError::NotFound(id),
            StoreError::Conflict { id, .. } => SlotError::Busy(id),
            StoreError::Unavailable(msg) => SlotError::StoreUnavailable(msg),
        }
    }
}

/// Liveness channel currently bound to a slot.
#[derive(Debug)]
pub(crate) struct LivenessBinding {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
}

/// In-process state of one slot, guarded by the slot's lock.
#[derive(Debug, Default)]
pub struct SlotRuntime {
    pub(crate) worker: Option<WorkerHandle>,
    /// Bumped on every allocation and reclaim.
    pub(crate) generation: u64,
    pub(crate) liveness: Option<LivenessBinding>,
    /// Whether any channel was bound during the current generation.
    pub(crate) liveness_bound: bool,
}

impl SlotRuntime {
    /// Bind a new channel, cancelling the one it replaces.
    pub(crate) fn bind_liveness(&mut self, id: u64, cancel: CancellationToken) {
        if let Some(previous) = self.liveness.replace(LivenessBinding { id, cancel }) {
            previous.cancel.cancel();
        }
        self.liveness_bound = true;
    }
}

struct SlotCell {
    port: u16,
    runtime: Mutex<SlotRuntime>,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub slot_id: SlotId,
    pub port: u16,
    pub url: String,
}

/// Why the sweep reclaimed a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepReason {
    /// Slot was in ERROR
    Errored,
    /// Worker exited on its own
    WorkerExited,
    /// Store and runtime disagree about the worker
    Inconsistent,
    /// Artifact directory older than the age limit
    Expired,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: Vec<(SlotId, SweepReason)>,
    pub failed: Vec<(SlotId, String)>,
    pub strays_removed: usize,
}

/// Snapshot of pool health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub total_slots: usize,
    pub idle_slots: usize,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }

    /// BUSY state: ready but no slot is IDLE.
    pub fn is_busy(&self) -> bool {
        self.state == Health::Ready && self.idle_slots == 0
    }

    pub fn response(&self) -> HealthResponse {
        if self.is_busy() {
            HealthResponse::Busy
        } else {
            self.state.into()
        }
    }
}

pub struct SlotManager {
    config: PoolConfig,
    store: SlotStore,
    supervisor: Arc<ProcessSupervisor>,
    layout: ArtifactLayout,
    reclaimer: Reclaimer,
    monitor: HeartbeatMonitor,
    cells: BTreeMap<SlotId, SlotCell>,
    next_binding: AtomicU64,
    health: RwLock<Health>,
    /// Root token; liveness channels, watchdogs and the sweeper are children.
    shutdown: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
    public_host: String,
}

impl SlotManager {
    /// Open the configured database and build a manager with the launcher
    /// script as worker.
    pub async fn open(config: PoolConfig) -> Result<Arc<Self>, StoreError> {
        let store = SlotStore::open(&config.database_path).await?;
        let supervisor = ProcessSupervisor::from_config(&config);
        Self::new(config, store, supervisor).await
    }

    pub async fn new(
        config: PoolConfig,
        store: SlotStore,
        supervisor: ProcessSupervisor,
    ) -> Result<Arc<Self>, StoreError> {
        let layout: Vec<(SlotId, u16)> = config
            .slot_ids()
            .filter_map(|id| config.port_for(id).map(|port| (id, port)))
            .collect();
        store.provision(layout.clone()).await?;

        let cells = layout
            .into_iter()
            .map(|(id, port)| {
                (
                    id,
                    SlotCell {
                        port,
                        runtime: Mutex::new(SlotRuntime::default()),
                    },
                )
            })
            .collect();

        let artifacts = ArtifactLayout::from_config(&config);
        let supervisor = Arc::new(supervisor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            reclaimer: Reclaimer::new(store.clone(), Arc::clone(&supervisor), artifacts.clone()),
            monitor: HeartbeatMonitor::new(config.heartbeat),
            public_host: config.advertised_host(),
            store,
            supervisor,
            layout: artifacts,
            cells,
            next_binding: AtomicU64::new(1),
            health: RwLock::new(Health::Starting),
            shutdown: CancellationToken::new(),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
            config,
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    fn cell(&self, id: SlotId) -> Result<&SlotCell, SlotError> {
        self.cells.get(&id).ok_or(SlotError::NotFound(id))
    }

    async fn lock(&self, id: SlotId) -> Result<MutexGuard<'_, SlotRuntime>, SlotError> {
        Ok(self.cell(id)?.runtime.lock().await)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Claim an IDLE slot: write the artifact, launch the worker and mark the
    /// slot RUNNING.
    ///
    /// Any failure after the artifact write forces the slot back through the
    /// reclaimer before returning, so no half-started slot survives.
    pub async fn allocate(
        self: &Arc<Self>,
        id: SlotId,
        file_name: &str,
        artifact: Vec<u8>,
        actor: &str,
    ) -> Result<Allocation, SlotError> {
        if self.is_shutting_down() {
            return Err(SlotError::ShuttingDown);
        }
        if !self.config.accepts_file_name(file_name) {
            return Err(SlotError::UnsupportedArtifact(file_name.to_string()));
        }
        let port = self.cell(id)?.port;
        let mut runtime = self.lock(id).await?;

        let slot = self.store.get(id).await?;
        if slot.status != SlotStatus::Idle || runtime.worker.is_some() {
            tracing::info!(slot = %id, status = %slot.status, "Allocation rejected, slot busy");
            return Err(SlotError::Busy(id));
        }

        self.record(id, actor, ActivityAction::Allocate, Some(file_name.to_string()))
            .await;

        let layout = self.layout.clone();
        let artifact_dir = match tokio::task::spawn_blocking(move || layout.write(id, &artifact)).await {
            Ok(Ok(dir)) => dir,
            Ok(Err(e)) => {
                return Err(self
                    .abort_allocation(id, &mut runtime, actor, format!("artifact write failed: {e}"))
                    .await);
            }
            Err(e) => {
                return Err(self
                    .abort_allocation(id, &mut runtime, actor, format!("artifact write task failed: {e}"))
                    .await);
            }
        };

        let request = LaunchRequest {
            slot_id: id,
            port,
            artifact_dir,
        };
        let handle = match self.supervisor.launch(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(se) = self
                    .store
                    .transition(id, None, Transition::Error { worker_ref: None })
                    .await
                {
                    tracing::error!(slot = %id, error = %se, "Failed to mark slot ERROR");
                }
                return Err(self
                    .abort_allocation(id, &mut runtime, actor, format!("launch failed: {e}"))
                    .await);
            }
        };

        let worker_ref = handle.reference();
        runtime.worker = Some(handle);
        if let Err(e) = self
            .store
            .transition(id, Some(SlotStatus::Idle), Transition::Running { worker_ref })
            .await
        {
            tracing::error!(slot = %id, error = %e, "Failed to record RUNNING, tearing down worker");
            self.force_reclaim(id, &mut runtime, ReclaimTrigger::AllocationFailure, actor)
                .await;
            return Err(e.into());
        }

        runtime.generation += 1;
        runtime.liveness_bound = false;
        let generation = runtime.generation;
        drop(runtime);

        self.record(id, actor, ActivityAction::Start, Some(format!("port {port}")))
            .await;
        self.spawn_unclaimed_watchdog(id, generation);

        tracing::info!(slot = %id, port, "Slot allocated");
        Ok(Allocation {
            slot_id: id,
            port,
            url: format!("http://{}:{}", self.public_host, port),
        })
    }

    async fn abort_allocation(
        &self,
        id: SlotId,
        runtime: &mut SlotRuntime,
        actor: &str,
        reason: String,
    ) -> SlotError {
        tracing::error!(slot = %id, %reason, "Allocation failed");
        self.record(id, actor, ActivityAction::Error, Some(reason.clone()))
            .await;
        self.force_reclaim(id, runtime, ReclaimTrigger::AllocationFailure, actor)
            .await;
        SlotError::Allocation { slot: id, reason }
    }

    async fn force_reclaim(
        &self,
        id: SlotId,
        runtime: &mut SlotRuntime,
        trigger: ReclaimTrigger,
        actor: &str,
    ) -> Option<ReclaimOutcome> {
        match self.reclaimer.reclaim(id, runtime, trigger, actor, true).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(slot = %id, %trigger, error = %e, "Forced reclaim failed");
                None
            }
        }
    }

    fn spawn_unclaimed_watchdog(self: &Arc<Self>, id: SlotId, generation: u64) {
        let Some(grace) = self.config.liveness_grace else {
            return;
        };
        let manager = Arc::downgrade(self);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            if let Some(manager) = manager.upgrade() {
                manager.reclaim_if_unclaimed(id, generation).await;
            }
        });
    }

    async fn reclaim_if_unclaimed(&self, id: SlotId, generation: u64) {
        let Ok(mut runtime) = self.lock(id).await else {
            return;
        };
        if runtime.generation != generation || runtime.liveness_bound {
            return;
        }
        tracing::info!(slot = %id, "No liveness channel opened, reclaiming");
        if let Err(e) = self
            .reclaimer
            .reclaim(id, &mut runtime, ReclaimTrigger::Unclaimed, SYSTEM_ACTOR, false)
            .await
        {
            tracing::error!(slot = %id, error = %e, "Unclaimed reclaim failed");
        }
    }

    /// Bind a liveness channel to a RUNNING slot, replacing any existing one.
    pub async fn open_liveness(self: &Arc<Self>, id: SlotId) -> Result<LivenessLease, SlotError> {
        if self.is_shutting_down() {
            return Err(SlotError::ShuttingDown);
        }
        let mut runtime = self.lock(id).await?;
        let slot = self.store.get(id).await?;
        if slot.status != SlotStatus::Running || runtime.worker.is_none() {
            return Err(SlotError::NotRunning(id));
        }

        let binding = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        if runtime.liveness.is_some() {
            tracing::info!(slot = %id, "Replacing existing liveness channel");
        }
        runtime.bind_liveness(binding, cancel.clone());

        Ok(LivenessLease {
            manager: Some(Arc::clone(self)),
            slot: id,
            binding,
            cancel,
        })
    }

    async fn liveness_ended(&self, id: SlotId, binding: u64, outcome: ChannelOutcome) {
        if !outcome.requires_reclaim() {
            return;
        }
        let Ok(mut runtime) = self.lock(id).await else {
            return;
        };
        match &runtime.liveness {
            Some(current) if current.id == binding => {
                runtime.liveness = None;
            }
            _ => {
                tracing::debug!(slot = %id, binding, "Stale liveness channel ended, ignoring");
                return;
            }
        }
        let trigger = match outcome {
            ChannelOutcome::TimedOut => ReclaimTrigger::HeartbeatTimeout,
            _ => ReclaimTrigger::ChannelClosed,
        };
        if let Err(e) = self
            .reclaimer
            .reclaim(id, &mut runtime, trigger, SYSTEM_ACTOR, false)
            .await
        {
            tracing::error!(slot = %id, %trigger, error = %e, "Liveness reclaim failed");
        }
    }

    /// Explicit client-initiated teardown.
    pub async fn release(&self, id: SlotId, actor: &str) -> Result<ReclaimOutcome, SlotError> {
        let mut runtime = self.lock(id).await?;
        Ok(self
            .reclaimer
            .reclaim(id, &mut runtime, ReclaimTrigger::Release, actor, false)
            .await?)
    }

    /// Status of every slot, ordered by id.
    pub async fn snapshot(&self) -> Result<Vec<SlotSnapshot>, SlotError> {
        let now = chrono::Utc::now();
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(|slot| SlotSnapshot::from_slot(slot, now))
            .collect())
    }

    pub async fn slot(&self, id: SlotId) -> Result<SlotSnapshot, SlotError> {
        self.cell(id)?;
        let slot = self.store.get(id).await?;
        Ok(SlotSnapshot::from_slot(&slot, chrono::Utc::now()))
    }

    pub async fn activity(&self, id: SlotId, limit: usize) -> Result<Vec<ActivityEntry>, SlotError> {
        self.cell(id)?;
        Ok(self.store.activity(id, limit).await?)
    }

    /// Safety-net pass over every slot.
    ///
    /// Reclaims ERROR slots, RUNNING slots whose worker is gone, and any slot
    /// whose artifact directory is older than `max_age`. Then removes stray
    /// entries from the artifact root. Failures are logged per slot and never
    /// stop the pass.
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        for (&id, cell) in &self.cells {
            let mut runtime = cell.runtime.lock().await;
            let slot = match self.store.get(id).await {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::warn!(slot = %id, error = %e, "Sweep could not read slot");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            };

            let worker_exited = match runtime.worker.as_mut() {
                Some(handle) => !self.supervisor.is_alive(handle),
                None => false,
            };
            let reason = if slot.status == SlotStatus::Error {
                Some(SweepReason::Errored)
            } else if worker_exited {
                Some(SweepReason::WorkerExited)
            } else if slot.is_running() != runtime.worker.is_some() {
                Some(SweepReason::Inconsistent)
            } else if self.layout.age(id).is_some_and(|age| age > max_age) {
                Some(SweepReason::Expired)
            } else {
                None
            };
            let Some(reason) = reason else {
                continue;
            };

            tracing::info!(slot = %id, ?reason, "Sweep reclaiming slot");
            match self
                .reclaimer
                .reclaim(id, &mut runtime, ReclaimTrigger::Sweep, SYSTEM_ACTOR, true)
                .await
            {
                Ok(ReclaimOutcome::Stuck { pid }) => {
                    report.failed.push((id, format!("worker {pid} unkillable")));
                }
                Ok(_) => report.reclaimed.push((id, reason)),
                Err(e) => {
                    tracing::warn!(slot = %id, error = %e, "Sweep reclaim failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        let layout = self.layout.clone();
        let known: Vec<SlotId> = self.cells.keys().copied().collect();
        match tokio::task::spawn_blocking(move || layout.remove_strays(max_age, known)).await {
            Ok(Ok(removed)) => {
                for path in &removed {
                    tracing::info!(path = %path.display(), "Removed stray artifact entry");
                }
                report.strays_removed = removed.len();
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Stray artifact scan failed"),
            Err(e) => tracing::warn!(error = %e, "Stray artifact task failed"),
        }

        report
    }

    /// Force a reclaim of every slot. Returns the slots left in ERROR.
    pub async fn reset_all(&self) -> Vec<SlotId> {
        let mut stuck = Vec::new();
        for (&id, cell) in &self.cells {
            let mut runtime = cell.runtime.lock().await;
            match self
                .reclaimer
                .reclaim(id, &mut runtime, ReclaimTrigger::Reset, SYSTEM_ACTOR, true)
                .await
            {
                Ok(outcome) if outcome.is_idle() => {}
                Ok(_) => stuck.push(id),
                Err(e) => {
                    tracing::error!(slot = %id, error = %e, "Reset failed");
                    stuck.push(id);
                }
            }
        }
        if stuck.is_empty() {
            tracing::info!(slots = self.cells.len(), "All slots reset to IDLE");
        } else {
            tracing::warn!(?stuck, "Reset left slots in ERROR");
        }
        stuck
    }

    /// Startup reconciliation: reset every slot, mark READY and start the
    /// periodic sweep.
    pub async fn start(self: &Arc<Self>) {
        self.reset_all().await;
        *self.health.write().await = Health::Ready;
        self.spawn_sweeper();
        tracing::info!(
            slots = self.cells.len(),
            base_port = self.config.base_port,
            "Slot manager ready"
        );
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.shutdown.child_token();
        let interval = self.config.sweep_interval;
        let max_age = self.config.max_artifact_age;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let report = manager.sweep(max_age).await;
                if !report.reclaimed.is_empty() || !report.failed.is_empty() {
                    tracing::info!(
                        reclaimed = report.reclaimed.len(),
                        failed = report.failed.len(),
                        strays = report.strays_removed,
                        "Sweep finished"
                    );
                }
            }
            tracing::debug!("Sweeper stopped");
        });
    }

    /// Stop accepting work and cancel every liveness channel, watchdog and
    /// the sweeper. Slots keep their workers until [`shutdown`](Self::shutdown).
    pub async fn begin_shutdown(&self) {
        *self.health.write().await = Health::ShuttingDown;
        self.shutdown.cancel();
    }

    /// [`begin_shutdown`](Self::begin_shutdown), then reset all slots.
    pub async fn shutdown(&self) {
        self.begin_shutdown().await;
        self.reset_all().await;
    }

    pub async fn health(&self) -> HealthSnapshot {
        let state = *self.health.read().await;
        let idle_slots = match self.store.list().await {
            Ok(slots) => slots
                .iter()
                .filter(|s| s.status == SlotStatus::Idle)
                .count(),
            Err(e) => {
                tracing::warn!(error = %e, "Health check could not read slots");
                0
            }
        };
        HealthSnapshot {
            state,
            total_slots: self.cells.len(),
            idle_slots,
            version: self.version.clone(),
        }
    }

    /// Ask the server to shut down (e.g. from a `/shutdown` request).
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    async fn record(&self, id: SlotId, actor: &str, action: ActivityAction, detail: Option<String>) {
        if let Err(e) = self.store.log_activity(id, actor, action, detail).await {
            tracing::warn!(slot = %id, %action, error = %e, "Failed to record activity");
        }
    }
}

/// A liveness channel binding returned by [`SlotManager::open_liveness`].
///
/// Drive it with [`LivenessLease::run`]. Dropping an unused lease releases
/// the binding as if the channel had closed.
pub struct LivenessLease {
    manager: Option<Arc<SlotManager>>,
    slot: SlotId,
    binding: u64,
    cancel: CancellationToken,
}

impl LivenessLease {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Supervise the channel until it ends; reclaims the slot if liveness was
    /// lost and this channel is still the slot's current binding.
    pub async fn run<Tx, Rx, E>(mut self, tx: Tx, rx: Rx) -> ChannelOutcome
    where
        Tx: Sink<HeartbeatFrame>,
        Rx: Stream<Item = Result<Inbound, E>>,
        E: std::fmt::Display,
    {
        let Some(manager) = self.manager.take() else {
            return ChannelOutcome::Cancelled;
        };
        let slot = self.slot;
        let store = manager.store.clone();
        let outcome = manager
            .monitor
            .run(slot, tx, rx, self.cancel.clone(), move || {
                let store = store.clone();
                async move {
                    if let Err(e) = store.touch(slot).await {
                        tracing::warn!(%slot, error = %e, "Failed to record heartbeat");
                    }
                }
            })
            .await;
        manager.liveness_ended(slot, self.binding, outcome).await;
        outcome
    }
}

impl Drop for LivenessLease {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        self.cancel.cancel();
        let (slot, binding) = (self.slot, self.binding);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager
                    .liveness_ended(slot, binding, ChannelOutcome::Closed)
                    .await;
            });
        }
    }
}
