//! Test doubles shared by unit tests.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{HeartbeatConfig, PoolConfig};
use crate::manager::SlotManager;
use crate::store::SlotStore;
use crate::worker::{LaunchError, LaunchRequest, ProcessSupervisor, WorkerSpawner, configure};

/// Spawns `sh -c <script>` for every launch.
pub(crate) struct ShellSpawner {
    script: String,
    launches: AtomicUsize,
}

impl ShellSpawner {
    pub(crate) fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            launches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ShellSpawner {
    fn spawn(&self, request: &LaunchRequest) -> Result<Child, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .env("SLOT_ID", request.slot_id.to_string())
            .env("SLOT_PORT", request.port.to_string());
        Ok(configure(cmd).spawn()?)
    }
}

/// A pool manager backed by an in-memory store and a temp artifact root.
pub(crate) struct TestPool {
    pub manager: Arc<SlotManager>,
    pub spawner: Arc<ShellSpawner>,
    pub root: tempfile::TempDir,
}

pub(crate) fn test_config(root: &std::path::Path) -> PoolConfig {
    PoolConfig::default()
        .with_pool_size(5)
        // Ports nothing listens on, so readiness always waits out the grace.
        .with_base_port(1)
        .with_artifacts_root(root)
        .with_public_host("127.0.0.1")
        .with_heartbeat(HeartbeatConfig {
            ping_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30),
        })
        .with_liveness_grace(None)
        .with_launch_grace(Duration::from_millis(300))
        .with_stop_grace(Duration::from_secs(2))
}

pub(crate) async fn test_pool_with(
    script: &str,
    adjust: impl FnOnce(PoolConfig) -> PoolConfig,
) -> TestPool {
    let root = tempfile::tempdir().unwrap();
    let config = adjust(test_config(root.path()));
    let spawner = Arc::new(ShellSpawner::new(script));
    let supervisor = ProcessSupervisor::new(spawner.clone())
        .with_launch_grace(config.launch_grace)
        .with_stop_grace(config.stop_grace);
    let store = SlotStore::open_in_memory().unwrap();
    let manager = SlotManager::new(config, store, supervisor).await.unwrap();
    TestPool {
        manager,
        spawner,
        root,
    }
}

pub(crate) async fn test_pool() -> TestPool {
    test_pool_with("exec sleep 30", |c| c).await
}

/// A `sleep` leading its own process group, standing in for a worker left by
/// an earlier process. The returned task reaps it once it dies.
pub(crate) fn spawn_orphan() -> (u32, JoinHandle<std::io::Result<ExitStatus>>) {
    let mut cmd = Command::new("sleep");
    cmd.arg("30")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .process_group(0);
    let mut child = cmd.spawn().unwrap();
    let pid = child.id().unwrap();
    (pid, tokio::spawn(async move { child.wait().await }))
}
