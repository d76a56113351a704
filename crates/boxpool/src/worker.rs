//! Process supervision for slot workers.
//!
//! A worker is the external admin tool bound to one slot's port and artifact
//! directory. The supervisor spawns it in its own process group, forwards its
//! output to tracing, and tears the whole group down on terminate.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::slot::SlotId;

/// Interval between readiness probes during the launch grace period.
const READINESS_POLL: Duration = Duration::from_millis(100);

/// How long to wait for the process to be reaped after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub slot_id: SlotId,
    pub port: u16,
    pub artifact_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker exited during launch grace period: {0}")]
    ExitedEarly(ExitStatus),
    #[error("worker process has no pid")]
    NoPid,
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("worker {pid} still alive after SIGKILL")]
    Unkillable { pid: u32 },
}

/// Spawns the worker process for a launch request.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, request: &LaunchRequest) -> Result<Child, LaunchError>;
}

/// Runs the admin launcher script:
/// `<launcher> --instance-id <id> --nginx-port <port> --db-path <dir>`,
/// from the launcher's own directory.
pub struct ScriptSpawner {
    launcher: PathBuf,
    interpreter: Option<PathBuf>,
}

impl ScriptSpawner {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            interpreter: None,
        }
    }

    /// Run the launcher through an interpreter (e.g. `sh`) instead of
    /// executing it directly.
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }
}

impl WorkerSpawner for ScriptSpawner {
    fn spawn(&self, request: &LaunchRequest) -> Result<Child, LaunchError> {
        // The working directory changes below, so relative paths must be
        // resolved first.
        let launcher = std::path::absolute(&self.launcher)?;
        let artifact_dir = std::path::absolute(&request.artifact_dir)?;

        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&launcher);
                cmd
            }
            None => Command::new(&launcher),
        };
        cmd.arg("--instance-id")
            .arg(request.slot_id.to_string())
            .arg("--nginx-port")
            .arg(request.port.to_string())
            .arg("--db-path")
            .arg(&artifact_dir);
        if let Some(dir) = launcher.parent() {
            cmd.current_dir(dir);
        }
        Ok(configure(cmd).spawn()?)
    }
}

/// Common process settings for every worker: own process group, piped
/// output, no stdin.
pub(crate) fn configure(mut cmd: Command) -> Command {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// A launched worker owned by the supervisor on behalf of one slot.
pub struct WorkerHandle {
    slot_id: SlotId,
    pid: u32,
    child: Child,
    output: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("slot_id", &self.slot_id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Opaque reference persisted in the slot store.
    pub fn reference(&self) -> String {
        self.pid.to_string()
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(slot = %self.slot_id, pid = self.pid, error = %e, "try_wait failed; treating worker as gone");
                // Can't observe the child any more; it is not ours to supervise.
                Some(ExitStatus::default())
            }
        }
    }

    fn stop_output(&mut self) {
        for task in self.output.drain(..) {
            task.abort();
        }
    }
}

/// Launches, tracks and terminates slot workers.
pub struct ProcessSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    launch_grace: Duration,
    stop_grace: Duration,
    cleanup_command: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            launch_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            cleanup_command: None,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        let supervisor = Self::new(Arc::new(ScriptSpawner::new(&config.launcher)))
            .with_launch_grace(config.launch_grace)
            .with_stop_grace(config.stop_grace);
        match &config.cleanup_command {
            Some(command) => supervisor.with_cleanup_command(command),
            None => supervisor,
        }
    }

    pub fn with_launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_cleanup_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.cleanup_command = Some(command.into());
        self
    }

    /// Spawn the worker and wait out the launch grace period.
    ///
    /// Success means the process exists and accepts signals. A worker that
    /// exits during the grace period is torn down and reported as
    /// [`LaunchError::ExitedEarly`].
    pub async fn launch(&self, request: &LaunchRequest) -> Result<WorkerHandle, LaunchError> {
        let mut child = self.spawner.spawn(request)?;
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(LaunchError::NoPid);
        };

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(forward_output(request.slot_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(forward_output(request.slot_id, "stderr", stderr));
        }

        let mut handle = WorkerHandle {
            slot_id: request.slot_id,
            pid,
            child,
            output,
        };
        tracing::info!(slot = %request.slot_id, pid, port = request.port, "Worker spawned");

        if let Err(e) = self.await_readiness(&mut handle, request.port).await {
            // Leftover group members must not outlive a failed launch.
            if let Err(te) = self.terminate(&mut handle).await {
                tracing::error!(slot = %request.slot_id, error = %te, "Failed to tear down worker after launch failure");
            }
            return Err(e);
        }
        Ok(handle)
    }

    async fn await_readiness(&self, handle: &mut WorkerHandle, port: u16) -> Result<(), LaunchError> {
        let deadline = Instant::now() + self.launch_grace;
        loop {
            if let Some(status) = handle.exit_status() {
                tracing::warn!(slot = %handle.slot_id, pid = handle.pid, %status, "Worker exited during launch");
                return Err(LaunchError::ExitedEarly(status));
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                tracing::debug!(slot = %handle.slot_id, port, "Worker port accepting connections");
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!(slot = %handle.slot_id, "Launch grace elapsed; worker still running");
                return Ok(());
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    pub fn is_alive(&self, handle: &mut WorkerHandle) -> bool {
        handle.exit_status().is_none()
    }

    /// SIGTERM the worker's process group, then SIGKILL after the stop grace
    /// period. A worker that is already gone is not an error.
    pub async fn terminate(&self, handle: &mut WorkerHandle) -> Result<(), TerminateError> {
        let slot = handle.slot_id;
        let pid = handle.pid;

        if let Some(status) = handle.exit_status() {
            tracing::debug!(%slot, pid, %status, "Worker already exited");
            signal_group(pid, Signal::Kill);
            handle.stop_output();
            return Ok(());
        }

        signal_group(pid, Signal::Term);
        match tokio::time::timeout(self.stop_grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%slot, pid, %status, "Worker stopped");
            }
            Ok(Err(e)) => {
                tracing::debug!(%slot, pid, error = %e, "Wait on worker failed; treating as gone");
            }
            Err(_) => {
                tracing::warn!(%slot, pid, grace = ?self.stop_grace, "Worker ignored SIGTERM, sending SIGKILL");
                signal_group(pid, Signal::Kill);
                let _ = handle.child.start_kill();
                if tokio::time::timeout(KILL_WAIT, handle.child.wait())
                    .await
                    .is_err()
                {
                    tracing::error!(%slot, pid, "Worker survived SIGKILL");
                    return Err(TerminateError::Unkillable { pid });
                }
                tracing::info!(%slot, pid, "Worker killed");
            }
        }
        // Reap whatever else the worker left in its group.
        signal_group(pid, Signal::Kill);
        handle.stop_output();
        Ok(())
    }

    /// Stop a worker known only by the pid recorded in the store, e.g. one
    /// left behind by an earlier boxpool process. Same SIGTERM/SIGKILL
    /// sequence as [`terminate`](Self::terminate), applied to the process
    /// group led by `pid`. A group that no longer exists is not an error.
    pub async fn terminate_orphan(&self, slot: SlotId, pid: u32) -> Result<(), TerminateError> {
        if !group_exists(pid) {
            tracing::debug!(%slot, pid, "Recorded worker already gone");
            return Ok(());
        }

        tracing::warn!(%slot, pid, "Stopping orphaned worker group");
        signal_group(pid, Signal::Term);
        if wait_group_gone(pid, self.stop_grace).await {
            tracing::info!(%slot, pid, "Orphaned worker stopped");
            return Ok(());
        }

        tracing::warn!(%slot, pid, grace = ?self.stop_grace, "Orphaned worker ignored SIGTERM, sending SIGKILL");
        signal_group(pid, Signal::Kill);
        if wait_group_gone(pid, KILL_WAIT).await {
            tracing::info!(%slot, pid, "Orphaned worker killed");
            return Ok(());
        }
        tracing::error!(%slot, pid, "Orphaned worker survived SIGKILL");
        Err(TerminateError::Unkillable { pid })
    }

    /// Run the external teardown hook for a slot, if configured.
    pub async fn cleanup(&self, slot_id: SlotId) -> io::Result<()> {
        let Some(command) = &self.cleanup_command else {
            return Ok(());
        };
        run_cleanup(command, slot_id, self.stop_grace).await
    }
}

async fn run_cleanup(command: &Path, slot_id: SlotId, timeout: Duration) -> io::Result<()> {
    let mut cmd = Command::new(command);
    cmd.arg("--instance-id")
        .arg(slot_id.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "cleanup command timed out"))??;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::debug!(target: "boxpool::worker", slot = %slot_id, stream = "cleanup", "{}", line);
    }
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "cleanup command exited with {}",
            output.status
        )))
    }
}

fn forward_output<R>(slot_id: SlotId, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "boxpool::worker", slot = %slot_id, stream, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(slot = %slot_id, stream, error = %e, "Worker output read failed");
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    let pid = Pid::from_raw(raw);
    // The worker leads its own group, so the group id equals its pid.
    match signal::killpg(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid = raw, ?sig, error = %e, "killpg failed"),
    }
    let _ = signal::kill(pid, sig);
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// Whether a process group led by `pid` still has members. Pids that can
/// never name a worker group (0, init, our own group) report false.
#[cfg(unix)]
fn group_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::{Pid, getpgrp};

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 1 || Pid::from_raw(raw) == getpgrp() {
        return false;
    }
    match signal::killpg(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn group_exists(_pid: u32) -> bool {
    false
}

async fn wait_group_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !group_exists(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ShellSpawner, spawn_orphan};

    fn request(dir: &Path) -> LaunchRequest {
        LaunchRequest {
            slot_id: SlotId::new(1),
            port: 1,
            artifact_dir: dir.to_path_buf(),
        }
    }

    fn supervisor(script: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(ShellSpawner::new(script)))
            .with_launch_grace(Duration::from_millis(300))
            .with_stop_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn launch_then_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("exec sleep 30");

        let mut handle = supervisor.launch(&request(dir.path())).await.unwrap();
        assert!(supervisor.is_alive(&mut handle));
        assert_eq!(handle.reference(), handle.pid().to_string());

        supervisor.terminate(&mut handle).await.unwrap();
        assert!(!supervisor.is_alive(&mut handle));
    }

    #[tokio::test]
    async fn exited_worker_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("echo boom >&2; exit 3");

        let err = supervisor.launch(&request(dir.path())).await.unwrap_err();
        match err {
            LaunchError::ExitedEarly(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_launcher_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(Arc::new(ScriptSpawner::new(
            dir.path().join("does-not-exist.sh"),
        )));
        assert!(matches!(
            supervisor.launch(&request(dir.path())).await,
            Err(LaunchError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn terminate_tolerates_crashed_worker() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("exec sleep 30");
        let mut handle = supervisor.launch(&request(dir.path())).await.unwrap();

        handle.child.start_kill().unwrap();
        handle.child.wait().await.unwrap();

        supervisor.terminate(&mut handle).await.unwrap();
        supervisor.terminate(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn sigterm_ignoring_worker_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("trap '' TERM; while true; do sleep 1; done")
            .with_stop_grace(Duration::from_millis(200));
        let mut handle = supervisor.launch(&request(dir.path())).await.unwrap();

        supervisor.terminate(&mut handle).await.unwrap();
        assert!(!supervisor.is_alive(&mut handle));
    }

    #[tokio::test]
    async fn script_spawner_passes_slot_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = dir.path().join("admin.sh");
        std::fs::write(&launcher, "echo \"$@\" > args.txt\nexec sleep 30\n").unwrap();
        let artifact_dir = dir.path().join("instance_4/objectbox");

        let supervisor = ProcessSupervisor::new(Arc::new(
            ScriptSpawner::new(&launcher).with_interpreter("sh"),
        ))
        .with_launch_grace(Duration::from_millis(300));
        let mut handle = supervisor
            .launch(&LaunchRequest {
                slot_id: SlotId::new(4),
                port: 1,
                artifact_dir: artifact_dir.clone(),
            })
            .await
            .unwrap();

        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "--instance-id 4 --nginx-port 1 --db-path {}",
                artifact_dir.display()
            )
        );
        supervisor.terminate(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn successful_cleanup_command() {
        run_cleanup(Path::new("true"), SlotId::new(2), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_cleanup_command_is_reported() {
        let err = run_cleanup(Path::new("false"), SlotId::new(1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn terminate_orphan_stops_recorded_group() {
        let (pid, reaper) = spawn_orphan();
        let supervisor = supervisor("exec sleep 30").with_stop_grace(Duration::from_secs(2));

        supervisor
            .terminate_orphan(SlotId::new(2), pid)
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), reaper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!group_exists(pid));
    }

    #[tokio::test]
    async fn terminate_orphan_of_missing_group_is_ok() {
        let supervisor = supervisor("exec sleep 30");
        supervisor
            .terminate_orphan(SlotId::new(1), i32::MAX as u32)
            .await
            .unwrap();
    }

    #[test]
    fn own_group_and_init_never_count_as_workers() {
        assert!(!group_exists(0));
        assert!(!group_exists(1));
        assert!(!group_exists(nix::unistd::getpgrp().as_raw() as u32));
    }

    #[tokio::test]
    async fn no_cleanup_command_is_a_noop() {
        let supervisor = supervisor("exec sleep 30");
        supervisor.cleanup(SlotId::new(1)).await.unwrap();
    }
}
