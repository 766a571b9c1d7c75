use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::Stream;
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::Serialize;
use tokio::{
    process::Child,
    sync::{Mutex, RwLock},
};

use crate::{
    config::{LIVENESS_POLL_INTERVAL, SHUTDOWN_POLL_INTERVAL, VM_SHUTDOWN_TIMEOUT},
    SandplaneResult,
};

use super::{sample_process, ResourceUsage};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a VM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// The VM process is running.
    Running,

    /// The VM process has exited.
    Exited,
}

/// The terminal result of a VM task, emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitResult {
    /// The process exit code, if the process was reaped by us.
    pub exit_code: Option<i32>,

    /// A description of an abnormal end, if any.
    pub error: Option<String>,
}

/// A point-in-time snapshot of a task's state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// The scheduler-assigned task id.
    pub task_id: String,

    /// The owning sandbox's id.
    pub sandbox_id: String,

    /// Current lifecycle state.
    pub state: TaskState,

    /// When the VM process started.
    pub started_at: DateTime<Utc>,

    /// When the VM process exited, if it has.
    pub completed_at: Option<DateTime<Utc>>,

    /// The exit result, once exited.
    pub exit_result: Option<ExitResult>,

    /// PID of the VM process wrapper.
    pub pid: u32,

    /// The VM's control socket path.
    pub socket_path: PathBuf,

    /// The network namespace the VM runs in.
    pub netns_name: String,
}

/// Handle to a running sandbox VM process.
///
/// Cheap to clone; all clones share the same state. The mutable portion
/// (state transitions) sits behind a read/write lock that is only held for
/// the duration of a snapshot or transition, never across a sleep.
#[derive(Debug, Clone)]
pub struct VmHandle {
    /// The scheduler-assigned task id.
    task_id: String,

    /// The owning sandbox's id.
    sandbox_id: String,

    /// PID of the VM process wrapper (the `unshare` child).
    pid: u32,

    /// The VM's control socket path.
    socket_path: PathBuf,

    /// The network namespace the VM runs in.
    netns_name: String,

    /// When the VM process started.
    started_at: DateTime<Utc>,

    /// Transition-guarded state.
    state: Arc<RwLock<HandleState>>,

    /// The spawned child, consumed when reaped.
    child: Arc<Mutex<Option<Child>>>,
}

#[derive(Debug)]
struct HandleState {
    state: TaskState,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmHandle {
    /// Creates a handle for a freshly launched VM process.
    pub fn new(
        task_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        pid: u32,
        child: Child,
        socket_path: impl Into<PathBuf>,
        netns_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sandbox_id: sandbox_id.into(),
            pid,
            socket_path: socket_path.into(),
            netns_name: netns_name.into(),
            started_at: Utc::now(),
            state: Arc::new(RwLock::new(HandleState {
                state: TaskState::Running,
                completed_at: None,
                exit_result: None,
            })),
            child: Arc::new(Mutex::new(Some(child))),
        }
    }

    /// The owning sandbox's id.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The scheduler-assigned task id.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The VM process wrapper's PID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns a snapshot of the task's state.
    pub async fn status(&self) -> TaskStatus {
        let state = self.state.read().await;
        TaskStatus {
            task_id: self.task_id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            state: state.state,
            started_at: self.started_at,
            completed_at: state.completed_at,
            exit_result: state.exit_result.clone(),
            pid: self.pid,
            socket_path: self.socket_path.clone(),
            netns_name: self.netns_name.clone(),
        }
    }

    /// Whether the handle believes the VM is still running.
    pub async fn is_running(&self) -> bool {
        matches!(self.state.read().await.state, TaskState::Running) && process_alive(self.pid)
    }

    /// Emits one resource usage sample per `interval` until the process
    /// exits or the stream is dropped.
    ///
    /// Transient read failures (the process may be mid-exit) are logged and
    /// skipped; the interval keeps ticking.
    pub fn stats(&self, interval: Duration) -> impl Stream<Item = ResourceUsage> {
        let handle = self.clone();

        async_stream::stream! {
            let mut tracker = sandutils::CpuPercentTracker::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !matches!(handle.state.read().await.state, TaskState::Running) {
                    break;
                }

                match sample_process(handle.pid).await {
                    Ok(sample) => {
                        let percent = tracker.percent(sample.user_ticks + sample.system_ticks);
                        yield ResourceUsage::from_sample(sample, percent);
                    }
                    Err(e) => {
                        if !process_alive(handle.pid) {
                            break;
                        }
                        tracing::warn!(
                            pid = handle.pid,
                            error = %e,
                            "transient stats read failure, skipping sample"
                        );
                    }
                }
            }
        }
    }

    /// Polls the VM process for liveness and emits exactly one [`ExitResult`]
    /// once it is no longer reachable.
    pub fn wait(&self) -> impl Stream<Item = ExitResult> {
        let handle = self.clone();

        async_stream::stream! {
            loop {
                let committed = handle.state.read().await.exit_result.clone();
                if let Some(result) = committed {
                    yield result;
                    break;
                }

                if !process_alive(handle.pid) {
                    let result = handle.reap_and_commit(None).await;
                    yield result;
                    break;
                }

                tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
            }
        }
    }

    /// Shuts the VM process down: SIGTERM, a grace period, then SIGKILL, and
    /// reaps the child.
    ///
    /// Idempotent; a second call (or a call racing a natural exit) observes
    /// the committed exit and changes nothing.
    pub async fn shutdown(&self) -> SandplaneResult<()> {
        if matches!(self.state.read().await.state, TaskState::Exited) {
            return Ok(());
        }

        tracing::info!(pid = self.pid, sandbox_id = %self.sandbox_id, "shutting down VM");

        if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), signal::Signal::SIGTERM) {
            if e != Errno::ESRCH {
                tracing::warn!(pid = self.pid, error = %e, "failed to send SIGTERM");
            }
        }

        let deadline = tokio::time::Instant::now() + VM_SHUTDOWN_TIMEOUT;
        while process_alive(self.pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        if process_alive(self.pid) {
            tracing::warn!(pid = self.pid, "VM ignored SIGTERM, sending SIGKILL");
            if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), signal::Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    tracing::warn!(pid = self.pid, error = %e, "failed to send SIGKILL");
                }
            }
        }

        self.reap_and_commit(None).await;
        Ok(())
    }

    /// Reaps the child process (if still held) and commits the terminal
    /// state. Returns the committed result; an already-committed exit wins.
    async fn reap_and_commit(&self, error: Option<String>) -> ExitResult {
        let exit_code = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::warn!(pid = self.pid, error = %e, "failed to reap VM child");
                        None
                    }
                },
                None => None,
            }
        };

        let mut state = self.state.write().await;
        if let Some(existing) = &state.exit_result {
            return existing.clone();
        }

        let result = ExitResult { exit_code, error };
        state.state = TaskState::Exited;
        state.completed_at = Some(Utc::now());
        state.exit_result = Some(result.clone());

        tracing::info!(
            pid = self.pid,
            sandbox_id = %self.sandbox_id,
            exit_code = ?result.exit_code,
            "VM exited"
        );

        result
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether a process is still reachable, via `/proc` and a null
/// signal probe.
pub fn process_alive(pid: u32) -> bool {
    if !std::path::Path::new(&format!("/proc/{}", pid)).exists() {
        return false;
    }

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::process::Command;

    fn spawn_sleeper() -> (Child, u32) {
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id().expect("child has a pid");
        (child, pid)
    }

    fn handle_for(child: Child, pid: u32) -> VmHandle {
        VmHandle::new("task-1", "sb-1", pid, child, "/tmp/api.sock", "ns-0")
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (child, pid) = spawn_sleeper();
        let handle = handle_for(child, pid);

        let status = handle.status().await;
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(status.pid, pid);
        assert!(status.completed_at.is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_commits_exit() {
        let (child, pid) = spawn_sleeper();
        let handle = handle_for(child, pid);

        handle.shutdown().await.unwrap();

        let status = handle.status().await;
        assert_eq!(status.state, TaskState::Exited);
        assert!(status.completed_at.is_some());
        assert!(status.exit_result.is_some());
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (child, pid) = spawn_sleeper();
        let handle = handle_for(child, pid);

        handle.shutdown().await.unwrap();
        let first = handle.status().await.completed_at;

        handle.shutdown().await.unwrap();
        let second = handle.status().await.completed_at;

        assert_eq!(first, second, "completed_at must not move on re-shutdown");
    }

    #[tokio::test]
    async fn test_wait_observes_shutdown() {
        let (child, pid) = spawn_sleeper();
        let handle = handle_for(child, pid);

        let waiter = handle.clone();
        let wait_task = tokio::spawn(async move {
            let mut stream = std::pin::pin!(waiter.wait());
            stream.next().await
        });

        handle.shutdown().await.unwrap();

        let result = wait_task.await.unwrap();
        assert!(result.is_some(), "wait must emit one exit result");
    }

    #[tokio::test]
    async fn test_wait_detects_natural_exit() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        let handle = handle_for(child, pid);

        let mut stream = std::pin::pin!(handle.wait());
        let result = stream.next().await.expect("exit result");
        assert_eq!(result.exit_code, Some(0));

        assert_eq!(handle.status().await.state, TaskState::Exited);
    }

    #[test]
    fn test_process_alive_for_missing_pid() {
        // PIDs wrap well below this value.
        assert!(!process_alive(u32::MAX - 1));
    }
}
