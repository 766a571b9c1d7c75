use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use sandutils::{ProcessMonitor, RotatingLog, SandutilsResult};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::Mutex,
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Streams a VM's console output into a rotating log file and the tracing
/// layer.
///
/// The hypervisor writes guest console output and its own diagnostics to
/// stdout/stderr; both are captured line by line. The forwarding tasks end on
/// their own when the pipes close with the process.
pub struct VmLogMonitor {
    /// The owning sandbox's id, attached to every log line.
    sandbox_id: String,

    /// The spawned forwarding tasks.
    tasks: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmLogMonitor {
    /// Creates a monitor for the given sandbox.
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            tasks: Vec::new(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProcessMonitor for VmLogMonitor {
    async fn start(
        &mut self,
        pid: u32,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        log_path: PathBuf,
    ) -> SandutilsResult<()> {
        let log = Arc::new(Mutex::new(RotatingLog::new(&log_path).await?));

        if let Some(stdout) = stdout {
            let log = log.clone();
            let sandbox_id = self.sandbox_id.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(sandbox_id = %sandbox_id, pid, "[vm stdout] {}", line);
                    write_line(&log, &line).await;
                }
            }));
        }

        if let Some(stderr) = stderr {
            let log = log.clone();
            let sandbox_id = self.sandbox_id.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(sandbox_id = %sandbox_id, pid, "[vm stderr] {}", line);
                    write_line(&log, &line).await;
                }
            }));
        }

        Ok(())
    }

    async fn stop(&mut self) -> SandutilsResult<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn write_line(log: &Arc<Mutex<RotatingLog>>, line: &str) {
    let mut log = log.lock().await;
    if let Err(e) = log.write_all(format!("{}\n", line).as_bytes()).await {
        tracing::error!(error = %e, "failed to write VM console log");
    }
    if let Err(e) = log.flush().await {
        tracing::error!(error = %e, "failed to flush VM console log");
    }
}
