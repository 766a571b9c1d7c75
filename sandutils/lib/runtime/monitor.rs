use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::ChildStderr;
use tokio::process::ChildStdout;

use crate::SandutilsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A trait for monitoring a spawned child process's output.
///
/// Implementations take ownership of the child's stdout/stderr pipes and
/// forward them somewhere useful (a log file, the tracing layer). `stop` is
/// called once the process is gone and must release any held resources.
#[async_trait]
pub trait ProcessMonitor {
    /// Start monitoring a process
    async fn start(
        &mut self,
        pid: u32,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        log_path: PathBuf,
    ) -> SandutilsResult<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> SandutilsResult<()>;
}
