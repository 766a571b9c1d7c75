//! Log rotation for VM console output.
//!
//! A rotating log file that renames the current file to a `.old` sibling when
//! it exceeds a maximum size and continues writing to a fresh file. Only one
//! generation is kept; the previous `.old` file is overwritten on rotation.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default maximum size of a log file before rotation, in bytes.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A log file that rotates once it grows past a maximum size.
///
/// ## Examples
///
/// ```no_run
/// use sandutils::log::RotatingLog;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let mut log = RotatingLog::new("console.log").await?;
///     log.write_all(b"vm booted\n").await?;
///     Ok(())
/// }
/// ```
pub struct RotatingLog {
    /// The current log file being written to
    file: File,

    /// Path to the current log file
    path: PathBuf,

    /// Maximum size in bytes before rotation
    max_size: u64,

    /// Bytes written to the current file
    current_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Creates a new rotating log with the default maximum size.
    pub async fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Creates a new rotating log with the given maximum size in bytes.
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let current_size = file.metadata().await?.len();

        Ok(Self {
            file,
            path,
            max_size,
            current_size,
        })
    }

    /// Writes a buffer to the log, rotating first if the write would push the
    /// file past the maximum size.
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate().await?;
        }

        self.file.write_all(buf).await?;
        self.current_size += buf.len() as u64;
        Ok(())
    }

    /// Flushes buffered writes to disk.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    /// Returns the path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;

        let old_path = self.path.with_extension(format!(
            "{}.old",
            self.path
                .extension()
                .unwrap_or_default()
                .to_str()
                .unwrap_or("")
        ));

        if let Err(e) = tokio::fs::rename(&self.path, &old_path).await {
            tracing::warn!("failed to rotate log file {}: {}", self.path.display(), e);
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        self.current_size = 0;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rotating_log_appends() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.log");

        let mut log = RotatingLog::new(&path).await?;
        log.write_all(b"hello\n").await?;
        log.write_all(b"world\n").await?;
        log.flush().await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents, "hello\nworld\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_rotating_log_rotates_at_max_size() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.log");

        let mut log = RotatingLog::with_max_size(&path, 8).await?;
        log.write_all(b"aaaa").await?;
        log.write_all(b"bbbb").await?;
        // Third write exceeds the max and triggers rotation.
        log.write_all(b"cccc").await?;
        log.flush().await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents, "cccc");

        let old = tokio::fs::read_to_string(path.with_extension("log.old")).await?;
        assert_eq!(old, "aaaabbbb");
        Ok(())
    }
}
