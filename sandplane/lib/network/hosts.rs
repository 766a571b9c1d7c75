use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use tokio::sync::Mutex;

use crate::SandplaneResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Serialized writer for the shared hosts file.
///
/// The hosts file is a process-global resource; every mutation takes the
/// internal mutex, rewrites the file to a temporary sibling, and renames it
/// into place so readers never observe a partial write.
#[derive(Debug)]
pub struct HostsFile {
    /// Path of the hosts file.
    path: PathBuf,

    /// Serializes all mutations.
    lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostsFile {
    /// Creates a writer over the hosts file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Adds (or replaces) the entry mapping `ip` to `sandbox_id`.
    pub async fn add(&self, ip: Ipv4Addr, sandbox_id: &str) -> SandplaneResult<()> {
        let _guard = self.lock.lock().await;

        let mut lines = self.read_lines().await?;
        lines.retain(|line| !line_names(line, sandbox_id));
        lines.push(format!("{}\t{}", ip, sandbox_id));

        self.write_lines(&lines).await
    }

    /// Removes any entry naming `sandbox_id`. Removing an absent entry is a
    /// no-op.
    pub async fn remove(&self, sandbox_id: &str) -> SandplaneResult<()> {
        let _guard = self.lock.lock().await;

        let mut lines = self.read_lines().await?;
        let before = lines.len();
        lines.retain(|line| !line_names(line, sandbox_id));

        if lines.len() == before {
            return Ok(());
        }

        self.write_lines(&lines).await
    }

    /// Returns whether the file currently has an entry for `sandbox_id`.
    pub async fn contains(&self, sandbox_id: &str) -> SandplaneResult<bool> {
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        Ok(lines.iter().any(|line| line_names(line, sandbox_id)))
    }

    async fn read_lines(&self) -> SandplaneResult<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lines(&self, lines: &[String]) -> SandplaneResult<()> {
        let mut contents = lines.join("\n");
        contents.push('\n');

        let tmp_path = self.path.with_extension("sandplane.tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn line_names(line: &str, sandbox_id: &str) -> bool {
    line.split_whitespace().skip(1).any(|name| name == sandbox_id)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_remove_entry() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1\tlocalhost\n").await?;

        let hosts = HostsFile::new(&path);
        hosts.add(Ipv4Addr::new(192, 168, 7, 1), "sb-1").await?;
        assert!(hosts.contains("sb-1").await?);

        let contents = tokio::fs::read_to_string(&path).await?;
        assert!(contents.contains("127.0.0.1\tlocalhost"));
        assert!(contents.contains("192.168.7.1\tsb-1"));

        hosts.remove("sb-1").await?;
        assert!(!hosts.contains("sb-1").await?);

        let contents = tokio::fs::read_to_string(&path).await?;
        assert!(contents.contains("localhost"));
        assert!(!contents.contains("sb-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_add_replaces_stale_entry() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hosts");

        let hosts = HostsFile::new(&path);
        hosts.add(Ipv4Addr::new(192, 168, 1, 1), "sb-1").await?;
        hosts.add(Ipv4Addr::new(192, 168, 2, 1), "sb-1").await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        assert!(!contents.contains("192.168.1.1"));
        assert!(contents.contains("192.168.2.1\tsb-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_missing_entry_is_noop() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let hosts = HostsFile::new(dir.path().join("hosts"));
        hosts.remove("sb-unknown").await?;
        Ok(())
    }
}
