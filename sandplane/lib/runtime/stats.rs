use chrono::{DateTime, Utc};
use getset::Getters;
use serde::Serialize;

use crate::{SandplaneError, SandplaneResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One resource usage sample of a running VM process.
#[derive(Debug, Clone, Getters, Serialize)]
#[getset(get = "pub with_prefix")]
pub struct ResourceUsage {
    /// When the sample was taken.
    timestamp: DateTime<Utc>,

    /// Cumulative user-mode CPU ticks.
    cpu_user_ticks: u64,

    /// Cumulative kernel-mode CPU ticks.
    cpu_system_ticks: u64,

    /// Cumulative total CPU ticks.
    cpu_total_ticks: u64,

    /// CPU usage over the previous sampling interval, percent of one core.
    cpu_percent: f64,

    /// Resident set size in bytes.
    memory_rss_bytes: u64,

    /// Swapped-out memory in bytes.
    memory_swap_bytes: u64,
}

/// Raw counters read from `/proc/{pid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcSample {
    /// User-mode CPU ticks.
    pub user_ticks: u64,

    /// Kernel-mode CPU ticks.
    pub system_ticks: u64,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Swapped-out memory in bytes.
    pub swap_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceUsage {
    /// Builds a sample from raw counters and a computed CPU percentage.
    pub fn from_sample(sample: ProcSample, cpu_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_user_ticks: sample.user_ticks,
            cpu_system_ticks: sample.system_ticks,
            cpu_total_ticks: sample.user_ticks + sample.system_ticks,
            cpu_percent,
            memory_rss_bytes: sample.rss_bytes,
            memory_swap_bytes: sample.swap_bytes,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads CPU and memory counters of `pid` from `/proc`.
pub async fn sample_process(pid: u32) -> SandplaneResult<ProcSample> {
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await?;
    let (user_ticks, system_ticks) = parse_stat(&stat)?;

    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await?;
    let rss_bytes = parse_status_kb(&status, "VmRSS:").unwrap_or(0) * 1024;
    let swap_bytes = parse_status_kb(&status, "VmSwap:").unwrap_or(0) * 1024;

    Ok(ProcSample {
        user_ticks,
        system_ticks,
        rss_bytes,
        swap_bytes,
    })
}

/// Extracts utime and stime from a `/proc/{pid}/stat` line.
///
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the closing paren.
fn parse_stat(stat: &str) -> SandplaneResult<(u64, u64)> {
    let after_comm = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| SandplaneError::custom(anyhow::anyhow!("malformed /proc stat line")))?;

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Fields after comm: state(0) ... utime(11) stime(12).
    let utime = fields
        .get(11)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SandplaneError::custom(anyhow::anyhow!("missing utime in /proc stat")))?;
    let stime = fields
        .get(12)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SandplaneError::custom(anyhow::anyhow!("missing stime in /proc stat")))?;

    Ok((utime, stime))
}

fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_handles_spaces_in_comm() {
        let stat = "1234 (tokio runtime w) S 1 1234 1234 0 -1 4194560 100 0 0 0 42 7 0 0 20 0 4 0 12345 1000000 500 18446744073709551615";
        let (utime, stime) = parse_stat(stat).unwrap();
        assert_eq!(utime, 42);
        assert_eq!(stime, 7);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("nonsense with no fields").is_err());
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tfirecracker\nVmRSS:\t  2048 kB\nVmSwap:\t     0 kB\n";
        assert_eq!(parse_status_kb(status, "VmRSS:"), Some(2048));
        assert_eq!(parse_status_kb(status, "VmSwap:"), Some(0));
        assert_eq!(parse_status_kb(status, "VmPeak:"), None);
    }

    #[tokio::test]
    async fn test_sample_own_process() -> SandplaneResult<()> {
        let sample = sample_process(std::process::id()).await?;
        assert!(sample.rss_bytes > 0);
        Ok(())
    }
}
