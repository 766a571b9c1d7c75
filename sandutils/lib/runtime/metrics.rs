use std::time::Instant;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Converts absolute CPU tick counters into percent-of-interval samples.
///
/// Each call to [`CpuPercentTracker::percent`] compares the given cumulative
/// tick count against the previous call and the wall-clock time elapsed since
/// then. The first sample has no baseline and reports `0.0`.
#[derive(Debug)]
pub struct CpuPercentTracker {
    /// Cumulative ticks observed at the previous sample
    last_ticks: Option<u64>,

    /// Wall-clock instant of the previous sample
    last_sampled_at: Option<Instant>,

    /// Kernel clock ticks per second
    ticks_per_second: f64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CpuPercentTracker {
    /// Creates a tracker using the kernel's clock tick rate.
    pub fn new() -> Self {
        // Safety: sysconf(_SC_CLK_TCK) reads a static kernel constant.
        let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self::with_ticks_per_second(if ticks_per_second > 0 {
            ticks_per_second as f64
        } else {
            100.0
        })
    }

    /// Creates a tracker with an explicit tick rate.
    pub fn with_ticks_per_second(ticks_per_second: f64) -> Self {
        Self {
            last_ticks: None,
            last_sampled_at: None,
            ticks_per_second,
        }
    }

    /// Returns CPU usage as a percentage of one core over the interval since
    /// the previous call, given the process's cumulative tick count.
    pub fn percent(&mut self, total_ticks: u64) -> f64 {
        let now = Instant::now();

        let percent = match (self.last_ticks, self.last_sampled_at) {
            (Some(last_ticks), Some(last_at)) => {
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let cpu_seconds =
                        total_ticks.saturating_sub(last_ticks) as f64 / self.ticks_per_second;
                    (cpu_seconds / elapsed) * 100.0
                }
            }
            _ => 0.0,
        };

        self.last_ticks = Some(total_ticks);
        self.last_sampled_at = Some(now);

        percent
    }
}

impl Default for CpuPercentTracker {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_is_zero() {
        let mut tracker = CpuPercentTracker::with_ticks_per_second(100.0);
        assert_eq!(tracker.percent(500), 0.0);
    }

    #[test]
    fn test_percent_tracks_tick_delta() {
        let mut tracker = CpuPercentTracker::with_ticks_per_second(100.0);
        tracker.percent(0);

        std::thread::sleep(Duration::from_millis(100));

        // 10 ticks at 100Hz is 100ms of CPU over ~100ms of wall time.
        let percent = tracker.percent(10);
        assert!(percent > 50.0, "expected busy sample, got {percent}");
    }

    #[test]
    fn test_counter_going_backwards_is_clamped() {
        let mut tracker = CpuPercentTracker::with_ticks_per_second(100.0);
        tracker.percent(100);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.percent(50), 0.0);
    }
}
