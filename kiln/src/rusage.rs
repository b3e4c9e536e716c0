//! Resource-usage sampling between build steps.
//!
//! With `log_rusage` enabled, the engine snapshots child-process rusage
//! before and after each step and emits the delta, docker's `--log-rusage`
//! texture: `(1.2s user, 0.3s system, 85MB memory)`.

use std::time::Duration;

/// One rusage snapshot (children of the current process).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    /// CPU time spent in user mode.
    pub user: Duration,
    /// CPU time spent in kernel mode.
    pub system: Duration,
    /// Peak resident set size, in kibibytes.
    pub max_rss_kib: i64,
    /// Block-input operations.
    pub reads: i64,
    /// Block-output operations.
    pub writes: i64,
}

impl Rusage {
    /// Samples rusage of reaped child processes.
    #[cfg(unix)]
    pub fn sample() -> crate::Result<Self> {
        use nix::sys::resource::{UsageWho, getrusage};

        let usage = getrusage(UsageWho::RUSAGE_CHILDREN)
            .map_err(|e| crate::Error::Driver(format!("getrusage: {e}")))?;
        let tv_to_duration = |tv: nix::sys::time::TimeVal| {
            Duration::from_secs(tv.tv_sec().max(0) as u64)
                + Duration::from_micros(tv.tv_usec().max(0) as u64)
        };
        Ok(Self {
            user: tv_to_duration(usage.user_time()),
            system: tv_to_duration(usage.system_time()),
            max_rss_kib: usage.max_rss(),
            reads: usage.block_reads(),
            writes: usage.block_writes(),
        })
    }

    /// Non-Unix hosts have no child rusage; samples are zero.
    #[cfg(not(unix))]
    pub fn sample() -> crate::Result<Self> {
        Ok(Self::default())
    }

    /// The usage accumulated since an earlier snapshot.
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
            max_rss_kib: self.max_rss_kib.max(earlier.max_rss_kib),
            reads: self.reads - earlier.reads,
            writes: self.writes - earlier.writes,
        }
    }

    /// Human-readable one-line form.
    pub fn display(&self) -> String {
        format!(
            "({:.2}s user, {:.2}s system, {}MB memory, {} reads, {} writes)",
            self.user.as_secs_f64(),
            self.system.as_secs_f64(),
            self.max_rss_kib / 1024,
            self.reads,
            self.writes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_subtracts_cpu_keeps_peak_rss() {
        let earlier = Rusage {
            user: Duration::from_secs(1),
            system: Duration::from_millis(500),
            max_rss_kib: 2048,
            reads: 10,
            writes: 4,
        };
        let later = Rusage {
            user: Duration::from_secs(3),
            system: Duration::from_secs(1),
            max_rss_kib: 1024,
            reads: 25,
            writes: 9,
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.user, Duration::from_secs(2));
        assert_eq!(delta.max_rss_kib, 2048);
        assert_eq!(delta.reads, 15);
        assert!(delta.display().contains("2.00s user"));
    }

    #[cfg(unix)]
    #[test]
    fn sampling_does_not_fail() {
        assert!(Rusage::sample().is_ok());
    }
}
