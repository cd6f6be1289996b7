//! Memory samples and their tabular rendering.
//!
//! The two cgroup hierarchies expose incompatible memory statistics. Each
//! [`StatsLayout`] variant knows its own column names and how to turn raw
//! [`MemoryStats`] into a [`Sample`]; the layout is picked once at startup.

use std::fmt::Write as _;
use std::time::Duration;

use crate::accounting::MemoryStats;

/// Width of the elapsed-time column.
const UPTIME_WIDTH: usize = 10;
/// Width of every counter column.
const COUNTER_WIDTH: usize = 12;

/// Shape of the memory statistics exposed by the active hierarchy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatsLayout {
    /// cgroup v2: `anon`, `file`, `kernel` come straight from `memory.stat`.
    Unified,
    /// cgroup v1: `rss`, `cache` from `memory.stat`, kernel usage read from a
    /// separate file.
    Legacy,
}

impl StatsLayout {
    /// Names of the five counter columns, in rendering order.
    #[must_use]
    pub const fn columns(self) -> [&'static str; 5] {
        match self {
            Self::Unified => ["anon", "file", "kernel", "usage", "workingset"],
            Self::Legacy => ["rss", "cache", "kernel", "usage", "workingset"],
        }
    }

    /// `memory.stat` key holding reclaimable inactive file pages.
    #[must_use]
    pub const fn inactive_file_key(self) -> &'static str {
        match self {
            Self::Unified => "inactive_file",
            Self::Legacy => "total_inactive_file",
        }
    }

    /// Project raw statistics onto this layout's columns.
    #[must_use]
    pub fn sample(self, elapsed: Duration, stats: &MemoryStats) -> Sample {
        let working_set = stats
            .usage
            .saturating_sub(stats.stat(self.inactive_file_key()));
        let counters = match self {
            Self::Unified => [
                stats.stat("anon"),
                stats.stat("file"),
                stats.stat("kernel"),
                stats.usage,
                working_set,
            ],
            Self::Legacy => [
                stats.stat("rss"),
                stats.stat("cache"),
                stats.kernel_usage,
                stats.usage,
                working_set,
            ],
        };
        Sample { elapsed, counters }
    }

    /// Header row naming this layout's columns.
    #[must_use]
    pub fn header(self) -> String {
        let mut line = format!("{:>UPTIME_WIDTH$}\t", "uptime");
        for name in self.columns() {
            let _ = write!(line, "{name:>COUNTER_WIDTH$}\t");
        }
        line
    }
}

/// One snapshot of the group's memory usage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Sample {
    /// Time since the run started.
    pub elapsed: Duration,
    /// Counter values in the order of [`StatsLayout::columns`]; the last one is
    /// the derived working set.
    pub counters: [u64; 5],
}

impl Sample {
    /// Derived working set: usage minus inactive file pages.
    #[must_use]
    pub const fn working_set(&self) -> u64 {
        self.counters[4]
    }

    /// Render this sample as one table row.
    #[must_use]
    pub fn row(&self) -> String {
        let mut line = format!("{:>UPTIME_WIDTH$}\t", format_elapsed(self.elapsed));
        for value in self.counters {
            let _ = write!(line, "{value:>COUNTER_WIDTH$}\t");
        }
        line
    }
}

/// Seconds with millisecond precision, e.g. `1.500s`.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis())
}
