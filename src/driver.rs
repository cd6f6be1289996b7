//! Accounting driver: where the memory cgroup gets created.
//!
//! `CgroupDriver` is used as the `--driver` CLI flag value and the `driver`
//! config key.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Placement strategy for the accounting group.
///
/// Defaults to [`CgroupDriver::Systemd`], which works for unprivileged users
/// on hosts where systemd delegates a cgroup subtree to the user session.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupDriver {
    /// Create the group next to the launcher's own cgroup, inside the
    /// subtree delegated by systemd. Default.
    #[default]
    Systemd,
    /// Create the group directly under the hierarchy root (needs root).
    Cgroupfs,
}
