//! Resource-accounting service consumed by the launcher.
//!
//! The launcher only needs five things from an accounting backend: create a
//! group handle, check whether it exists, place a pid in it, read memory
//! statistics, and remove it. [`cgroupfs`] implements them over the cgroup
//! filesystem and [`systemd`] over transient scope units; tests substitute
//! their own recording implementation.

pub mod cgroupfs;
pub mod systemd;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::driver::CgroupDriver;
use crate::sample::StatsLayout;
use crate::Result;

pub use cgroupfs::CgroupFs;
pub use systemd::SystemdScope;

/// Future returned by accounting operations that may wait on the service
/// manager.
pub type AccountingFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Name and placement of the accounting group to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Group name: the cgroup directory, or the stem of the systemd scope
    /// unit.
    pub name: String,
    /// Placement strategy.
    pub driver: CgroupDriver,
}

/// Point-in-time memory statistics as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Key/value counters from `memory.stat`.
    pub stats: HashMap<String, u64>,
    /// Total memory usage of the group in bytes.
    pub usage: u64,
    /// Kernel memory usage in bytes, when the backend reports it separately.
    pub kernel_usage: u64,
}

impl MemoryStats {
    /// Counter `key` from `memory.stat`, or zero when absent.
    #[must_use]
    pub fn stat(&self, key: &str) -> u64 {
        self.stats.get(key).copied().unwrap_or(0)
    }
}

/// Factory for accounting groups.
pub trait AccountingService {
    /// Statistics shape produced by groups of this service.
    fn layout(&self) -> StatsLayout;

    /// Build a handle for the group described by `config`.
    ///
    /// Creating the handle does not create the group; [`AccountingGroup::apply`]
    /// does.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Accounting` if the group location cannot be resolved.
    fn create(&self, config: &GroupConfig) -> Result<Arc<dyn AccountingGroup>>;
}

/// Handle to one accounting group.
pub trait AccountingGroup: Debug + Send + Sync {
    /// Filesystem locations backing the group, for diagnostics. Empty until
    /// the location is known.
    fn paths(&self) -> Vec<PathBuf>;

    /// Whether the group currently exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Accounting` if the backend cannot be queried.
    fn exists(&self) -> AccountingFuture<'_, bool>;

    /// Create the group if needed and move `pid` into it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Accounting` if the group cannot be created or the
    /// pid cannot be placed in it.
    fn apply(&self, pid: u32) -> AccountingFuture<'_, ()>;

    /// Remove the group. Removing a group that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Accounting` if removal fails.
    fn destroy(&self) -> AccountingFuture<'_, ()>;

    /// Read current memory statistics. Blocks on filesystem reads.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Accounting` if the statistics cannot be read.
    fn stats(&self) -> Result<MemoryStats>;
}

/// Sole owner of the right to destroy an accounting group.
///
/// The launcher destroys the group exactly once through
/// [`GroupGuard::release`]. A guard dropped while still armed (the run was
/// cancelled or panicked) hands the teardown to the current runtime.
#[derive(Debug)]
pub struct GroupGuard {
    group: Arc<dyn AccountingGroup>,
    armed: bool,
}

impl GroupGuard {
    /// Take ownership of `group`'s teardown.
    #[must_use]
    pub fn new(group: Arc<dyn AccountingGroup>) -> Self {
        Self { group, armed: true }
    }

    /// Shared handle to the guarded group, for readers such as the sampler.
    #[must_use]
    pub fn group(&self) -> Arc<dyn AccountingGroup> {
        Arc::clone(&self.group)
    }

    /// Destroy the group and report the outcome.
    ///
    /// # Errors
    ///
    /// Returns the backend's `AppError::Accounting` if removal fails.
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        debug!(paths = ?self.group.paths(), "destroying accounting group");
        self.group.destroy().await
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let paths = self.group.paths();
        let Ok(runtime) = Handle::try_current() else {
            error!(?paths, "accounting group left behind, no runtime to destroy it");
            return;
        };
        warn!(?paths, "run abandoned, destroying accounting group in background");
        let group = Arc::clone(&self.group);
        runtime.spawn(async move {
            if let Err(err) = group.destroy().await {
                error!(%err, ?paths, "failed to destroy accounting group");
            }
        });
    }
}
