//! Accounting groups backed by the cgroup filesystem.
//!
//! Supports both the unified (v2) hierarchy and the legacy (v1) memory
//! controller. The hierarchy is detected once when the service is built.
//! With the `systemd` driver the group itself is created by systemd (see
//! [`super::systemd`]); statistics are still read from this filesystem.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::systemd::{Bus, SystemdScope};
use super::{AccountingFuture, AccountingGroup, AccountingService, GroupConfig, MemoryStats};
use crate::driver::CgroupDriver;
use crate::sample::StatsLayout;
use crate::{AppError, Result};

/// Mount point of the cgroup hierarchy.
pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// Accounting service over a cgroup mount.
#[derive(Debug, Clone)]
pub struct CgroupFs {
    root: PathBuf,
    layout: StatsLayout,
    bus: Bus,
}

impl CgroupFs {
    /// Service for the host's cgroup mount.
    #[must_use]
    pub fn system() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// Service rooted at `root`. Scopes go to the service manager of the
    /// calling user.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let layout = detect_layout(&root);
        Self {
            root,
            layout,
            bus: Bus::for_current_user(),
        }
    }

    /// Directory holding the memory hierarchy.
    fn hierarchy(&self) -> PathBuf {
        match self.layout {
            StatsLayout::Unified => self.root.clone(),
            StatsLayout::Legacy => self.root.join("memory"),
        }
    }
}

impl AccountingService for CgroupFs {
    fn layout(&self) -> StatsLayout {
        self.layout
    }

    fn create(&self, config: &GroupConfig) -> Result<Arc<dyn AccountingGroup>> {
        match config.driver {
            CgroupDriver::Cgroupfs => {
                let path = self.hierarchy().join(&config.name);
                debug!(path = %path.display(), layout = ?self.layout, "resolved accounting group");
                Ok(Arc::new(FsGroup {
                    path,
                    layout: self.layout,
                }))
            }
            CgroupDriver::Systemd => {
                let scope = SystemdScope::new(&config.name, self.hierarchy(), self.layout, self.bus);
                debug!(unit = scope.unit(), bus = ?self.bus, layout = ?self.layout, "resolved accounting scope");
                Ok(Arc::new(scope))
            }
        }
    }
}

/// One cgroup directory managed directly.
#[derive(Debug, Clone)]
pub struct FsGroup {
    path: PathBuf,
    layout: StatsLayout,
}

impl FsGroup {
    fn enable_memory_controller(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let control = parent.join("cgroup.subtree_control");
        let enabled = fs::read_to_string(&control)
            .map(|raw| raw.split_whitespace().any(|c| c == "memory"))
            .unwrap_or(false);
        if enabled {
            return;
        }
        if let Err(err) = fs::write(&control, "+memory") {
            warn!(%err, path = %control.display(), "failed to enable memory controller");
        }
    }

    fn create_and_enter(&self, pid: u32) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|err| {
            AppError::Accounting(format!("failed to create {}: {err}", self.path.display()))
        })?;

        if self.layout == StatsLayout::Unified {
            self.enable_memory_controller();
        }

        let procs = self.path.join("cgroup.procs");
        fs::write(&procs, pid.to_string()).map_err(|err| {
            AppError::Accounting(format!(
                "failed to add pid {pid} to {}: {err}",
                procs.display()
            ))
        })
    }

    fn remove(&self) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Accounting(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

impl AccountingGroup for FsGroup {
    fn paths(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }

    fn exists(&self) -> AccountingFuture<'_, bool> {
        Box::pin(async move { Ok(self.path.is_dir()) })
    }

    fn apply(&self, pid: u32) -> AccountingFuture<'_, ()> {
        Box::pin(async move { self.create_and_enter(pid) })
    }

    fn destroy(&self) -> AccountingFuture<'_, ()> {
        Box::pin(async move { self.remove() })
    }

    fn stats(&self) -> Result<MemoryStats> {
        read_stats(&self.path, self.layout)
    }
}

/// Read the memory statistics of the cgroup directory `dir`.
///
/// # Errors
///
/// Returns `AppError::Accounting` if `memory.stat` or the usage counter
/// cannot be read.
pub fn read_stats(dir: &Path, layout: StatsLayout) -> Result<MemoryStats> {
    let stat_path = dir.join("memory.stat");
    let raw = fs::read_to_string(&stat_path).map_err(|err| {
        AppError::Accounting(format!("failed to read {}: {err}", stat_path.display()))
    })?;
    let stats = parse_memory_stat(&raw);

    let (usage, kernel_usage) = match layout {
        StatsLayout::Unified => {
            let usage = read_counter(dir, "memory.current")?;
            (usage, stats.get("kernel").copied().unwrap_or(0))
        }
        StatsLayout::Legacy => {
            let usage = read_counter(dir, "memory.usage_in_bytes")?;
            // kmem accounting is compiled out on some kernels.
            (usage, read_counter(dir, "memory.kmem.usage_in_bytes").unwrap_or(0))
        }
    };

    Ok(MemoryStats {
        stats,
        usage,
        kernel_usage,
    })
}

fn read_counter(dir: &Path, file: &str) -> Result<u64> {
    let path = dir.join(file);
    let raw = fs::read_to_string(&path)
        .map_err(|err| AppError::Accounting(format!("failed to read {}: {err}", path.display())))?;
    raw.trim().parse().map_err(|err| {
        AppError::Accounting(format!("invalid counter in {}: {err}", path.display()))
    })
}

/// Unified when the root carries `cgroup.controllers`, legacy otherwise.
#[must_use]
pub fn detect_layout(root: &Path) -> StatsLayout {
    if root.join("cgroup.controllers").is_file() {
        StatsLayout::Unified
    } else {
        StatsLayout::Legacy
    }
}

/// Find the cgroup path for `layout` in `/proc/<pid>/cgroup` content.
///
/// Unified entries look like `0::/user.slice/app.slice/x.scope`; legacy
/// entries list their controllers, e.g. `7:memory:/user.slice`.
#[must_use]
pub fn process_cgroup(proc_cgroup: &str, layout: StatsLayout) -> Option<PathBuf> {
    proc_cgroup.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let id = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        let matches = match layout {
            StatsLayout::Unified => id == "0" && controllers.is_empty(),
            StatsLayout::Legacy => controllers.split(',').any(|c| c == "memory"),
        };
        matches.then(|| PathBuf::from(path))
    })
}

/// Parse `memory.stat` lines of the form `key value`. Malformed lines are
/// skipped.
#[must_use]
pub fn parse_memory_stat(raw: &str) -> HashMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?;
            let value = fields.next()?.parse().ok()?;
            Some((key.to_owned(), value))
        })
        .collect()
}
