//! Accounting groups created by systemd as transient scope units.
//!
//! The scope is started over D-Bus with `StartTransientUnit`, listing the
//! child's pid, so the service manager creates the cgroup inside a subtree
//! the caller is allowed to use. Unprivileged users talk to their own user
//! manager on the session bus; root talks to the system manager.
//!
//! Once the start job is done the scope's cgroup directory is read back from
//! `/proc/<pid>/cgroup`, and statistics come from the cgroup filesystem like
//! any other group.

use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use nix::unistd::geteuid;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zbus::zvariant::{DynamicType, OwnedObjectPath, Value};
use zbus::{Connection, Proxy};

use super::cgroupfs::{process_cgroup, read_stats};
use super::{AccountingFuture, AccountingGroup, MemoryStats};
use crate::sample::StatsLayout;
use crate::{AppError, Result};

const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// Longest wait for a start or stop job to finish.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Message bus hosting the service manager to talk to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Bus {
    /// System manager, for root.
    System,
    /// The calling user's own manager.
    Session,
}

impl Bus {
    /// System bus for root, session bus for everyone else.
    #[must_use]
    pub fn for_current_user() -> Self {
        if geteuid().is_root() {
            Self::System
        } else {
            Self::Session
        }
    }

    async fn connect(self) -> Result<Connection> {
        let connection = match self {
            Self::System => Connection::system().await,
            Self::Session => Connection::session().await,
        };
        connection.map_err(|err| {
            AppError::Accounting(format!("failed to connect to the {self:?} bus: {err}"))
        })
    }
}

/// Transient scope unit holding the child.
pub struct SystemdScope {
    unit: String,
    hierarchy: PathBuf,
    layout: StatsLayout,
    bus: Bus,
    manager: OnceCell<Proxy<'static>>,
    path: OnceLock<PathBuf>,
}

impl Debug for SystemdScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemdScope")
            .field("unit", &self.unit)
            .field("bus", &self.bus)
            .field("path", &self.path.get())
            .finish_non_exhaustive()
    }
}

impl SystemdScope {
    /// Handle for the scope `<name>.scope`. No bus traffic happens until the
    /// group is queried or applied.
    #[must_use]
    pub fn new(name: &str, hierarchy: PathBuf, layout: StatsLayout, bus: Bus) -> Self {
        Self {
            unit: scope_unit(name),
            hierarchy,
            layout,
            bus,
            manager: OnceCell::new(),
            path: OnceLock::new(),
        }
    }

    /// Name of the scope unit.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Manager proxy, connected and subscribed to job signals on first use.
    async fn manager(&self) -> Result<&Proxy<'static>> {
        self.manager
            .get_or_try_init(|| async {
                let connection = self.bus.connect().await?;
                let manager =
                    Proxy::new(&connection, SYSTEMD_SERVICE, SYSTEMD_PATH, MANAGER_INTERFACE)
                        .await
                        .map_err(|err| {
                            AppError::Accounting(format!("failed to reach systemd: {err}"))
                        })?;
                manager
                    .call::<_, _, ()>("Subscribe", &())
                    .await
                    .map_err(|err| {
                        AppError::Accounting(format!("failed to subscribe to systemd: {err}"))
                    })?;
                Ok::<_, AppError>(manager)
            })
            .await
    }

    async fn start(&self, pid: u32) -> Result<()> {
        let manager = self.manager().await?;
        let aux: Vec<(&str, Vec<(&str, Value<'_>)>)> = Vec::new();
        run_job(
            manager,
            "StartTransientUnit",
            &(self.unit.as_str(), "fail", scope_properties(pid), aux),
            false,
        )
        .await?;

        let proc_cgroup = format!("/proc/{pid}/cgroup");
        let raw = fs::read_to_string(&proc_cgroup).map_err(|err| {
            AppError::Accounting(format!("failed to read {proc_cgroup}: {err}"))
        })?;
        let path = scope_dir(&self.hierarchy, &raw, self.layout, &self.unit)?;
        info!(unit = %self.unit, path = %path.display(), pid, "started scope");
        let _ = self.path.set(path);
        Ok(())
    }

    async fn loaded(&self) -> Result<bool> {
        let manager = self.manager().await?;
        match manager
            .call::<_, _, OwnedObjectPath>("GetUnit", &(self.unit.as_str(),))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_no_such_unit(&err) => Ok(false),
            Err(err) => Err(AppError::Accounting(format!(
                "failed to look up {}: {err}",
                self.unit
            ))),
        }
    }

    async fn stop(&self) -> Result<()> {
        let manager = self.manager().await?;
        run_job(manager, "StopUnit", &(self.unit.as_str(), "replace"), true).await
    }
}

impl AccountingGroup for SystemdScope {
    fn paths(&self) -> Vec<PathBuf> {
        self.path.get().cloned().into_iter().collect()
    }

    fn exists(&self) -> AccountingFuture<'_, bool> {
        Box::pin(self.loaded())
    }

    fn apply(&self, pid: u32) -> AccountingFuture<'_, ()> {
        Box::pin(self.start(pid))
    }

    fn destroy(&self) -> AccountingFuture<'_, ()> {
        Box::pin(self.stop())
    }

    fn stats(&self) -> Result<MemoryStats> {
        let Some(path) = self.path.get() else {
            return Err(AppError::Accounting(format!(
                "{} has not been started",
                self.unit
            )));
        };
        read_stats(path, self.layout)
    }
}

/// Unit name of the scope for group `name`.
#[must_use]
pub fn scope_unit(name: &str) -> String {
    format!("{name}.scope")
}

/// Properties of the transient scope holding `pid`.
#[must_use]
pub fn scope_properties(pid: u32) -> Vec<(&'static str, Value<'static>)> {
    vec![
        ("PIDs", Value::new(vec![pid])),
        ("Delegate", Value::new(true)),
        ("MemoryAccounting", Value::new(true)),
    ]
}

/// Cgroup directory of `unit`, given the `/proc/<pid>/cgroup` content of a
/// process systemd placed in it.
///
/// # Errors
///
/// Returns `AppError::Accounting` if the process is not in the scope for
/// this layout, e.g. when the memory controller is not delegated.
pub fn scope_dir(
    hierarchy: &Path,
    proc_cgroup: &str,
    layout: StatsLayout,
    unit: &str,
) -> Result<PathBuf> {
    let cgroup = process_cgroup(proc_cgroup, layout)
        .ok_or_else(|| AppError::Accounting(format!("no {layout:?} cgroup entry for {unit}")))?;
    if cgroup.file_name().and_then(|name| name.to_str()) != Some(unit) {
        return Err(AppError::Accounting(format!(
            "{unit} has no memory cgroup, process is in {}",
            cgroup.display()
        )));
    }
    let relative = cgroup.strip_prefix("/").unwrap_or(&cgroup);
    Ok(hierarchy.join(relative))
}

/// Map the `result` field of a finished job.
///
/// # Errors
///
/// Returns `AppError::Accounting` for anything but `done`.
pub fn job_result(method: &str, result: &str) -> Result<()> {
    if result == "done" {
        Ok(())
    } else {
        Err(AppError::Accounting(format!(
            "{method} job finished with result {result:?}"
        )))
    }
}

fn is_no_such_unit(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::MethodError(name, _, _) if name.as_str() == NO_SUCH_UNIT)
}

/// Call a manager method that enqueues a job and wait for the job to finish.
/// With `missing_ok`, a call naming an unknown unit succeeds.
async fn run_job<B>(manager: &Proxy<'_>, method: &str, body: &B, missing_ok: bool) -> Result<()>
where
    B: Serialize + DynamicType,
{
    // Listen before enqueueing so a fast job cannot finish unseen.
    let mut removed = manager.receive_signal("JobRemoved").await.map_err(|err| {
        AppError::Accounting(format!("failed to watch systemd jobs: {err}"))
    })?;

    let job: OwnedObjectPath = match manager.call(method, body).await {
        Ok(job) => job,
        Err(err) if missing_ok && is_no_such_unit(&err) => {
            debug!(method, "unit already gone");
            return Ok(());
        }
        Err(err) => return Err(AppError::Accounting(format!("{method} failed: {err}"))),
    };
    debug!(method, job = %job.as_str(), "waiting for systemd job");

    let finished = tokio::time::timeout(JOB_TIMEOUT, async {
        while let Some(message) = removed.next().await {
            let Ok((_, path, _, result)) = message
                .body()
                .deserialize::<(u32, OwnedObjectPath, String, String)>()
            else {
                continue;
            };
            if path == job {
                return Some(result);
            }
        }
        None
    })
    .await
    .map_err(|_| AppError::Accounting(format!("timed out waiting for {method} job")))?;

    match finished {
        Some(result) => job_result(method, &result),
        None => Err(AppError::Accounting(format!(
            "systemd job stream closed during {method}"
        ))),
    }
}
