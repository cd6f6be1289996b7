//! One complete run: handshake, accounting, sampling, arbitration, cleanup.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::accounting::{AccountingGroup, AccountingService, GroupGuard};
use crate::arbiter::{self, Outcome};
use crate::config::LaunchRequest;
use crate::handshake::{self, ChildSinks, StoppedRunner};
use crate::sample::StatsLayout;
use crate::sampler::Sampler;
use crate::Result;

/// Launch `request` under `accounting`, stream samples to `table` and return
/// once the child is gone.
///
/// The accounting group is created only after the child runner is observed
/// stopped, and the child is resumed only after it has been placed in the
/// group. Once created, the group is destroyed exactly once whichever way
/// this function returns.
///
/// # Errors
///
/// Any setup, handshake or accounting failure, an undeliverable interrupt,
/// or a failure to destroy the group at the end of the run.
pub async fn run<S, F, W>(
    request: &LaunchRequest,
    accounting: &S,
    shutdown: F,
    table: W,
) -> Result<Outcome>
where
    S: AccountingService + ?Sized,
    F: Future<Output = ()>,
    W: Write + Send + 'static,
{
    let sinks = ChildSinks::open(request.cmd_out.as_deref(), request.cmd_err.as_deref())?;
    let stopped = handshake::spawn_runner(request, sinks)?
        .wait_stopped()
        .await?;
    let pid = stopped.pid();

    let guard = GroupGuard::new(accounting.create(&request.group)?);
    let outcome = supervise(
        guard.group(),
        accounting.layout(),
        request.refresh,
        stopped,
        shutdown,
        table,
    )
    .await;

    let cleanup = guard.release().await;
    if let Err(err) = &cleanup {
        error!(%err, pid, "failed to destroy cgroup after run");
    }
    let outcome = outcome?;
    cleanup?;
    Ok(outcome)
}

/// Everything between creating the group and destroying it.
async fn supervise<F, W>(
    group: Arc<dyn AccountingGroup>,
    layout: StatsLayout,
    refresh: Duration,
    stopped: StoppedRunner,
    shutdown: F,
    table: W,
) -> Result<Outcome>
where
    F: Future<Output = ()>,
    W: Write + Send + 'static,
{
    let pid = stopped.pid();
    if group.exists().await? {
        debug!(paths = ?group.paths(), "cgroup already exists, destroying cgroup");
        group.destroy().await?;
    }
    group.apply(pid).await?;
    debug!(pid, paths = ?group.paths(), "created cgroup and put child in it");

    let running = stopped.resume()?;
    let started = Instant::now();
    let dead_child = arbiter::spawn_reaper(running.into_child(), pid);

    let cancel = CancellationToken::new();
    let sampler = Sampler::new(group, layout, refresh, started).spawn(table, cancel.clone());

    let outcome = arbiter::arbitrate(pid, dead_child, shutdown).await;

    // Stop reading before the group goes away.
    cancel.cancel();
    if let Err(err) = sampler.await {
        warn!(%err, "sampler task ended abnormally");
    }
    outcome
}
