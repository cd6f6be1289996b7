//! Shutdown arbitration.
//!
//! Decides how a run ends: the child exits on its own, or the operator asks
//! for shutdown, in which case the child is interrupted and then awaited.
//! Shutdown is always graceful; the child is never killed outright.

use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, Instrument};

use crate::{AppError, Result};

/// How the child process ended.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ExitReport {
    /// Exit code, when the child exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the child was killed by one.
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// The single result of a run that did not fail.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The child ended on its own.
    Exited(ExitReport),
    /// The operator requested shutdown; the child was interrupted and reaped.
    Shutdown(ExitReport),
}

impl Outcome {
    /// Exit report of the child, whichever way the run ended.
    #[must_use]
    pub const fn report(&self) -> ExitReport {
        match self {
            Self::Exited(report) | Self::Shutdown(report) => *report,
        }
    }
}

/// Operator shutdown requests (`SIGINT` or `SIGTERM`).
///
/// Handlers are installed on construction, so signals arriving before the
/// first `recv` are not lost.
#[derive(Debug)]
pub struct ShutdownListener {
    interrupt: SignalStream,
    terminate: SignalStream,
}

impl ShutdownListener {
    /// Install the signal handlers. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a handler cannot be registered.
    pub fn install() -> Result<Self> {
        let interrupt = unix_signal(SignalKind::interrupt())
            .map_err(|err| AppError::Config(format!("failed to register SIGINT handler: {err}")))?;
        let terminate = unix_signal(SignalKind::terminate())
            .map_err(|err| AppError::Config(format!("failed to register SIGTERM handler: {err}")))?;
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    /// Wait for the next shutdown request.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => debug!("received SIGINT"),
            _ = self.terminate.recv() => debug!("received SIGTERM"),
        }
    }
}

/// Reap `child` on a dedicated task.
///
/// The returned receiver fires exactly once, when the wait returns. A failed
/// wait is logged and reported as an empty [`ExitReport`].
#[must_use]
pub fn spawn_reaper(mut child: Child, pid: u32) -> oneshot::Receiver<ExitReport> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let report = match child.wait().await {
            Ok(status) => ExitReport::from(status),
            Err(err) => {
                error!(pid, %err, "failed to wait for child");
                ExitReport::default()
            }
        };
        // The arbiter may already be gone if the run failed.
        let _ = tx.send(report);
    }
    .in_current_span());
    rx
}

/// Wait for whichever comes first: the child terminating or `shutdown`
/// completing. On shutdown the child gets `SIGINT` and is then awaited
/// without a time limit.
///
/// # Errors
///
/// Returns `AppError::Interrupt` if `SIGINT` cannot be delivered.
pub async fn arbitrate<F>(
    pid: u32,
    mut dead_child: oneshot::Receiver<ExitReport>,
    shutdown: F,
) -> Result<Outcome>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        report = &mut dead_child => {
            let report = report.unwrap_or_default();
            debug!(pid, exit_code = ?report.code, signal = ?report.signal, "child exited");
            Ok(Outcome::Exited(report))
        }
        () = shutdown => {
            debug!(pid, "received interrupt signal, shutting down child");
            interrupt(pid)?;
            let report = dead_child.await.unwrap_or_default();
            debug!(pid, exit_code = ?report.code, signal = ?report.signal, "child exited after interrupt");
            Ok(Outcome::Shutdown(report))
        }
    }
}

fn interrupt(pid: u32) -> Result<()> {
    let target = i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| AppError::Interrupt(format!("pid {pid} out of range")))?;
    signal::kill(target, Signal::SIGINT)
        .map_err(|errno| AppError::Interrupt(format!("failed to interrupt pid {pid}: {errno}")))
}
