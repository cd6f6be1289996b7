//! Launch handshake between the launcher and its child runner.
//!
//! The launcher re-executes its own binary with a [`RunnerToken`] as first
//! argument. In that role the process resolves the target program, stops
//! itself with `SIGSTOP` and stays frozen until the launcher has moved it
//! into the accounting group and sent `SIGCONT`. Only then does it replace
//! its image with the target program, so the target never runs a single
//! instruction outside the group.
//!
//! The parent side is a typed state machine:
//! [`SpawnedRunner`] → [`StoppedRunner`] → [`RunningChild`].

use std::convert::Infallible;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::config::{LaunchRequest, LogFormat, Verbosity};
use crate::{AppError, Result};

/// First argument selecting the child runner role.
pub const RUNNER_TOKEN: &str = "__cgmemstat_runner";

/// Suffix appended to [`RUNNER_TOKEN`] when debug logging is on.
const DEBUG_SUFFIX: &str = "_debug";

/// Suffix appended after the verbosity suffix for JSON logs.
const JSON_SUFFIX: &str = "_json";

/// Startup token handed to the child runner.
///
/// Carries the launcher's log settings so both processes log alike without
/// the runner parsing any flags.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RunnerToken {
    /// Log verbosity of the runner.
    pub verbosity: Verbosity,
    /// Log format of the runner.
    pub log_format: LogFormat,
}

impl RunnerToken {
    /// Token string passed as the runner's first argument.
    #[must_use]
    pub fn encode(self) -> String {
        let mut token = RUNNER_TOKEN.to_owned();
        if self.verbosity.is_debug() {
            token.push_str(DEBUG_SUFFIX);
        }
        if self.log_format == LogFormat::Json {
            token.push_str(JSON_SUFFIX);
        }
        token
    }

    /// Recognise an encoded token.
    #[must_use]
    pub fn parse(arg: &OsStr) -> Option<Self> {
        let rest = arg.to_str()?.strip_prefix(RUNNER_TOKEN)?;
        let (verbosity, rest) = match rest.strip_prefix(DEBUG_SUFFIX) {
            Some(rest) => (Verbosity::Debug, rest),
            None => (Verbosity::Normal, rest),
        };
        let log_format = match rest {
            "" => LogFormat::Text,
            JSON_SUFFIX => LogFormat::Json,
            _ => return None,
        };
        Some(Self {
            verbosity,
            log_format,
        })
    }
}

/// Detect the child runner role from the process arguments (program name
/// excluded). Returns the token and the target command, which is never empty.
#[must_use]
pub fn runner_invocation(args: &[OsString]) -> Option<(RunnerToken, &[OsString])> {
    let (first, command) = args.split_first()?;
    let token = RunnerToken::parse(first)?;
    if command.is_empty() {
        return None;
    }
    Some((token, command))
}

/// Stage at which the child runner gave up. Each maps to its own exit code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunnerFailure {
    /// The target program could not be found.
    Resolve,
    /// `SIGSTOP` could not be delivered to self.
    Stop,
    /// Replacing the process image failed.
    Exec,
}

impl RunnerFailure {
    /// Every failure stage.
    pub const ALL: [Self; 3] = [Self::Resolve, Self::Stop, Self::Exec];

    /// Exit code used by the runner for this stage.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Resolve => 121,
            Self::Stop => 122,
            Self::Exec => 123,
        }
    }

    /// Map an exit code back to the stage that produced it.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.code() == code)
    }

    /// Human-readable name of the stage.
    #[must_use]
    pub const fn stage(self) -> &'static str {
        match self {
            Self::Resolve => "path resolution",
            Self::Stop => "self stop",
            Self::Exec => "exec",
        }
    }
}

// ── Child runner role ────────────────────────────────────────────────────────

/// Body of the child runner role. Never returns: it either becomes the target
/// program or exits with a [`RunnerFailure`] code.
pub fn run_child(command: &[OsString]) -> ! {
    debug!(args = ?command, "starting");

    let Some(program) = command.first() else {
        error!("no target command");
        std::process::exit(RunnerFailure::Resolve.code());
    };

    let Some(path) = resolve_program(program, env::var_os("PATH").as_deref()) else {
        error!(args = ?command, "failed retrieving path for binary");
        std::process::exit(RunnerFailure::Resolve.code());
    };

    debug!("stopping");
    if let Err(errno) = signal::raise(Signal::SIGSTOP) {
        error!(pid = unistd::getpid().as_raw(), %errno, "failed sending SIGSTOP");
        std::process::exit(RunnerFailure::Stop.code());
    }

    debug!(path = %path.display(), "continuing, starting exec");
    let Err(reason) = exec(&path, command);
    error!(path = %path.display(), args = ?command, %reason, "exec failed");
    std::process::exit(RunnerFailure::Exec.code())
}

/// Locate `program` the way a shell would: as-is when it contains a slash,
/// otherwise in each directory of `path_var`.
#[must_use]
pub fn resolve_program(program: &OsStr, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    if program.as_bytes().contains(&b'/') {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }

    env::split_paths(path_var?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Replace the current process image, inheriting the environment.
fn exec(path: &Path, command: &[OsString]) -> std::result::Result<Infallible, String> {
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|err| err.to_string())?;
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| err.to_string())?;
    unistd::execv(&path, &argv).map_err(|errno| errno.to_string())
}

// ── Launcher role ────────────────────────────────────────────────────────────

/// Destinations of the child's standard output and error.
#[derive(Debug)]
pub struct ChildSinks {
    stdout: Stdio,
    stderr: Stdio,
}

impl ChildSinks {
    /// Open the sink files, falling back to the launcher's stderr for a sink
    /// without a path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sink` if a file cannot be opened.
    pub fn open(out: Option<&Path>, err: Option<&Path>) -> Result<Self> {
        Ok(Self {
            stdout: open_sink(out)?,
            stderr: open_sink(err)?,
        })
    }
}

fn open_sink(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map(Stdio::from)
            .map_err(|err| AppError::Sink(format!("failed to open {}: {err}", path.display()))),
        None => std::io::stderr()
            .as_fd()
            .try_clone_to_owned()
            .map(Stdio::from)
            .map_err(|err| AppError::Sink(format!("failed to duplicate stderr: {err}"))),
    }
}

/// Child runner that has been started but not yet observed stopped.
#[derive(Debug)]
pub struct SpawnedRunner {
    pid: u32,
    child: Child,
}

/// Start the child runner for `request`, redirecting its output to `sinks`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the process cannot be started.
pub fn spawn_runner(request: &LaunchRequest, sinks: ChildSinks) -> Result<SpawnedRunner> {
    let token = RunnerToken {
        verbosity: request.verbosity,
        log_format: request.log_format,
    };

    let mut cmd = Command::new(&request.runner_exe);
    cmd.arg(token.encode())
        .args(&request.command)
        .stdin(Stdio::inherit())
        .stdout(sinks.stdout)
        .stderr(sinks.stderr);

    let child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to start {}: {err}",
            request.runner_exe.display()
        ))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| AppError::Spawn("child runner has no pid".into()))?;

    debug!(pid, runner = %request.runner_exe.display(), "child runner spawned");
    Ok(SpawnedRunner { pid, child })
}

impl SpawnedRunner {
    /// Process id of the runner.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the runner has stopped itself.
    ///
    /// # Errors
    ///
    /// - `AppError::Wait` if waiting fails.
    /// - `AppError::ExitedEarly` if the runner exited instead of stopping.
    /// - `AppError::NotStopped` for any other state change.
    pub async fn wait_stopped(self) -> Result<StoppedRunner> {
        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || wait_for_stop(pid))
            .await
            .map_err(|err| AppError::Wait(format!("wait task failed: {err}")))??;
        check_stopped(pid, status)?;
        debug!(pid, "child runner stopped");
        Ok(StoppedRunner {
            pid,
            child: self.child,
        })
    }
}

fn nix_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| AppError::Wait(format!("pid {pid} out of range")))
}

fn wait_for_stop(pid: u32) -> Result<WaitStatus> {
    // WUNTRACED also reports children stopped by a signal, not only traced ones.
    waitpid(nix_pid(pid)?, Some(WaitPidFlag::WUNTRACED))
        .map_err(|errno| AppError::Wait(format!("failed to wait for pid {pid}: {errno}")))
}

/// Classify the status reported while waiting for the runner to stop.
///
/// # Errors
///
/// - `AppError::ExitedEarly` if the runner exited.
/// - `AppError::NotStopped` if it changed state in any other way.
///
/// # Panics
///
/// Panics if `status` belongs to a process other than `pid`; waiting on a
/// specific pid can never report another one.
pub fn check_stopped(pid: u32, status: WaitStatus) -> Result<()> {
    if let Some(reported) = status.pid() {
        assert!(
            u32::try_from(reported.as_raw()).ok() == Some(pid),
            "wait returned pid {reported} while waiting for {pid}"
        );
    }

    match status {
        WaitStatus::Stopped(_, _) => Ok(()),
        WaitStatus::Exited(_, code) => {
            match RunnerFailure::from_code(code) {
                Some(stage) => error!(pid, exit_code = code, stage = stage.stage(), "child exited early"),
                None => error!(pid, exit_code = code, "child exited early"),
            }
            Err(AppError::ExitedEarly(code))
        }
        other => Err(AppError::NotStopped(format!("{other:?}"))),
    }
}

/// Runner frozen by its own `SIGSTOP`, safe to move into accounting.
#[derive(Debug)]
pub struct StoppedRunner {
    pid: u32,
    child: Child,
}

impl StoppedRunner {
    /// Process id of the runner.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Let the runner continue into the target program.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Resume` if `SIGCONT` cannot be delivered.
    pub fn resume(self) -> Result<RunningChild> {
        debug!(pid = self.pid, "sending SIGCONT to child");
        let pid = nix_pid(self.pid).map_err(|err| AppError::Resume(err.to_string()))?;
        signal::kill(pid, Signal::SIGCONT).map_err(|errno| {
            AppError::Resume(format!("failed to resume pid {}: {errno}", self.pid))
        })?;
        info!(pid = self.pid, "child resumed under accounting");
        Ok(RunningChild {
            pid: self.pid,
            child: self.child,
        })
    }
}

/// Child resumed and running the target program.
#[derive(Debug)]
pub struct RunningChild {
    pid: u32,
    child: Child,
}

impl RunningChild {
    /// Process id of the target program.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand the process handle over for reaping.
    #[must_use]
    pub fn into_child(self) -> Child {
        self.child
    }
}
