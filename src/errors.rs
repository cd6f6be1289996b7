//! Error types shared across the launcher.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering every way a run can fail.
///
/// Each variant maps to a distinct process exit code through
/// [`AppError::exit_code`] so an operator can tell which stage failed
/// without reading the logs.
#[derive(Debug)]
pub enum AppError {
    /// Flag, configuration file, or runtime bootstrap failure.
    Config(String),
    /// No target command was given on the command line.
    MissingCommand,
    /// An output or error sink for the child could not be opened.
    Sink(String),
    /// The child runner process could not be started.
    Spawn(String),
    /// Waiting on the child runner failed.
    Wait(String),
    /// The child runner exited before it paused itself.
    ExitedEarly(i32),
    /// The child runner changed state without stopping itself.
    NotStopped(String),
    /// Accounting group creation, existence check, apply, or destroy failed.
    Accounting(String),
    /// The paused child could not be resumed.
    Resume(String),
    /// The child could not be interrupted during shutdown.
    Interrupt(String),
}

impl AppError {
    /// Process exit code reported by the launcher for this error.
    ///
    /// These never overlap with the child runner's own failure codes
    /// (see [`crate::handshake::RunnerFailure`]).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::MissingCommand => 2,
            Self::Sink(_) => 3,
            Self::Spawn(_) => 4,
            Self::Wait(_) => 5,
            Self::ExitedEarly(_) => 6,
            Self::NotStopped(_) => 7,
            Self::Accounting(_) => 8,
            Self::Resume(_) => 9,
            Self::Interrupt(_) => 10,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::MissingCommand => write!(f, "usage: no command to execute was provided"),
            Self::Sink(msg) => write!(f, "sink: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Wait(msg) => write!(f, "wait: {msg}"),
            Self::ExitedEarly(code) => write!(f, "handshake: child exited early with code {code}"),
            Self::NotStopped(msg) => write!(f, "handshake: child did not stop itself: {msg}"),
            Self::Accounting(msg) => write!(f, "accounting: {msg}"),
            Self::Resume(msg) => write!(f, "resume: {msg}"),
            Self::Interrupt(msg) => write!(f, "interrupt: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
