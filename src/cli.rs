//! Command-line interface.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub use crate::config::LogFormat;
use crate::config::{LaunchRequest, Settings};
use crate::driver::CgroupDriver;
use crate::Result;

#[derive(Debug, Parser)]
#[command(
    name = "cgmemstat",
    about = "Run a command in a fresh memory cgroup and stream its memory usage",
    version,
    long_about = None
)]
/// Launcher flags followed by the target command.
pub struct Cli {
    /// Enable debug logs, in the launcher and in the child runner.
    #[arg(long)]
    pub debug: bool,

    /// Driver used to place the memory cgroup [default: systemd].
    #[arg(long, value_enum)]
    pub driver: Option<CgroupDriver>,

    /// Standard output file of the child command [default: stderr].
    #[arg(long, value_name = "PATH")]
    pub cmd_out: Option<PathBuf>,

    /// Standard error file of the child command [default: stderr].
    #[arg(long, value_name = "PATH")]
    pub cmd_err: Option<PathBuf>,

    /// Polling period for memory stats, e.g. `250ms` [default: 500ms].
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub refresh: Option<Duration>,

    /// Name of the cgroup to create [default: cgmemstat].
    #[arg(long)]
    pub group_name: Option<String>,

    /// Optional TOML file providing defaults for the flags above.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log output format, for the launcher and the child runner [default: text].
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Command to execute, followed by its arguments.
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Merge flags over the optional config file and defaults.
    ///
    /// # Errors
    ///
    /// - `AppError::MissingCommand` if no command was given.
    /// - `AppError::Config` if the config file is unreadable or a value is
    ///   invalid.
    pub fn into_request(self) -> Result<LaunchRequest> {
        let file = match &self.config {
            Some(path) => Settings::load_from_path(path)?,
            None => Settings::default(),
        };
        let flags = Settings {
            debug: self.debug,
            driver: self.driver,
            refresh: self.refresh,
            group_name: self.group_name,
            cmd_out: self.cmd_out,
            cmd_err: self.cmd_err,
            log_format: self.log_format,
        };

        LaunchRequest::new(self.command)?
            .with_settings(file)
            .with_settings(flags)
            .validated()
    }
}
