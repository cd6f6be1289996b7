//! Launch configuration: optional TOML settings file and the immutable
//! request a run is started from.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use crate::accounting::GroupConfig;
use crate::driver::CgroupDriver;
use crate::{AppError, Result};

/// Path re-executed to obtain the child runner role.
pub const SELF_EXE: &str = "/proc/self/exe";

/// Default accounting group name.
pub const DEFAULT_GROUP_NAME: &str = "cgmemstat";

/// Default polling period for memory statistics.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(500);

/// Log verbosity, passed explicitly to every component that logs and
/// forwarded to the child runner through its startup token.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Verbosity {
    /// `info` and above.
    #[default]
    Normal,
    /// `debug` and above.
    Debug,
}

impl Verbosity {
    /// Map the `--debug` flag onto a verbosity.
    #[must_use]
    pub const fn from_debug(debug: bool) -> Self {
        if debug {
            Self::Debug
        } else {
            Self::Normal
        }
    }

    /// Whether debug logging is enabled.
    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }

    /// Default `tracing` filter directive for this verbosity.
    #[must_use]
    pub const fn directive(self) -> &'static str {
        match self {
            Self::Normal => "info",
            Self::Debug => "debug",
        }
    }
}

/// Output format of the logs, shared by the launcher and the child runner.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Settings loaded from an optional TOML file. Every key is optional;
/// command-line flags take precedence over values found here.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Settings {
    /// Enable debug logs.
    #[serde(default)]
    pub debug: bool,
    /// Accounting driver variant.
    #[serde(default)]
    pub driver: Option<CgroupDriver>,
    /// Polling period, e.g. `"250ms"` or `"2s"`.
    #[serde(default, with = "humantime_option")]
    pub refresh: Option<Duration>,
    /// Name of the accounting group.
    #[serde(default)]
    pub group_name: Option<String>,
    /// Standard output file of the child command.
    #[serde(default)]
    pub cmd_out: Option<PathBuf>,
    /// Standard error file of the child command.
    #[serde(default)]
    pub cmd_err: Option<PathBuf>,
    /// Log output format.
    #[serde(default)]
    pub log_format: Option<LogFormat>,
}

impl Settings {
    /// Load settings from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Everything needed to start one run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Target program followed by its arguments. Never empty.
    pub command: Vec<OsString>,
    /// Standard output file of the child; `None` means the launcher's stderr.
    pub cmd_out: Option<PathBuf>,
    /// Standard error file of the child; `None` means the launcher's stderr.
    pub cmd_err: Option<PathBuf>,
    /// Period between two memory samples.
    pub refresh: Duration,
    /// Accounting group name and driver.
    pub group: GroupConfig,
    /// Log verbosity for the launcher and the child runner.
    pub verbosity: Verbosity,
    /// Log format for the launcher and the child runner.
    pub log_format: LogFormat,
    /// Executable re-invoked in the child runner role.
    pub runner_exe: PathBuf,
}

impl LaunchRequest {
    /// Build a request for `command` with default settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MissingCommand` if `command` is empty.
    pub fn new(command: Vec<OsString>) -> Result<Self> {
        if command.is_empty() {
            return Err(AppError::MissingCommand);
        }

        Ok(Self {
            command,
            cmd_out: None,
            cmd_err: None,
            refresh: DEFAULT_REFRESH,
            group: GroupConfig {
                name: DEFAULT_GROUP_NAME.to_owned(),
                driver: CgroupDriver::default(),
            },
            verbosity: Verbosity::Normal,
            log_format: LogFormat::default(),
            runner_exe: PathBuf::from(SELF_EXE),
        })
    }

    /// Fill in every value present in `settings`. Later layers override
    /// earlier ones; nothing is checked until [`LaunchRequest::validated`].
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        if settings.debug {
            self.verbosity = Verbosity::Debug;
        }
        if let Some(driver) = settings.driver {
            self.group.driver = driver;
        }
        if let Some(refresh) = settings.refresh {
            self.refresh = refresh;
        }
        if let Some(name) = settings.group_name {
            self.group.name = name;
        }
        if settings.cmd_out.is_some() {
            self.cmd_out = settings.cmd_out;
        }
        if settings.cmd_err.is_some() {
            self.cmd_err = settings.cmd_err;
        }
        if let Some(log_format) = settings.log_format {
            self.log_format = log_format;
        }
        self
    }

    /// Check the fully merged request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the refresh period is zero or the group
    /// name is not a valid cgroup directory and scope unit stem.
    pub fn validated(self) -> Result<Self> {
        if self.refresh.is_zero() {
            return Err(AppError::Config("refresh period must be greater than zero".into()));
        }

        let name = self.group.name.as_str();
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if name.is_empty() || name == "." || name == ".." || !valid_chars {
            return Err(AppError::Config(format!("invalid group name: {name:?}")));
        }

        Ok(self)
    }
}

mod humantime_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
