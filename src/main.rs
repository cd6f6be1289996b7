#![forbid(unsafe_code)]

//! `cgmemstat`: memory usage of a command, sampled from its own cgroup.
//!
//! The same binary plays two roles: the launcher, driven by command-line
//! flags, and the child runner it re-executes to start the target command.

use std::env;
use std::ffi::OsString;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use cgmemstat::accounting::CgroupFs;
use cgmemstat::arbiter::{Outcome, ShutdownListener};
use cgmemstat::cli::Cli;
use cgmemstat::config::{LogFormat, Verbosity};
use cgmemstat::handshake;
use cgmemstat::launcher;
use cgmemstat::{AppError, Result};

fn main() -> ExitCode {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    // The runner branch must never fall through to the launcher, or the
    // binary would keep re-executing itself.
    if let Some((token, command)) = handshake::runner_invocation(&args) {
        if let Err(err) = init_tracing(token.verbosity, token.log_format) {
            eprintln!("{err}");
        }
        let _span = info_span!("runner", role = "child").entered();
        handshake::run_child(command);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match launch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "launcher failed");
            if matches!(err, AppError::MissingCommand) {
                eprintln!("{}", Cli::command().render_usage());
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn launch(cli: Cli) -> Result<()> {
    let log_format = cli.log_format.unwrap_or_default();
    let request = match cli.into_request() {
        Ok(request) => request,
        Err(err) => {
            init_tracing(Verbosity::Normal, log_format)?;
            return Err(err);
        }
    };
    init_tracing(request.verbosity, request.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(async {
            let mut listener = ShutdownListener::install()?;
            let accounting = CgroupFs::system();
            let shutdown = async move { listener.recv().await };

            let outcome = launcher::run(&request, &accounting, shutdown, std::io::stdout())
                .instrument(info_span!("launcher", role = "parent"))
                .await?;

            let report = outcome.report();
            match outcome {
                Outcome::Exited(_) => {
                    info!(exit_code = ?report.code, signal = ?report.signal, "child exited");
                }
                Outcome::Shutdown(_) => {
                    info!(exit_code = ?report.code, signal = ?report.signal, "child stopped on shutdown request");
                }
            }
            Ok(())
        })
}

fn init_tracing(verbosity: Verbosity, log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
