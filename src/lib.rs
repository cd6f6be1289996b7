#![forbid(unsafe_code)]

//! `cgmemstat` runs a command inside a fresh memory cgroup and streams its
//! memory usage.
//!
//! The target command is started through a self re-exec that stops itself
//! before `exec`, so the command is already accounted for when it runs its
//! first instruction.

pub mod accounting;
pub mod arbiter;
pub mod cli;
pub mod config;
pub mod driver;
pub mod errors;
pub mod handshake;
pub mod launcher;
pub mod sample;
pub mod sampler;

pub use config::LaunchRequest;
pub use errors::{AppError, Result};
