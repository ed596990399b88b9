// src/cli.rs

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Reconcile the resources declared in a project file until interrupted.
///
/// Each `[resource.<name>]` runs its command once its `refs` are
/// reconciled, and again whenever one of them changes or its refresh
/// interval elapses.
#[derive(Debug, Clone, Parser)]
#[command(name = "resctl", version, long_about = None)]
pub struct CliArgs {
    /// Project file declaring the resources.
    #[arg(long, value_name = "PATH", default_value = "Resctl.toml")]
    pub config: PathBuf,

    /// Exit once every resource has been reconciled. The exit status is
    /// non-zero if any of them ended with an error.
    #[arg(long)]
    pub once: bool,

    /// Overrides `RESCTL_LOG`; defaults to `info`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate the project file and list its resources without starting
    /// the controller.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
