//! Subcommands of the `sarus` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use crate::config::{self, Configuration};
use crate::hooks::HookRegistry;
use crate::security::SecurityChecks;
use crate::supervisor;

pub mod hooks;
pub mod images;
pub mod kill;
pub mod ps;
pub mod run;
pub mod version;

/// Options accepted before the subcommand
#[derive(Parser, Debug, Default)]
pub struct GlobalOpts {
    /// Print debug messages, including the ones of the hooks
    #[clap(long)]
    pub debug: bool,
    /// Print informative messages
    #[clap(long)]
    pub verbose: bool,
    /// Configuration file to use instead of the one of the installation
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Write log messages to this file instead of standard error
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

impl GlobalOpts {
    pub fn log_level(&self) -> Option<LevelFilter> {
        if self.debug {
            Some(LevelFilter::Debug)
        } else if self.verbose {
            Some(LevelFilter::Info)
        } else {
            None
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(config::default_config_file)
    }
}

/// Wrong usage of a subcommand. Shown to the user with a pointer to the help
/// of the subcommand.
#[derive(Debug, thiserror::Error)]
#[error("{cause:#}\nSee 'sarus help {command}'")]
pub struct UsageError {
    pub command: &'static str,
    pub cause: anyhow::Error,
}

impl UsageError {
    pub fn new(command: &'static str, cause: anyhow::Error) -> Self {
        Self { command, cause }
    }
}

/// Loads the configuration named by the global options.
pub fn load_configuration(global: &GlobalOpts) -> Result<Configuration> {
    load_checked_configuration(&global.config_file(), &SecurityChecks::default())
}

/// The configuration file and its schema are checked before anything is read.
fn load_checked_configuration(file: &Path, checks: &SecurityChecks) -> Result<Configuration> {
    checks.check_config_files(file, &config::schema_file_for(file))?;
    Configuration::load(file)
}

/// Hooks of the `hooksDir` of the configuration, none when it is not set.
pub fn load_hooks(config: &Configuration) -> Result<HookRegistry> {
    match &config.hooks_dir {
        Some(dir) => HookRegistry::discover(dir),
        None => Ok(HookRegistry::empty()),
    }
}

/// Arguments selecting the runtime state directory of the calling user.
fn runtime_root_args() -> Vec<String> {
    vec![
        "--root".to_string(),
        supervisor::runtime_root().display().to_string(),
    ]
}

/// Runs the low-level runtime with its output going straight to ours.
fn delegate_to_runtime(runtime: &Path, args: &[String]) -> Result<()> {
    log::debug!("executing {:?} {:?}", runtime, args);
    let status = Command::new(runtime)
        .args(args)
        .status()
        .with_context(|| format!("failed to execute {:?}", runtime))?;
    if !status.success() {
        bail!("{:?} {} failed with {}", runtime, args.join(" "), status);
    }
    Ok(())
}
