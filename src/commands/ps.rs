//! Contains functionality of the ps command
use anyhow::Result;
use clap::Parser;

use super::{delegate_to_runtime, load_configuration, runtime_root_args, GlobalOpts};

/// List the containers of the calling user
#[derive(Parser, Debug, Default)]
pub struct Ps {}

pub fn list_args() -> Vec<String> {
    let mut args = runtime_root_args();
    args.push("list".to_string());
    args
}

pub fn ps(_args: Ps, global: &GlobalOpts) -> Result<()> {
    let config = load_configuration(global)?;
    delegate_to_runtime(&config.runc_path, &list_args())
}
