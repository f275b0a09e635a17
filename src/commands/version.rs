//! Contains functionality of the version command
use clap::Parser;

/// Print the version of Sarus
#[derive(Parser, Debug, Default)]
pub struct Version {}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
