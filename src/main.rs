//! # Sarus
//! Prepares OCI bundles from squashfs images, runs the configured OCI hooks and
//! supervises the low-level runtime that starts the container.

use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sarus::commands::{hooks, images, kill, ps, run, version, GlobalOpts};
use sarus::logger;

/// High-level commandline option definition
#[derive(Parser, Debug)]
#[clap(name = "sarus", version, about)]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,
    /// command to execute
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Run(run::Run),
    Hooks(hooks::Hooks),
    Images(images::Images),
    Ps(ps::Ps),
    Kill(kill::Kill),
    Version(version::Version),
}

/// Exit code of the command, which is the exit code of the container for `run`.
fn execute(opts: Opts) -> Result<i32> {
    let global = opts.global;
    match opts.subcmd {
        SubCommand::Run(args) => run::run(args, &global),
        SubCommand::Hooks(args) => hooks::hooks(args, &global).map(|()| 0),
        SubCommand::Images(args) => images::images(args, &global).map(|()| 0),
        SubCommand::Ps(args) => ps::ps(args, &global).map(|()| 0),
        SubCommand::Kill(args) => kill::kill(args, &global).map(|()| 0),
        SubCommand::Version(_) => {
            println!("{}", version::version());
            Ok(0)
        }
    }
}

fn main() {
    let opts = Opts::parse();

    if let Err(e) = logger::init(opts.global.log_level(), opts.global.log_file.clone()) {
        eprintln!("log init failed: {:?}", e);
    }

    match execute(opts) {
        Ok(code) => process::exit(code),
        Err(e) => {
            log::debug!("{:?}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
