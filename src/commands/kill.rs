//! Contains functionality of the kill command
use anyhow::Result;
use clap::Parser;

use super::{delegate_to_runtime, load_configuration, runtime_root_args, GlobalOpts};

/// Stop a container started by the calling user
#[derive(Parser, Debug)]
pub struct Kill {
    /// Name of the container, as shown by `sarus ps`
    #[clap(required = true)]
    pub container_name: String,
}

/// The container gets SIGHUP, Sarus then handles it like any termination signal.
pub fn kill_args(container_name: &str) -> Vec<String> {
    let mut args = runtime_root_args();
    args.extend(["kill".to_string(), container_name.to_string(), "SIGHUP".to_string()]);
    args
}

pub fn kill(args: Kill, global: &GlobalOpts) -> Result<()> {
    let config = load_configuration(global)?;
    log::info!("killing container {}", args.container_name);
    delegate_to_runtime(&config.runc_path, &kill_args(&args.container_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_args() {
        let args = kill_args("sarus-container-1a2b3c");
        assert_eq!(&args[2..], ["kill", "sarus-container-1a2b3c", "SIGHUP"]);
    }

    #[test]
    fn test_container_name_is_required() {
        assert!(Kill::try_parse_from(["kill"]).is_err());
        let kill = Kill::try_parse_from(["kill", "job"]).unwrap();
        assert_eq!(kill.container_name, "job");
    }
}
