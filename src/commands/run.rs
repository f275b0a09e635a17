use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use super::{load_configuration, load_hooks, GlobalOpts, UsageError};
use crate::bundle::{Bundle, BundleBuilder, ContainerRequest, UserIdentity};
use crate::hooks::{ContainerStatus, HookOrchestrator, Stage};
use crate::image::{ImageReference, ImageStore, LocalImageStore};
use crate::rootfs;
use crate::security::SecurityChecks;
use crate::supervisor::Supervisor;
use crate::utils;

/// Run a command in a new container
#[derive(Parser, Debug)]
pub struct Run {
    /// Working directory inside the container
    #[clap(short, long)]
    pub workdir: Option<PathBuf>,
    /// Mount custom directories into the container
    #[clap(long = "mount")]
    pub mounts: Vec<String>,
    /// Mount custom devices into the container, `<host>[:<container>][:<access>]`
    #[clap(long = "device")]
    pub devices: Vec<String>,
    /// Set environment variables in the container
    #[clap(short, long = "env")]
    pub env: Vec<String>,
    /// Add annotations to the container
    #[clap(long = "annotation")]
    pub annotations: Vec<String>,
    /// PID namespace to use, 'private' or 'host'
    #[clap(long, default_value = "private")]
    pub pid: String,
    /// Run an init process inside the container that forwards signals and reaps processes
    #[clap(long)]
    pub init: bool,
    /// Enable SSH in the container
    #[clap(long)]
    pub ssh: bool,
    /// Enable MPI support
    #[clap(short, long)]
    pub mpi: bool,
    /// Enable MPI support with a specific MPI type
    #[clap(long)]
    pub mpi_type: Option<String>,
    /// Enable replacement of the container glibc with the host one
    #[clap(long)]
    pub glibc: bool,
    /// Overwrite the default entrypoint of the image, an empty string clears it
    #[clap(long)]
    pub entrypoint: Option<String>,
    /// Assign a name to the container
    #[clap(short, long)]
    pub name: Option<String>,
    /// Use the centralized repository instead of the local one
    #[clap(long)]
    pub centralized_repository: bool,
    /// Image to start the container from
    pub image: String,
    /// Command and arguments to execute in the container
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Run {
    pub fn to_request(&self) -> Result<ContainerRequest> {
        let image = ImageReference::parse(&self.image)?;
        let mut request = ContainerRequest::new(image);
        request.command = self.command.clone();
        request.entrypoint = self
            .entrypoint
            .as_ref()
            .map(|entry| entry.split_whitespace().map(str::to_string).collect());
        request.workdir = self.workdir.clone();
        request.mounts = self.mounts.clone();
        request.devices = self.devices.clone();
        request.env = self.env.clone();
        request.annotations = self.annotations.clone();
        request.pid_mode = self.pid.parse()?;
        request.init = self.init;
        request.ssh = self.ssh;
        request.mpi = self.mpi;
        request.mpi_type = self.mpi_type.clone();
        request.glibc = self.glibc;
        request.name = self.name.clone();
        request.centralized_repository = self.centralized_repository;
        request.validate()?;
        Ok(request)
    }
}

/// Builds the bundle of the container, then sets up the filesystem it lives in
/// and writes it there. Nothing is mounted for an invalid request.
fn create_bundle<F>(
    builder: &BundleBuilder,
    container_id: &str,
    prepare_rootfs: F,
) -> Result<Bundle>
where
    F: FnOnce() -> Result<()>,
{
    let bundle = builder
        .build(container_id)
        .map_err(|e| UsageError::new("run", e))?;
    prepare_rootfs()?;
    bundle.write()?;
    Ok(bundle)
}

/// Runs the container in the foreground and returns its exit code.
pub fn run(args: Run, global: &GlobalOpts) -> Result<i32> {
    let request = args.to_request().map_err(|e| UsageError::new("run", e))?;
    let config = load_configuration(global)?;
    let registry = load_hooks(&config)?;
    let checks = SecurityChecks::default();
    checks.run(&config, Some(&registry))?;

    let username = utils::current_username()?;
    let repository = config.repository_dir(request.centralized_repository, &username)?;
    let store = if request.centralized_repository {
        LocalImageStore::centralized(repository)
    } else {
        LocalImageStore::new(repository)
    };
    let image = store.find(&request.image)?;
    let metadata = image.metadata()?;
    let identity = UserIdentity::current()?;

    let container_id = request
        .name
        .clone()
        .unwrap_or_else(utils::random_container_name);
    let builder = BundleBuilder::new(&config, &request, &metadata)
        .with_hooks(&registry)
        .with_identity(identity.clone());
    let mut bundle = create_bundle(&builder, &container_id, || {
        rootfs::prepare_rootfs(&config, &image.image_path, &identity)
    })?;
    if config.security_checks {
        checks.check_path_is_untamperable(&bundle.config_path())?;
    }

    let orchestrator = HookOrchestrator::new(&registry);
    orchestrator.run_pre_launch(&mut bundle)?;

    let mut container = Supervisor::new(&config)
        .launch(&bundle)
        .with_context(|| format!("failed to launch container {}", container_id))?;
    let pid = container.wait_for_init_pid().map(|pid| pid.as_raw());
    let poststart =
        orchestrator.run_stage(Stage::Poststart, &mut bundle, ContainerStatus::Running, pid);
    if let Err(e) = poststart {
        log::warn!("poststart hooks of container {} failed: {:#}", container_id, e);
    }

    let state = container.wait();
    container.cleanup();
    let poststop =
        orchestrator.run_stage(Stage::Poststop, &mut bundle, ContainerStatus::Stopped, None);
    if let Err(e) = poststop {
        log::warn!("poststop hooks of container {} failed: {:#}", container_id, e);
    }

    let state = state?;
    log::info!("container {} finished: {:?}", container_id, state);
    Ok(state.exit_code())
}
