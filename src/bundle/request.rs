use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::image::ImageReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PidMode {
    #[default]
    Private,
    Host,
}

impl FromStr for PidMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(PidMode::Private),
            "host" => Ok(PidMode::Host),
            other => bail!(
                "Incorrect value provided for --pid option: '{}'. Supported values: 'host', 'private'.",
                other
            ),
        }
    }
}

/// What the user asked for on the command line. Options are kept as the raw
/// tokens typed by the user so that diagnostics can echo them back.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub image: ImageReference,
    pub command: Vec<String>,
    /// `Some(vec![])` clears the entrypoint of the image
    pub entrypoint: Option<Vec<String>>,
    pub workdir: Option<PathBuf>,
    pub mounts: Vec<String>,
    pub devices: Vec<String>,
    pub env: Vec<String>,
    pub annotations: Vec<String>,
    pub pid_mode: PidMode,
    pub init: bool,
    pub ssh: bool,
    pub mpi: bool,
    pub mpi_type: Option<String>,
    pub glibc: bool,
    pub name: Option<String>,
    pub centralized_repository: bool,
}

impl ContainerRequest {
    pub fn new(image: ImageReference) -> Self {
        Self {
            image,
            command: Vec::new(),
            entrypoint: None,
            workdir: None,
            mounts: Vec::new(),
            devices: Vec::new(),
            env: Vec::new(),
            annotations: Vec::new(),
            pid_mode: PidMode::default(),
            init: false,
            ssh: false,
            mpi: false,
            mpi_type: None,
            glibc: false,
            name: None,
            centralized_repository: false,
        }
    }

    /// Checks the options that are wrong regardless of the image and the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(workdir) = &self.workdir {
            if !workdir.is_absolute() {
                bail!(
                    "The working directory '{}' is invalid, it needs to be an absolute path.",
                    workdir.display()
                );
            }
        }
        if self.ssh && self.pid_mode == PidMode::Host {
            bail!(
                "The use of '--ssh' is incompatible with '--pid=host'. The SSH hook requires the use of a private PID namespace"
            );
        }
        Ok(())
    }

    /// `--mpi-type` turns MPI support on by itself.
    pub fn mpi_enabled(&self) -> bool {
        self.mpi || self.mpi_type.is_some()
    }
}
