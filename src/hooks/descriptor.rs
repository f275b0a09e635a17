//! Hook descriptor files, one JSON document per hook:
//!
//! ```json
//! {
//!     "version": "1.0.0",
//!     "hook": {"path": "/opt/sarus/bin/mpi_hook", "args": ["mpi_hook"], "env": ["LDCONFIG_PATH=/sbin/ldconfig"]},
//!     "when": {"annotations": {"^com.hooks.mpi.enabled$": "^true$"}},
//!     "stages": ["createContainer"]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use oci_spec::runtime::{Hook, HookBuilder};
use serde::{Deserialize, Serialize};

use super::condition::{Condition, Pattern};
use crate::utils;

pub const SUPPORTED_VERSION: &str = "1.0.0";

/// Points of the container lifecycle hooks are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prestart => "prestart",
            Stage::CreateRuntime => "createRuntime",
            Stage::CreateContainer => "createContainer",
            Stage::StartContainer => "startContainer",
            Stage::Poststart => "poststart",
            Stage::Poststop => "poststop",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let stage = match s {
            "prestart" => Stage::Prestart,
            "createRuntime" => Stage::CreateRuntime,
            "createContainer" => Stage::CreateContainer,
            "startContainer" => Stage::StartContainer,
            "poststart" => Stage::Poststart,
            "poststop" => Stage::Poststop,
            other => bail!("unknown hook stage '{}'", other),
        };
        Ok(stage)
    }
}

/// The program run by a hook, with OCI `args` semantics (`args[0]` is argv[0]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookCommand {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds the hook may run before it is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawConditions {
    always: Option<bool>,
    annotations: Option<BTreeMap<String, String>>,
    commands: Option<Vec<String>>,
    has_bind_mounts: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    version: String,
    hook: HookCommand,
    when: RawConditions,
    stages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookDescriptor {
    /// File stem of the descriptor, e.g. `07-mpi-hook`
    pub name: String,
    pub file: PathBuf,
    pub hook: HookCommand,
    pub conditions: Vec<Condition>,
    pub stages: Vec<Stage>,
}

impl HookDescriptor {
    pub fn load(file: &Path) -> Result<Self> {
        let reader = utils::open(file)?;
        let raw: RawDescriptor = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse hook descriptor {:?}", file))?;
        Self::from_raw(file, raw).with_context(|| format!("invalid hook descriptor {:?}", file))
    }

    pub fn from_json(file: &Path, json: &str) -> Result<Self> {
        let raw: RawDescriptor = serde_json::from_str(json)
            .with_context(|| format!("failed to parse hook descriptor {:?}", file))?;
        Self::from_raw(file, raw)
    }

    fn from_raw(file: &Path, raw: RawDescriptor) -> Result<Self> {
        if raw.version != SUPPORTED_VERSION {
            bail!(
                "Failed to parse OCI hook. The only supported version is {}, but found {}.",
                SUPPORTED_VERSION,
                raw.version
            );
        }

        if !raw.hook.path.is_absolute() {
            bail!("hook path {:?} must be absolute", raw.hook.path);
        }

        let mut conditions = Vec::new();
        if let Some(always) = raw.when.always {
            conditions.push(Condition::Always(always));
        }
        if let Some(annotations) = raw.when.annotations {
            let pairs = annotations
                .iter()
                .map(|(k, v)| Ok((Pattern::new(k)?, Pattern::new(v)?)))
                .collect::<Result<Vec<_>>>()?;
            conditions.push(Condition::Annotations(pairs));
        }
        if let Some(commands) = raw.when.commands {
            let patterns = commands
                .iter()
                .map(|c| Pattern::new(c))
                .collect::<Result<Vec<_>>>()?;
            conditions.push(Condition::Commands(patterns));
        }
        if let Some(has_bind_mounts) = raw.when.has_bind_mounts {
            conditions.push(Condition::HasBindMounts(has_bind_mounts));
        }
        if conditions.is_empty() {
            bail!("'when' must contain at least one condition");
        }

        if raw.stages.is_empty() {
            bail!("'stages' must contain at least one stage");
        }
        let stages = raw
            .stages
            .iter()
            .map(|s| Stage::from_str(s))
            .collect::<Result<Vec<_>>>()?;

        let name = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            file: file.to_path_buf(),
            hook: raw.hook,
            conditions,
            stages,
        })
    }

    pub fn fires_on(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// The hook in the form the low-level runtime expects in `config.json`.
    pub fn to_oci_hook(&self) -> Result<Hook> {
        let mut builder = HookBuilder::default().path(self.hook.path.clone());
        if !self.hook.args.is_empty() {
            builder = builder.args(self.hook.args.clone());
        }
        if !self.hook.env.is_empty() {
            builder = builder.env(self.hook.env.clone());
        }
        if let Some(timeout) = self.hook.timeout {
            builder = builder.timeout(timeout as i64);
        }
        builder
            .build()
            .with_context(|| format!("failed to build OCI hook for {}", self.name))
    }
}
