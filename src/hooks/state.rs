//! State of the container as handed to hooks on their standard input
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const OCI_VERSION: &str = "1.0.0";

/// Lifecycle status reported to hooks
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    /// Pre-launch stages, the runtime has not been started yet
    #[default]
    Creating,
    Created,
    /// Seen by poststart hooks
    Running,
    /// Seen by poststop hooks
    Stopped,
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };

        write!(f, "{}", print)
    }
}

/// OCI state of the container, written as JSON on the standard input of every hook.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    /// Pid of the container process, only known once the runtime started it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Absolute path of the bundle directory
    pub bundle: String,
    pub annotations: BTreeMap<String, String>,
}

impl State {
    pub fn new(
        container_id: &str,
        status: ContainerStatus,
        pid: Option<i32>,
        bundle: &Path,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id: container_id.to_string(),
            status,
            pid,
            bundle: bundle.display().to_string(),
            annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_state_serialization() -> Result<()> {
        let mut annotations = BTreeMap::new();
        annotations.insert("com.hooks.mpi.enabled".to_string(), "true".to_string());
        let state = State::new(
            "sarus-container-1",
            ContainerStatus::Creating,
            None,
            Path::new("/var/sarus/OCIBundleDir"),
            annotations,
        );
        let json: serde_json::Value = serde_json::to_value(&state)?;
        assert_eq!(json["ociVersion"], "1.0.0");
        assert_eq!(json["status"], "creating");
        assert_eq!(json["bundle"], "/var/sarus/OCIBundleDir");
        assert_eq!(json["annotations"]["com.hooks.mpi.enabled"], "true");
        assert!(json.get("pid").is_none());

        let running = State {
            status: ContainerStatus::Running,
            pid: Some(42),
            ..state
        };
        let json: serde_json::Value = serde_json::to_value(&running)?;
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 42);
        Ok(())
    }
}
