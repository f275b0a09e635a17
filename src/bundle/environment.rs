//! Environment of the container process.
//!
//! Lowest to highest precedence: host, image, site `prepend`/`append`,
//! site `set`, site `unset`, `--env` options.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::config::EnvironmentPolicy;
use crate::utils;

pub type Environment = BTreeMap<String, String>;

const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
const NVIDIA_DRIVER_CAPABILITIES: &str = "NVIDIA_DRIVER_CAPABILITIES";

/// Inputs of the environment resolution.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentSources<'a> {
    pub host: &'a Environment,
    pub image: &'a [String],
    pub policy: &'a EnvironmentPolicy,
    pub cli: &'a [String],
    pub mpi: bool,
    pub ssh: bool,
    pub pmix_v3: bool,
}

pub fn resolve_environment(sources: &EnvironmentSources) -> Result<Environment> {
    let mut env = sources.host.clone();

    for variable in sources.image {
        match variable.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.insert(key.to_string(), value.to_string());
            }
            _ => log::warn!("ignoring malformed image environment variable '{}'", variable),
        }
    }

    set_nvidia_variables(sources.host, &mut env);
    if sources.pmix_v3 {
        set_pmix_variables(&mut env);
    }

    let policy = sources.policy;
    let mut extended: Vec<&String> = policy.prepend.keys().chain(policy.append.keys()).collect();
    extended.sort();
    extended.dedup();
    // a missing base adds no empty component: `P:A`, never `P::A`
    for key in extended {
        let parts: Vec<&str> = [
            policy.prepend.get(key),
            env.get(key),
            policy.append.get(key),
        ]
        .iter()
        .flatten()
        .map(|s| s.as_str())
        .collect();
        let value = parts.join(":");
        env.insert(key.clone(), value);
    }

    for (key, value) in &policy.set {
        env.insert(key.clone(), value.clone());
    }

    for key in &policy.unset {
        env.remove(key);
    }

    if sources.mpi {
        env.insert("SARUS_MPI_HOOK".to_string(), "1".to_string());
    }
    if sources.ssh {
        env.insert("SARUS_SSH_HOOK".to_string(), "1".to_string());
    }

    for token in sources.cli {
        let (key, value) = utils::parse_key_value(token).map_err(|e| {
            anyhow!(
                "Failed to parse environment variable requested from CLI '{}': {}",
                token,
                e
            )
        })?;
        match value {
            Some(value) => {
                env.insert(key, value);
            }
            None => {
                env.remove(&key);
            }
        }
    }

    Ok(env)
}

/// Makes GPUs assigned through `CUDA_VISIBLE_DEVICES` on the host visible to the
/// NVIDIA container hook. Indices are renumbered, since inside the container the
/// assigned devices are the only ones and are enumerated from zero.
fn set_nvidia_variables(host: &Environment, env: &mut Environment) {
    match host.get(CUDA_VISIBLE_DEVICES) {
        Some(devices) if devices != "NoDevFiles" && !devices.is_empty() => {
            env.insert(NVIDIA_VISIBLE_DEVICES.to_string(), devices.clone());
            env.entry(NVIDIA_DRIVER_CAPABILITIES.to_string())
                .or_insert_with(|| "all".to_string());

            let host_ids: Vec<&str> = devices.split(',').collect();
            let mut sorted = host_ids.clone();
            sorted.sort_by_key(|id| (id.parse::<u64>().ok(), id.to_string()));
            let container_ids: Vec<String> = host_ids
                .iter()
                .filter_map(|id| sorted.iter().position(|s| s == id))
                .map(|index| index.to_string())
                .collect();
            env.insert(CUDA_VISIBLE_DEVICES.to_string(), container_ids.join(","));
        }
        _ => {
            for key in [
                "CUDA_VERSION",
                CUDA_VISIBLE_DEVICES,
                NVIDIA_VISIBLE_DEVICES,
                NVIDIA_DRIVER_CAPABILITIES,
            ] {
                env.remove(key);
            }
        }
    }
}

/// MCA parameters letting PMIx v3 clients in the container talk to the host
/// PMIx server. Values already present are kept.
fn set_pmix_variables(env: &mut Environment) {
    for (key, value) in [
        ("PMIX_MCA_ptl", "^usock"),
        ("PMIX_MCA_psec", "none"),
        ("PMIX_SYSTEM_TMPDIR", "/var/empty"),
        ("PMIX_MCA_gds", "^ds21"),
    ] {
        env.entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
}

/// `KEY=VALUE` strings for the OCI process.
pub fn to_list(env: &Environment) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}
