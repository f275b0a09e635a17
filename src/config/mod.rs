//! Site configuration of a Sarus installation (`<prefixDir>/etc/sarus.json`).
//!
//! A [`Configuration`] is loaded and validated once per invocation and is
//! never mutated afterwards; derived configurations are produced with
//! [`Configuration::with_overrides`].

use std::collections::BTreeMap;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bundle::device::DeviceAccess;
use crate::utils;

pub const CONFIG_FILE_NAME: &str = "sarus.json";
pub const SCHEMA_FILE_NAME: &str = "sarus.schema.json";
pub const PREFIX_DIR_ENV: &str = "SARUS_PREFIX_DIR";
const DEFAULT_PREFIX_DIR: &str = "/opt/sarus/default";
const DEFAULT_TERMINATION_TIMEOUT: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RamFilesystemType {
    Tmpfs,
    Ramfs,
}

impl RamFilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RamFilesystemType::Tmpfs => "tmpfs",
            RamFilesystemType::Ramfs => "ramfs",
        }
    }
}

impl Display for RamFilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mount performed in every container of the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteMount {
    #[serde(rename = "type")]
    pub typ: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Bind mount options, e.g. `{"readonly": "", "bind-propagation": "slave"}`
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

/// A device made available in every container of the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteDevice {
    pub source: PathBuf,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub access: Option<String>,
}

/// Site policy applied to the container environment on top of host and image variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentPolicy {
    pub set: BTreeMap<String, String>,
    pub prepend: BTreeMap<String, String>,
    pub append: BTreeMap<String, String>,
    pub unset: Vec<String>,
}

/// Destinations users are not allowed to mount over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UserMountPolicy {
    pub not_allowed_prefixes_of_path: Vec<PathBuf>,
    pub not_allowed_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Configuration {
    pub security_checks: bool,
    #[serde(rename = "OCIBundleDir")]
    pub oci_bundle_dir: PathBuf,
    pub rootfs_folder: String,
    pub prefix_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub local_repository_base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centralized_repository_dir: Option<PathBuf>,
    pub mksquashfs_path: PathBuf,
    pub init_path: PathBuf,
    pub runc_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mksquashfs_options: Option<String>,
    pub ram_filesystem_type: RamFilesystemType,
    #[serde(default)]
    pub site_mounts: Vec<SiteMount>,
    #[serde(default)]
    pub site_devices: Vec<SiteDevice>,
    #[serde(default)]
    pub environment: EnvironmentPolicy,
    #[serde(default)]
    pub user_mounts: UserMountPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks_dir: Option<PathBuf>,
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(
        default,
        rename = "defaultMPIType",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_mpi_type: Option<String>,
    #[serde(default, rename = "enablePMIxv3Support")]
    pub enable_pmix_v3_support: bool,
    /// Seconds granted to the container after a forwarded termination signal
    #[serde(default = "default_termination_timeout")]
    pub termination_timeout: u64,
}

fn default_termination_timeout() -> u64 {
    DEFAULT_TERMINATION_TIMEOUT
}

/// Installation prefix, taken from the environment when set.
pub fn prefix_dir() -> PathBuf {
    env::var_os(PREFIX_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFIX_DIR))
}

pub fn default_config_file() -> PathBuf {
    prefix_dir().join("etc").join(CONFIG_FILE_NAME)
}

/// The schema file shipped next to a configuration file.
pub fn schema_file_for(config_file: &Path) -> PathBuf {
    config_file.with_file_name(SCHEMA_FILE_NAME)
}

fn check_absolute(key: &str, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        bail!(
            "Invalid configuration: '{}' must be an absolute path, found {:?}",
            key,
            path
        );
    }
    Ok(())
}

impl Configuration {
    /// Reads, parses and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("loading configuration from {:?}", path);
        let file = utils::open(path)?;
        let config: Configuration = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse configuration file {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration file {:?}", path))?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Configuration =
            serde_json::from_str(json).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a new configuration with `apply` run on a copy of this one.
    /// The result is validated again, `self` is left untouched.
    pub fn with_overrides<F>(&self, apply: F) -> Result<Self>
    where
        F: FnOnce(&mut Configuration),
    {
        let mut config = self.clone();
        apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_absolute("OCIBundleDir", &self.oci_bundle_dir)?;
        if !self.oci_bundle_dir.is_dir() {
            bail!(
                "Invalid configuration: 'OCIBundleDir' {:?} is not an existing directory",
                self.oci_bundle_dir
            );
        }

        if self.rootfs_folder.is_empty() || self.rootfs_folder.contains('/') {
            bail!(
                "Invalid configuration: 'rootfsFolder' must be a plain directory name, found {:?}",
                self.rootfs_folder
            );
        }

        check_absolute("prefixDir", &self.prefix_dir)?;

        if !self.temp_dir.is_absolute() || !self.temp_dir.is_dir() {
            bail!("Invalid temporary directory \"{}\"", self.temp_dir.display());
        }

        check_absolute("localRepositoryBaseDir", &self.local_repository_base_dir)?;
        if let Some(dir) = &self.centralized_repository_dir {
            check_absolute("centralizedRepositoryDir", dir)?;
        }
        check_absolute("mksquashfsPath", &self.mksquashfs_path)?;
        check_absolute("initPath", &self.init_path)?;
        check_absolute("runcPath", &self.runc_path)?;
        if let Some(profile) = &self.seccomp_profile {
            check_absolute("seccompProfile", profile)?;
        }
        if let Some(dir) = &self.hooks_dir {
            check_absolute("hooksDir", dir)?;
        }

        for mount in &self.site_mounts {
            if mount.typ != "bind" {
                bail!(
                    "Invalid configuration: 'siteMounts' entry for {:?} has unsupported type '{}'",
                    mount.destination,
                    mount.typ
                );
            }
            check_absolute("siteMounts.source", &mount.source)?;
            check_absolute("siteMounts.destination", &mount.destination)?;
        }

        for device in &self.site_devices {
            check_absolute("siteDevices.source", &device.source)?;
            if let Some(destination) = &device.destination {
                check_absolute("siteDevices.destination", destination)?;
            }
            if let Some(access) = &device.access {
                DeviceAccess::parse(access).with_context(|| {
                    format!(
                        "Invalid configuration: 'siteDevices' entry for {:?} has invalid access",
                        device.source
                    )
                })?;
            }
        }

        for path in self
            .user_mounts
            .not_allowed_prefixes_of_path
            .iter()
            .chain(self.user_mounts.not_allowed_paths.iter())
        {
            check_absolute("userMounts", path)?;
        }

        if self.termination_timeout == 0 {
            bail!("Invalid configuration: 'terminationTimeout' must be greater than zero");
        }

        Ok(())
    }

    /// Directory of the image repository the images are looked up in.
    pub fn repository_dir(&self, centralized: bool, username: &str) -> Result<PathBuf> {
        if centralized {
            return self.centralized_repository_dir.clone().with_context(|| {
                "failed to use the centralized repository: 'centralizedRepositoryDir' is not configured"
            });
        }
        Ok(self
            .local_repository_base_dir
            .join(username)
            .join(".sarus"))
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.oci_bundle_dir.join(&self.rootfs_folder)
    }
}
