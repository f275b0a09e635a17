//! Device requests (`--device=<host>[:<container>][:<access>]` and `siteDevices`)
//! and their resolution into bind mounts plus devices cgroup rules.

use std::fmt::Display;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use cgroups::v1::{DeviceType, HostWhitelist};
use nix::sys::stat::{major, minor};

use crate::config::SiteDevice;

const ACCESS_HINT: &str =
    "Device access must be entered as a combination of 'rwm' characters, with no repetitions";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceAccessError {
    #[error("Input string for device access is empty")]
    Empty,
    #[error("Input string for device access '{0}' is longer than 3 characters")]
    TooLong(String),
    #[error("Input string for device access '{0}' has repeated characters")]
    Repeated(String),
    #[error("Input string for device access '{0}' contains an invalid character")]
    InvalidCharacter(String),
}

/// Access bits of a device: read, write, mknod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAccess {
    read: bool,
    write: bool,
    mknod: bool,
}

impl DeviceAccess {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            mknod: true,
        }
    }

    pub fn parse(input: &str) -> Result<Self, DeviceAccessError> {
        if input.is_empty() {
            return Err(DeviceAccessError::Empty);
        }
        if input.chars().count() > 3 {
            return Err(DeviceAccessError::TooLong(input.to_string()));
        }

        let mut access = Self::default();
        for c in input.chars() {
            let bit = match c {
                'r' => &mut access.read,
                'w' => &mut access.write,
                'm' => &mut access.mknod,
                _ => return Err(DeviceAccessError::InvalidCharacter(input.to_string())),
            };
            if *bit {
                return Err(DeviceAccessError::Repeated(input.to_string()));
            }
            *bit = true;
        }
        Ok(access)
    }

    pub fn is_empty(&self) -> bool {
        !(self.read || self.write || self.mknod)
    }

    /// Reads canonical or partial `rwm` strings as found in cgroup files.
    fn from_cgroup(bits: &str) -> Self {
        Self {
            read: bits.contains('r'),
            write: bits.contains('w'),
            mknod: bits.contains('m'),
        }
    }
}

impl Display for DeviceAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::with_capacity(3);
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.mknod {
            s.push('m');
        }
        write!(f, "{}", s)
    }
}

impl FromStr for DeviceAccess {
    type Err = DeviceAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A syntactically valid device request, not yet checked against the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub access: DeviceAccess,
}

fn validate_device_path(path: &Path, context: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("detected empty {} device path", context);
    }
    if path.is_relative() {
        bail!(
            "{} device path '{}' must be absolute",
            context,
            path.display()
        );
    }
    Ok(())
}

fn parse_access(access: &str) -> Result<DeviceAccess> {
    DeviceAccess::parse(access).map_err(|e| anyhow!("{}. {}", e, ACCESS_HINT))
}

impl DeviceRequest {
    /// Parses `<host>[:<container>][:<access>]`. With two tokens, a relative
    /// second token is the access string, an absolute one the container path.
    pub fn parse(request: &str) -> Result<Self> {
        log::debug!("parsing device request '{}'", request);
        if request.is_empty() {
            bail!("Invalid device request: no values provided");
        }

        let tokens: Vec<&str> = request.split(':').collect();
        if tokens.len() > 3 {
            bail!(
                "Invalid device request '{}': too many tokens provided. The format of the option value must be at most '<host device>:<container device>:<access>'",
                request
            );
        }

        let source = PathBuf::from(tokens[0]);
        let mut destination = source.clone();
        let mut access = "rwm";
        match tokens[..] {
            [_, container, requested] => {
                destination = PathBuf::from(container);
                access = requested;
            }
            [_, second] => {
                if Path::new(second).is_relative() {
                    access = second;
                } else {
                    destination = PathBuf::from(second);
                }
            }
            _ => {}
        }

        let parsed = || -> Result<Self> {
            validate_device_path(&source, "host")?;
            validate_device_path(&destination, "container")?;
            let access = parse_access(access)?;
            Ok(Self {
                source: source.clone(),
                destination: destination.clone(),
                access,
            })
        };
        parsed().map_err(|e| anyhow!("Invalid device request '{}': {}", request, e))
    }

    pub fn from_site(device: &SiteDevice) -> Result<Self> {
        let destination = device
            .destination
            .clone()
            .unwrap_or_else(|| device.source.clone());
        validate_device_path(&device.source, "host")?;
        validate_device_path(&destination, "container")?;
        let access = match &device.access {
            Some(access) => parse_access(access)?,
            None => DeviceAccess::all(),
        };
        Ok(Self {
            source: device.source.clone(),
            destination,
            access,
        })
    }
}

/// A device bound into the container together with its cgroup permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub typ: DeviceType,
    pub major: u64,
    pub minor: u64,
    pub access: DeviceAccess,
}

impl DeviceEntry {
    /// Checks that the source is a device file and grants at most what the
    /// devices cgroup of the calling process allows.
    pub fn resolve(request: &DeviceRequest, whitelist: &HostWhitelist) -> Result<Self> {
        let metadata = fs::metadata(&request.source).map_err(|e| {
            anyhow!(
                "Failed to check if path {:?} is a device file: {}",
                request.source,
                e
            )
        })?;

        let file_type = metadata.file_type();
        let typ = if file_type.is_char_device() {
            DeviceType::Char
        } else if file_type.is_block_device() {
            DeviceType::Block
        } else {
            bail!("Source path {:?} is not a device file", request.source);
        };

        let rdev = metadata.rdev();
        let (major, minor) = (major(rdev), minor(rdev));
        let granted = whitelist.effective_access(typ, major, minor, &request.access.to_string());
        let access = DeviceAccess::from_cgroup(&granted);
        if access.is_empty() {
            bail!(
                "access '{}' to device {:?} ({} {}:{}) is not allowed by the devices cgroup of the calling process",
                request.access,
                request.source,
                typ.as_char(),
                major,
                minor
            );
        }
        if access != request.access {
            log::info!(
                "access to device {:?} reduced from '{}' to '{}' by the devices cgroup of the calling process",
                request.source,
                request.access,
                access
            );
        }

        Ok(Self {
            source: request.source.clone(),
            destination: request.destination.clone(),
            typ,
            major,
            minor,
            access,
        })
    }

}

/// Resolves a `--device` option value.
pub fn resolve_cli_device(request: &str, whitelist: &HostWhitelist) -> Result<DeviceEntry> {
    let parsed = DeviceRequest::parse(request)?;
    DeviceEntry::resolve(&parsed, whitelist)
        .map_err(|e| anyhow!("Invalid device request '{}': {}", request, e))
}

pub fn resolve_site_device(device: &SiteDevice, whitelist: &HostWhitelist) -> Result<DeviceEntry> {
    let parsed = DeviceRequest::from_site(device)
        .and_then(|request| DeviceEntry::resolve(&request, whitelist))
        .map_err(|e| anyhow!("Invalid site device {:?}: {}", device.source, e))?;
    Ok(parsed)
}

/// Site devices come first and cannot be overridden: a CLI device using the
/// destination or the source of a site device is dropped.
pub fn merge_devices(site: Vec<DeviceEntry>, cli: Vec<DeviceEntry>) -> Vec<DeviceEntry> {
    let mut merged = site;
    let site_count = merged.len();
    for device in cli {
        let clash = merged[..site_count]
            .iter()
            .find(|s| s.destination == device.destination || s.source == device.source);
        if let Some(site_device) = clash {
            log::warn!(
                "ignoring device request {:?}:{:?}: device {:?} is already configured by the site with access '{}'",
                device.source,
                device.destination,
                site_device.source,
                site_device.access
            );
            continue;
        }
        merged.push(device);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const NULL_RULES: &str = "c 1:3 rwm\n";

    fn access(s: &str) -> DeviceAccess {
        DeviceAccess::parse(s).unwrap()
    }

    #[test]
    fn test_access_parse() {
        assert_eq!(access("rwm").to_string(), "rwm");
        assert_eq!(access("mr").to_string(), "rm");
        assert_eq!(access("w").to_string(), "w");
    }

    #[test]
    fn test_access_errors() {
        assert_eq!(DeviceAccess::parse(""), Err(DeviceAccessError::Empty));
        assert_eq!(
            DeviceAccess::parse("rwmm").unwrap_err().to_string(),
            "Input string for device access 'rwmm' is longer than 3 characters"
        );
        assert_eq!(
            DeviceAccess::parse("rr").unwrap_err().to_string(),
            "Input string for device access 'rr' has repeated characters"
        );
        assert_eq!(
            DeviceAccess::parse("rwx").unwrap_err().to_string(),
            "Input string for device access 'rwx' contains an invalid character"
        );
    }

    quickcheck! {
        fn property_test_access_grammar(input: String) -> bool {
            let chars: Vec<char> = input.chars().collect();
            let mut unique = chars.clone();
            unique.sort_unstable();
            unique.dedup();
            let expected = (1..=3).contains(&chars.len())
                && chars.iter().all(|c| "rwm".contains(*c))
                && unique.len() == chars.len();
            DeviceAccess::parse(&input).is_ok() == expected
        }
    }

    #[test]
    fn test_request_forms() -> Result<()> {
        let only_source = DeviceRequest::parse("/dev/fuse")?;
        assert_eq!(only_source.destination, PathBuf::from("/dev/fuse"));
        assert_eq!(only_source.access, DeviceAccess::all());

        let with_access = DeviceRequest::parse("/dev/fuse:rw")?;
        assert_eq!(with_access.destination, PathBuf::from("/dev/fuse"));
        assert_eq!(with_access.access, access("rw"));

        let with_destination = DeviceRequest::parse("/dev/fuse:/dev/container-fuse")?;
        assert_eq!(
            with_destination.destination,
            PathBuf::from("/dev/container-fuse")
        );
        assert_eq!(with_destination.access, DeviceAccess::all());

        let full = DeviceRequest::parse("/dev/fuse:/dev/container-fuse:r")?;
        assert_eq!(full.destination, PathBuf::from("/dev/container-fuse"));
        assert_eq!(full.access, access("r"));
        Ok(())
    }

    #[test]
    fn test_request_errors() {
        let message = |request: &str| DeviceRequest::parse(request).unwrap_err().to_string();

        assert_eq!(message(""), "Invalid device request: no values provided");
        assert_eq!(
            message("/dev/a:/dev/b:rw:m"),
            "Invalid device request '/dev/a:/dev/b:rw:m': too many tokens provided. The format of the option value must be at most '<host device>:<container device>:<access>'"
        );
        assert_eq!(
            message(":/dev/fuse"),
            "Invalid device request ':/dev/fuse': detected empty host device path"
        );
        assert_eq!(
            message("dev/fuse"),
            "Invalid device request 'dev/fuse': host device path 'dev/fuse' must be absolute"
        );
        assert_eq!(
            message("/dev/fuse:dev/fuse:rw"),
            "Invalid device request '/dev/fuse:dev/fuse:rw': container device path 'dev/fuse' must be absolute"
        );
        assert_eq!(
            message("/dev/fuse:rwmm"),
            "Invalid device request '/dev/fuse:rwmm': Input string for device access 'rwmm' is longer than 3 characters. Device access must be entered as a combination of 'rwm' characters, with no repetitions"
        );
        assert!(message("/dev/fuse::").contains("detected empty container device path"));
    }

    #[test]
    fn test_resolve_character_device() -> Result<()> {
        let whitelist = HostWhitelist::parse(NULL_RULES)?;
        let device = resolve_cli_device("/dev/null:/dev/container-null:rw", &whitelist)?;
        assert_eq!(device.typ, DeviceType::Char);
        assert_eq!((device.major, device.minor), (1, 3));
        assert_eq!(device.destination, PathBuf::from("/dev/container-null"));
        assert_eq!(device.access.to_string(), "rw");
        Ok(())
    }

    #[test]
    fn test_resolve_is_bounded_by_host_whitelist() -> Result<()> {
        let whitelist = HostWhitelist::parse("c 1:3 r\n")?;
        let device = resolve_cli_device("/dev/null", &whitelist)?;
        assert_eq!(device.access, access("r"));

        let err = resolve_cli_device("/dev/null:w", &whitelist).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Invalid device request '/dev/null:w': access 'w' to device"));
        Ok(())
    }

    #[test]
    fn test_resolve_rejects_regular_paths() {
        let whitelist = HostWhitelist::allow_all();
        assert_eq!(
            resolve_cli_device("/home", &whitelist)
                .unwrap_err()
                .to_string(),
            "Invalid device request '/home': Source path \"/home\" is not a device file"
        );
        assert!(resolve_cli_device("/dev/does-not-exist", &whitelist)
            .unwrap_err()
            .to_string()
            .contains("Failed to check if path \"/dev/does-not-exist\" is a device file"));
    }

    #[test]
    fn test_site_device_defaults() -> Result<()> {
        let site = SiteDevice {
            source: PathBuf::from("/dev/null"),
            destination: None,
            access: None,
        };
        let device = resolve_site_device(&site, &HostWhitelist::allow_all())?;
        assert_eq!(device.destination, PathBuf::from("/dev/null"));
        assert_eq!(device.access, DeviceAccess::all());
        Ok(())
    }

    #[test]
    fn test_site_device_access_wins() -> Result<()> {
        let whitelist = HostWhitelist::allow_all();
        let site = resolve_site_device(
            &SiteDevice {
                source: PathBuf::from("/dev/null"),
                destination: None,
                access: Some("r".to_string()),
            },
            &whitelist,
        )?;
        let same_destination = resolve_cli_device("/dev/zero:/dev/null:rwm", &whitelist)?;
        let same_source = resolve_cli_device("/dev/null:/dev/other-null:rw", &whitelist)?;
        let additional = resolve_cli_device("/dev/zero:rw", &whitelist)?;

        let merged = merge_devices(
            vec![site.clone()],
            vec![same_destination, same_source, additional.clone()],
        );
        assert_eq!(merged, vec![site, additional]);
        assert_eq!(merged[0].access, access("r"));
        Ok(())
    }
}
