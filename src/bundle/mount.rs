//! Bind mounts requested with `--mount` or configured as `siteMounts`.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

use crate::config::{SiteMount, UserMountPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    Private,
    #[default]
    Rprivate,
    Slave,
    Rslave,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Private => "private",
            Propagation::Rprivate => "rprivate",
            Propagation::Slave => "slave",
            Propagation::Rslave => "rslave",
        }
    }
}

impl Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Propagation::Private),
            "rprivate" => Ok(Propagation::Rprivate),
            "slave" => Ok(Propagation::Slave),
            "rslave" => Ok(Propagation::Rslave),
            other => bail!(
                "'{}' is not a valid bind propagation value. Supported values are 'private', 'rprivate', 'slave' and 'rslave'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub readonly: bool,
    pub propagation: Propagation,
}

impl MountEntry {
    /// OCI mount options of the bind mount.
    pub fn options(&self) -> Vec<String> {
        vec![
            "rbind".to_string(),
            self.propagation.to_string(),
            if self.readonly { "ro" } else { "rw" }.to_string(),
        ]
    }

    pub fn from_site(mount: &SiteMount) -> Result<Self> {
        if mount.typ != "bind" {
            bail!(
                "Invalid site mount for {:?}: '{}' is not a valid mount type",
                mount.destination,
                mount.typ
            );
        }
        let flags = mount.flags.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let (readonly, propagation) = parse_flags(flags)
            .map_err(|e| anyhow!("Invalid site mount for {:?}: {}", mount.destination, e))?;
        Ok(Self {
            source: mount.source.clone(),
            destination: clean(&mount.destination),
            readonly,
            propagation,
        })
    }
}

fn clean(path: &Path) -> PathBuf {
    PathBuf::from(path_clean::clean(&path.to_string_lossy()))
}

/// Splits `key=value,key,...` into a map. Keys without `=` get an empty value.
fn parse_request_map(request: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for option in request.split(',') {
        let (key, value) = match option.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (option.trim(), ""),
        };
        if key.is_empty() {
            bail!("found empty option");
        }
        if map.insert(key.to_string(), value.to_string()).is_some() {
            bail!("option '{}' specified more than once", key);
        }
    }
    Ok(map)
}

fn parse_flags<'a>(
    options: impl Iterator<Item = (&'a str, &'a str)>,
) -> Result<(bool, Propagation)> {
    let mut readonly = false;
    let mut propagation = Propagation::default();
    for (key, value) in options {
        match key {
            "readonly" => readonly = true,
            "bind-propagation" => propagation = value.parse()?,
            other => bail!("'{}' is not a valid bind mount option", other),
        }
    }
    Ok((readonly, propagation))
}

fn take_one(
    map: &mut BTreeMap<String, String>,
    keys: &[&str],
    what: &str,
) -> Result<PathBuf> {
    let present: Vec<&&str> = keys.iter().filter(|k| map.contains_key(**k)).collect();
    let alternatives = keys
        .iter()
        .map(|k| format!("'{}'", k))
        .collect::<Vec<_>>()
        .join(", ");
    match present[..] {
        [] => bail!("no {} specified. Use one of {}.", what, alternatives),
        [key] => {
            let value = map.remove(*key).unwrap_or_default();
            if value.is_empty() {
                bail!("{} is empty", what);
            }
            let path = PathBuf::from(value);
            if path.is_relative() {
                bail!("{} must be an absolute path", what);
            }
            Ok(path)
        }
        _ => bail!(
            "multiple formats used to specify mount {}. Use one of {}.",
            what,
            alternatives
        ),
    }
}

fn check_destination(destination: &Path, policy: &UserMountPolicy) -> Result<()> {
    for prefix in &policy.not_allowed_prefixes_of_path {
        if destination.starts_with(prefix) {
            bail!(
                "destination cannot be a subdirectory of '{}'",
                prefix.display()
            );
        }
    }
    for path in &policy.not_allowed_paths {
        if destination == path {
            bail!("'{}' is not allowed as mount destination", path.display());
        }
    }
    Ok(())
}

/// Parses a `--mount` option value, e.g.
/// `type=bind,source=/scratch,destination=/scratch,readonly,bind-propagation=slave`.
pub fn parse_mount_request(request: &str, policy: &UserMountPolicy) -> Result<MountEntry> {
    log::debug!("parsing mount request '{}'", request);
    let parse = || -> Result<MountEntry> {
        let mut map = parse_request_map(request)?;
        match map.remove("type").as_deref() {
            None => bail!("'type' must be specified"),
            Some("bind") => {}
            Some(other) => bail!("'{}' is not a valid mount type", other),
        }
        let source = take_one(&mut map, &["source", "src"], "source")?;
        let destination = clean(&take_one(
            &mut map,
            &["destination", "dst", "target"],
            "destination",
        )?);
        check_destination(&destination, policy)?;
        let (readonly, propagation) =
            parse_flags(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(MountEntry {
            source,
            destination,
            readonly,
            propagation,
        })
    };
    parse().map_err(|e| anyhow!("Invalid mount request '{}': {}", request, e))
}

/// Site mounts come first, a CLI mount to the same destination is dropped.
pub fn merge_mounts(site: Vec<MountEntry>, cli: Vec<MountEntry>) -> Vec<MountEntry> {
    let mut merged = site;
    let site_count = merged.len();
    for mount in cli {
        if merged[..site_count]
            .iter()
            .any(|s| s.destination == mount.destination)
        {
            log::warn!(
                "ignoring mount request for {:?}: the destination is already mounted by the site configuration",
                mount.destination
            );
            continue;
        }
        merged.push(mount);
    }
    merged
}
