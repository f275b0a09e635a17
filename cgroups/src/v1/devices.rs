use std::{fmt::Display, path::Path, str::FromStr};

use anyhow::{bail, Context, Result};

use super::util;
use crate::common;

const DEVICES_LIST: &str = "devices.list";
const ACCESS_ORDER: [char; 3] = ['r', 'w', 'm'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    All,
    Char,
    Block,
}

impl DeviceType {
    pub fn as_char(&self) -> char {
        match self {
            DeviceType::All => 'a',
            DeviceType::Char => 'c',
            DeviceType::Block => 'b',
        }
    }

    fn covers(&self, other: DeviceType) -> bool {
        *self == DeviceType::All || *self == other
    }
}

/// One entry of a devices cgroup whitelist, e.g. `c 10:229 rw`.
/// `None` major/minor numbers stand for the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    pub typ: DeviceType,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub access: String,
}

impl DeviceRule {
    pub fn matches(&self, typ: DeviceType, major: u64, minor: u64) -> bool {
        self.typ.covers(typ)
            && self.major.map_or(true, |m| m == major)
            && self.minor.map_or(true, |m| m == minor)
    }
}

impl Display for DeviceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let major = self
            .major
            .map(|mj| mj.to_string())
            .unwrap_or_else(|| "*".to_string());
        let minor = self
            .minor
            .map(|mi| mi.to_string())
            .unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{} {}:{} {}",
            self.typ.as_char(),
            major,
            minor,
            self.access
        )
    }
}

fn parse_number(s: &str) -> Result<Option<u64>> {
    if s == "*" {
        return Ok(None);
    }
    Ok(Some(
        s.parse::<u64>()
            .with_context(|| format!("invalid device number {:?}", s))?,
    ))
}

impl FromStr for DeviceRule {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            bail!("malformed device cgroup entry {:?}", line);
        }

        let typ = match fields[0] {
            "a" => DeviceType::All,
            "c" => DeviceType::Char,
            "b" => DeviceType::Block,
            other => bail!("unknown device type {:?} in {:?}", other, line),
        };

        let (major, minor) = fields[1]
            .split_once(':')
            .with_context(|| format!("malformed device numbers in {:?}", line))?;

        if fields[2].chars().any(|c| !ACCESS_ORDER.contains(&c)) {
            bail!("malformed device access in {:?}", line);
        }

        Ok(DeviceRule {
            typ,
            major: parse_number(major)?,
            minor: parse_number(minor)?,
            access: normalize_access(fields[2].chars()),
        })
    }
}

fn normalize_access(chars: impl Iterator<Item = char>) -> String {
    let chars: Vec<char> = chars.collect();
    ACCESS_ORDER
        .iter()
        .filter(|c| chars.contains(*c))
        .collect()
}

/// Access bits present in both strings, in canonical `rwm` order.
fn intersect_access(requested: &str, allowed: &str) -> String {
    normalize_access(requested.chars().filter(|c| allowed.contains(*c)))
}

/// The device whitelist a process is confined by. A container must never be granted
/// more than this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWhitelist {
    rules: Vec<DeviceRule>,
}

impl HostWhitelist {
    pub fn allow_all() -> Self {
        Self {
            rules: vec![DeviceRule {
                typ: DeviceType::All,
                major: None,
                minor: None,
                access: "rwm".to_string(),
            }],
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let rules = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(DeviceRule::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn load(cgroup_dir: &Path) -> Result<Self> {
        let content = common::read_cgroup_file(cgroup_dir.join(DEVICES_LIST))?;
        Self::parse(&content)
    }

    /// Reads the whitelist of the devices cgroup the calling process belongs to.
    /// Without a v1 devices hierarchy there is no whitelist to honour.
    pub fn for_current_process() -> Result<Self> {
        let (mount_point, mount_root) = match util::get_subsystem_mount_point("devices") {
            Ok(mount) => mount,
            Err(_) => {
                log::debug!("no devices cgroup hierarchy found, every device is allowed");
                return Ok(Self::allow_all());
            }
        };
        let own = util::get_own_cgroup_path("devices")?;
        let dir = util::join_cgroup_path(&mount_point, &mount_root, &own);
        log::debug!("reading device whitelist from {:?}", dir);
        Self::load(&dir)
    }

    fn allowed_access(&self, typ: DeviceType, major: u64, minor: u64) -> String {
        let granted: String = self
            .rules
            .iter()
            .filter(|rule| rule.matches(typ, major, minor))
            .map(|rule| rule.access.as_str())
            .collect();
        normalize_access(granted.chars())
    }

    /// Part of `requested` granted to the device, in canonical `rwm` order.
    pub fn effective_access(
        &self,
        typ: DeviceType,
        major: u64,
        minor: u64,
        requested: &str,
    ) -> String {
        intersect_access(requested, &self.allowed_access(typ, major, minor))
    }
}
