//! The OCI bundle on disk: `config.json` next to the container rootfs.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use oci_spec::runtime::{
    LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType, Mount, MountBuilder, Spec,
};

use super::device::DeviceEntry;
use super::mount::MountEntry;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub const MASKED_PATHS: [&str; 7] = [
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

pub const READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn mount(destination: &str, typ: &str, source: &str, options: &[&str]) -> Result<Mount> {
    let mut builder = MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source);
    if !options.is_empty() {
        builder = builder.options(strings(options));
    }
    builder
        .build()
        .with_context(|| format!("failed to build mount for {}", destination))
}

/// Filesystems every container gets. `/dev` itself is prepared with the rootfs.
pub fn default_mounts() -> Result<Vec<Mount>> {
    Ok(vec![
        mount("/proc", "proc", "proc", &[])?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        )?,
        // shared with the host so that processes of a job can communicate
        mount(
            "/dev/shm",
            "bind",
            "/dev/shm",
            &["nosuid", "noexec", "nodev", "rbind", "slave", "rw"],
        )?,
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
    ])
}

pub fn bind_mount(entry: &MountEntry) -> Result<Mount> {
    MountBuilder::default()
        .destination(entry.destination.clone())
        .typ("bind")
        .source(entry.source.clone())
        .options(entry.options())
        .build()
        .with_context(|| format!("failed to build bind mount for {:?}", entry.destination))
}

pub fn device_mount(entry: &DeviceEntry) -> Result<Mount> {
    let access = if entry.access.to_string().contains('w') {
        "rw"
    } else {
        "ro"
    };
    MountBuilder::default()
        .destination(entry.destination.clone())
        .typ("bind")
        .source(entry.source.clone())
        .options(strings(&["bind", "nosuid", "noexec", "private", access]))
        .build()
        .with_context(|| format!("failed to build device mount for {:?}", entry.destination))
}

/// Rule denying every device, the allowed ones are listed after it.
pub fn deny_all_devices() -> Result<LinuxDeviceCgroup> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(false)
        .access("rwm")
        .build()?)
}

pub fn device_rule(entry: &DeviceEntry) -> Result<LinuxDeviceCgroup> {
    let typ = match entry.typ {
        cgroups::v1::DeviceType::Block => LinuxDeviceType::B,
        cgroups::v1::DeviceType::Char => LinuxDeviceType::C,
        cgroups::v1::DeviceType::All => LinuxDeviceType::A,
    };
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(entry.major as i64)
        .minor(entry.minor as i64)
        .access(entry.access.to_string())
        .build()?)
}

fn device_type_char(typ: Option<LinuxDeviceType>) -> char {
    match typ {
        Some(LinuxDeviceType::B) => 'b',
        Some(LinuxDeviceType::C) => 'c',
        Some(LinuxDeviceType::P) => 'p',
        _ => 'a',
    }
}

fn number(n: Option<i64>) -> String {
    n.map_or_else(|| "*".to_string(), |n| n.to_string())
}

/// Mounts and device rules of a bundle, in the form used to verify that
/// orchestration only ever adds to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleEntries {
    /// `source -> destination` of every mount
    pub mounts: Vec<String>,
    /// `allow|deny <type> <major>:<minor> <access>` of every devices cgroup rule
    pub devices: Vec<String>,
}

impl BundleEntries {
    pub fn of(spec: &Spec) -> Self {
        let mounts = spec
            .mounts()
            .iter()
            .flatten()
            .map(|m| {
                let source = m
                    .source()
                    .as_ref()
                    .map(|s| s.display().to_string())
                    .unwrap_or_default();
                format!("{} -> {}", source, m.destination().display())
            })
            .collect();

        let devices = spec
            .linux()
            .as_ref()
            .and_then(|l| l.resources().as_ref())
            .and_then(|r| r.devices().as_ref())
            .into_iter()
            .flatten()
            .map(|d| {
                format!(
                    "{} {} {}:{} {}",
                    if d.allow() { "allow" } else { "deny" },
                    device_type_char(d.typ()),
                    number(d.major()),
                    number(d.minor()),
                    d.access().as_deref().unwrap_or("rwm")
                )
            })
            .collect();

        Self { mounts, devices }
    }

    /// Entries of `self` that `after` no longer contains.
    pub fn removed_in(&self, after: &BundleEntries) -> Vec<String> {
        let mut removed: Vec<String> = self
            .mounts
            .iter()
            .filter(|m| !after.mounts.contains(m))
            .map(|m| format!("mount {}", m))
            .collect();
        removed.extend(
            self.devices
                .iter()
                .filter(|d| !after.devices.contains(d))
                .map(|d| format!("device rule {}", d)),
        );
        removed
    }
}

/// An OCI bundle directory and the configuration of the container in it.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
    container_id: String,
    spec: Spec,
    has_bind_mounts: bool,
}

impl Bundle {
    pub fn new<P: Into<PathBuf>>(
        dir: P,
        container_id: &str,
        spec: Spec,
        has_bind_mounts: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            container_id: container_id.to_string(),
            spec,
            has_bind_mounts,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn has_bind_mounts(&self) -> bool {
        self.has_bind_mounts
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.spec
            .annotations()
            .as_ref()
            .map(|a: &HashMap<String, String>| {
                a.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            })
            .unwrap_or_default()
    }

    /// First argument of the container process.
    pub fn argv0(&self) -> Option<&str> {
        self.spec
            .process()
            .as_ref()
            .and_then(|p| p.args().as_ref())
            .and_then(|args| args.first())
            .map(String::as_str)
    }

    pub fn entries(&self) -> BundleEntries {
        BundleEntries::of(&self.spec)
    }

    /// Writes `config.json`, readable by the owner only.
    pub fn write(&self) -> Result<()> {
        let path = self.config_path();
        log::info!("writing OCI bundle configuration {:?}", path);
        self.spec
            .save(&path)
            .with_context(|| format!("failed to write {:?}", path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions of {:?}", path))?;
        Ok(())
    }

    /// Re-reads `config.json`, which hooks may have modified.
    pub fn reload(&mut self) -> Result<()> {
        let path = self.config_path();
        self.spec = Spec::load(&path).with_context(|| format!("failed to load {:?}", path))?;
        log::debug!("reloaded OCI bundle configuration {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::device::DeviceAccess;
    use cgroups::v1::DeviceType;
    use oci_spec::runtime::{LinuxBuilder, LinuxResourcesBuilder, SpecBuilder};

    fn null_device() -> DeviceEntry {
        DeviceEntry {
            source: PathBuf::from("/dev/null"),
            destination: PathBuf::from("/dev/null"),
            typ: DeviceType::Char,
            major: 1,
            minor: 3,
            access: DeviceAccess::parse("rw").unwrap(),
        }
    }

    fn spec_with(mounts: Vec<Mount>, devices: Vec<LinuxDeviceCgroup>) -> Result<Spec> {
        let resources = LinuxResourcesBuilder::default().devices(devices).build()?;
        let linux = LinuxBuilder::default().resources(resources).build()?;
        Ok(SpecBuilder::default().mounts(mounts).linux(linux).build()?)
    }

    #[test]
    fn test_entries() -> Result<()> {
        let spec = spec_with(
            default_mounts()?,
            vec![deny_all_devices()?, device_rule(&null_device())?],
        )?;
        let entries = BundleEntries::of(&spec);
        assert_eq!(entries.mounts[0], "proc -> /proc");
        assert_eq!(entries.mounts[2], "/dev/shm -> /dev/shm");
        assert_eq!(
            entries.devices,
            vec!["deny a *:* rwm".to_string(), "allow c 1:3 rw".to_string()]
        );
        Ok(())
    }

    #[test]
    fn test_removed_entries() -> Result<()> {
        let before = BundleEntries::of(&spec_with(
            default_mounts()?,
            vec![device_rule(&null_device())?],
        )?);
        let mut mounts = default_mounts()?;
        mounts.remove(1);
        let after = BundleEntries::of(&spec_with(mounts, vec![])?);
        assert_eq!(
            before.removed_in(&after),
            vec![
                "mount devpts -> /dev/pts".to_string(),
                "device rule allow c 1:3 rw".to_string()
            ]
        );
        assert!(after.removed_in(&before).is_empty());
        Ok(())
    }

    #[test]
    fn test_write_and_reload() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = spec_with(default_mounts()?, vec![])?;
        let mut bundle = Bundle::new(tmp.path(), "sarus-container-test", spec, false);
        bundle.write()?;

        let mode = fs::metadata(bundle.config_path())?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let mut json: serde_json::Value =
            serde_json::from_reader(fs::File::open(bundle.config_path())?)?;
        json["mounts"].as_array_mut().unwrap().push(serde_json::json!({
            "destination": "/opt/mpi",
            "type": "bind",
            "source": "/usr/lib/mpi"
        }));
        fs::write(bundle.config_path(), serde_json::to_string(&json)?)?;

        bundle.reload()?;
        let entries = bundle.entries();
        assert_eq!(entries.mounts.len(), 6);
        assert_eq!(entries.mounts[5], "/usr/lib/mpi -> /opt/mpi");
        Ok(())
    }

    #[test]
    fn test_device_mount_options() -> Result<()> {
        let mut device = null_device();
        let m = device_mount(&device)?;
        assert!(m.options().as_ref().unwrap().contains(&"rw".to_string()));
        device.access = DeviceAccess::parse("r").unwrap();
        let m = device_mount(&device)?;
        assert!(m.options().as_ref().unwrap().contains(&"ro".to_string()));
        Ok(())
    }
}
