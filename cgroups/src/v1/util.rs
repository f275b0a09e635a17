use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use procfs::process::Process;

/// Finds the mount point of the v1 hierarchy carrying `subsystem` together with the
/// cgroup root of that mount (non-"/" when running inside a cgroup namespace).
pub fn get_subsystem_mount_point(subsystem: &str) -> Result<(PathBuf, PathBuf)> {
    Process::myself()?
        .mountinfo()?
        .into_iter()
        .find(|m| {
            m.fs_type == "cgroup"
                && (m.super_options.contains_key(subsystem) || m.mount_point.ends_with(subsystem))
        })
        .map(|m| (m.mount_point, m.root.into()))
        .ok_or_else(|| anyhow!("could not find mountpoint for {}", subsystem))
}

/// Returns the cgroup of the calling process in the hierarchy carrying `subsystem`.
pub fn get_own_cgroup_path(subsystem: &str) -> Result<PathBuf> {
    Process::myself()?
        .cgroups()?
        .into_iter()
        .find(|c| c.controllers.iter().any(|controller| controller == subsystem))
        .map(|c| PathBuf::from(c.pathname))
        .ok_or_else(|| anyhow!("process is not part of a {} cgroup", subsystem))
}

/// Joins a cgroup path as seen in /proc/self/cgroup to the mount point of its hierarchy.
pub fn join_cgroup_path(mount_point: &Path, mount_root: &Path, cgroup_path: &Path) -> PathBuf {
    let relative = cgroup_path
        .strip_prefix(mount_root)
        .or_else(|_| cgroup_path.strip_prefix("/"))
        .unwrap_or(cgroup_path);
    mount_point.join(relative)
}
