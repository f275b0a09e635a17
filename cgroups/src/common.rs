use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use procfs::process::Process;

pub const CGROUP_PROCS: &str = "cgroup.procs";

const REMOVE_ATTEMPTS: u32 = 5;

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("failed to open {:?}", path))
}

/// Mount points of the cgroup hierarchies of this process.
pub fn cgroup_mount_points() -> Result<Vec<PathBuf>> {
    let mut roots: Vec<PathBuf> = Process::myself()?
        .mountinfo()?
        .into_iter()
        .filter(|m| m.fs_type == "cgroup" || m.fs_type == "cgroup2")
        .map(|m| m.mount_point)
        .collect();
    roots.sort();
    roots.dedup();
    Ok(roots)
}

/// Returns the directory of `cgroup_path` inside every hierarchy in `roots`.
/// The directories are not required to exist.
pub fn list_cgroup_dirs(roots: &[PathBuf], cgroup_path: &Path) -> Vec<PathBuf> {
    let relative = cgroup_path.strip_prefix("/").unwrap_or(cgroup_path);
    roots.iter().map(|root| root.join(relative)).collect()
}

/// Reads the processes attached to a cgroup directory.
pub fn get_all_pids(cgroup_dir: &Path) -> Result<Vec<Pid>> {
    let procs = read_cgroup_file(cgroup_dir.join(CGROUP_PROCS))?;
    procs
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<i32>()
                .map(Pid::from_raw)
                .with_context(|| format!("invalid pid {:?} in {:?}", line, cgroup_dir))
        })
        .collect()
}

/// Kills every process left in the cgroup and removes its directory.
/// Removal is retried because the kernel refuses to remove a cgroup
/// until its last task has been reaped.
pub fn remove_cgroup(cgroup_dir: &Path) -> Result<()> {
    let mut delay = Duration::from_millis(10);

    for attempt in 0..REMOVE_ATTEMPTS {
        if !cgroup_dir.exists() {
            return Ok(());
        }

        if let Ok(pids) = get_all_pids(cgroup_dir) {
            for pid in pids {
                log::debug!("kill {} left in cgroup {:?}", pid, cgroup_dir);
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
        }

        match fs::remove_dir(cgroup_dir) {
            Ok(()) => {
                log::debug!("removed cgroup {:?}", cgroup_dir);
                return Ok(());
            }
            Err(e) => log::debug!(
                "attempt {} to remove cgroup {:?} failed: {}",
                attempt + 1,
                cgroup_dir,
                e
            ),
        }

        thread::sleep(delay);
        delay *= 2;
    }

    bail!("could not delete cgroup {:?}", cgroup_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_get_all_pids() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CGROUP_PROCS, "1\n42\n\n")?;
        let pids = get_all_pids(tmp.path())?;
        assert_eq!(pids, vec![Pid::from_raw(1), Pid::from_raw(42)]);
        Ok(())
    }

    #[test]
    fn test_get_all_pids_rejects_garbage() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CGROUP_PROCS, "abc\n")?;
        assert!(get_all_pids(tmp.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_cgroup_removes_empty_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cgroup = tmp.path().join("container-abc");
        fs::create_dir(&cgroup)?;
        remove_cgroup(&cgroup)?;
        assert!(!cgroup.exists());
        Ok(())
    }

    #[test]
    fn test_remove_missing_cgroup_is_noop() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        remove_cgroup(&tmp.path().join("missing"))
    }

    #[test]
    fn test_list_cgroup_dirs_are_under_mount_points() -> Result<()> {
        let roots = cgroup_mount_points()?;
        let dirs = list_cgroup_dirs(&roots, Path::new("/container-xyz"));
        assert_eq!(dirs.len(), roots.len());
        assert!(dirs.iter().all(|d| d.ends_with("container-xyz")));
        Ok(())
    }

    #[test]
    fn test_list_cgroup_dirs() {
        let roots = vec![
            PathBuf::from("/sys/fs/cgroup/devices"),
            PathBuf::from("/sys/fs/cgroup/memory"),
        ];
        assert_eq!(
            list_cgroup_dirs(&roots, Path::new("/sarus/container-xyz")),
            vec![
                PathBuf::from("/sys/fs/cgroup/devices/sarus/container-xyz"),
                PathBuf::from("/sys/fs/cgroup/memory/sarus/container-xyz"),
            ]
        );
    }
}
