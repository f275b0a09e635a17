//! Runs the low-level OCI runtime in the foreground and cleans up after it.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, kill, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{alarm, getpid, getuid, Pid};

use crate::bundle::Bundle;
use crate::config::Configuration;
use crate::utils;

pub const RUNTIME_STATE_ROOT: &str = "/run/runc";
pub const PID_FILE_NAME: &str = "container.pid";

const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a supervised container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
    Terminated(Signal),
    /// Killed after ignoring a forwarded termination signal
    Killed,
}

impl ContainerState {
    /// Exit code reported to the user, shell style for signals.
    pub fn exit_code(&self) -> i32 {
        match self {
            ContainerState::Created | ContainerState::Running => 0,
            ContainerState::Exited(code) => *code,
            ContainerState::Terminated(signal) => 128 + *signal as i32,
            ContainerState::Killed => 128 + Signal::SIGKILL as i32,
        }
    }
}

/// State directory of the runtime for the calling user.
pub fn runtime_root() -> PathBuf {
    PathBuf::from(RUNTIME_STATE_ROOT).join(getuid().to_string())
}

fn is_termination_signal(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGTERM | Signal::SIGHUP | Signal::SIGINT | Signal::SIGQUIT
    )
}

/// Live processes below `root` in the process tree.
pub fn live_descendants(root: Pid) -> Result<Vec<Pid>> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for process in procfs::process::all_processes()? {
        let stat = match process.and_then(|p| p.stat()) {
            Ok(stat) => stat,
            // gone since the listing
            Err(_) => continue,
        };
        if stat.state == 'Z' {
            continue;
        }
        children.entry(stat.ppid).or_default().push(stat.pid);
    }

    let mut descendants = Vec::new();
    let mut queue = VecDeque::from([root.as_raw()]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                descendants.push(Pid::from_raw(*kid));
                queue.push_back(*kid);
            }
        }
    }
    Ok(descendants)
}

/// Reaps every child that already exited, never blocks.
fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => log::debug!("reaped {:?}", status),
        }
    }
}

fn set_child_subreaper() -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    Errno::result(ret)
        .map(drop)
        .context("failed to become the subreaper of the container processes")
}

/// Starts the runtime on prepared bundles.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runtime: PathBuf,
    runtime_root: PathBuf,
    termination_timeout: Duration,
    /// Cgroup hierarchies to clean up, the mounted ones when unset
    cgroup_roots: Option<Vec<PathBuf>>,
}

impl Supervisor {
    pub fn new(config: &Configuration) -> Self {
        Self {
            runtime: config.runc_path.clone(),
            runtime_root: runtime_root(),
            termination_timeout: Duration::from_secs(config.termination_timeout),
            cgroup_roots: None,
        }
    }

    pub fn runtime_args(&self, bundle: &Bundle) -> Vec<String> {
        vec![
            "--root".to_string(),
            self.runtime_root.display().to_string(),
            "run".to_string(),
            "--bundle".to_string(),
            bundle.dir().display().to_string(),
            "--pid-file".to_string(),
            bundle.dir().join(PID_FILE_NAME).display().to_string(),
            bundle.container_id().to_string(),
        ]
    }

    /// Spawns the runtime with every signal blocked in the calling thread, so
    /// none is lost before [`RunningContainer::wait`] starts waiting for them.
    /// The runtime gets SIGKILL if this process dies.
    pub fn launch(&self, bundle: &Bundle) -> Result<RunningContainer> {
        let pid_file = bundle.dir().join(PID_FILE_NAME);
        if pid_file.exists() {
            fs::remove_file(&pid_file)
                .with_context(|| format!("failed to remove stale pid file {:?}", pid_file))?;
        }
        let cgroup_path = bundle
            .spec()
            .linux()
            .as_ref()
            .and_then(|linux| linux.cgroups_path().clone())
            .unwrap_or_else(|| utils::get_cgroup_path(bundle.container_id()));

        set_child_subreaper()?;
        let old_mask = SigSet::all()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("failed to call pthread_sigmask")?;

        let mut command = Command::new(&self.runtime);
        command.args(self.runtime_args(bundle));
        unsafe {
            command.pre_exec(move || {
                prctl::set_death_signal(Signal::SIGKILL as isize)
                    .map_err(io::Error::from_raw_os_error)?;
                old_mask.thread_set_mask().map_err(io::Error::from)?;
                Ok(())
            });
        }

        log::info!("executing {:?} {:?}", self.runtime, self.runtime_args(bundle));
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = old_mask.thread_set_mask();
                return Err(e)
                    .with_context(|| format!("failed to execute runtime {:?}", self.runtime));
            }
        };

        Ok(RunningContainer {
            container_id: bundle.container_id().to_string(),
            runtime_pid: Pid::from_raw(child.id() as i32),
            reaper: getpid(),
            pid_file,
            cgroup_path,
            cgroup_roots: self.cgroup_roots.clone(),
            termination_timeout: self.termination_timeout,
            old_mask,
            state: ContainerState::Created,
            alarm_armed: false,
            killed: false,
            cleaned_up: false,
        })
    }
}

/// The runtime process and everything started below it. Dropping it kills
/// what is left and removes the cgroups of the container.
#[derive(Debug)]
pub struct RunningContainer {
    container_id: String,
    runtime_pid: Pid,
    reaper: Pid,
    pid_file: PathBuf,
    cgroup_path: PathBuf,
    cgroup_roots: Option<Vec<PathBuf>>,
    termination_timeout: Duration,
    old_mask: SigSet,
    state: ContainerState,
    alarm_armed: bool,
    killed: bool,
    cleaned_up: bool,
}

impl RunningContainer {
    /// Pid of the container process, once the runtime wrote it.
    pub fn init_pid(&self) -> Option<Pid> {
        fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|pid| pid.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
    }

    /// Waits up to `terminationTimeout` for the runtime to write the pid file.
    /// Gives up early if the runtime exits without writing it.
    pub fn wait_for_init_pid(&self) -> Option<Pid> {
        let deadline = Instant::now() + self.termination_timeout;
        loop {
            if let Some(pid) = self.init_pid() {
                return Some(pid);
            }
            if !self.runtime_is_alive() {
                log::warn!("runtime of container {} exited before starting it", self.container_id);
                return None;
            }
            if Instant::now() >= deadline {
                log::warn!("no pid file written for container {}", self.container_id);
                return None;
            }
            thread::sleep(REAP_INTERVAL);
        }
    }

    /// The runtime counts as exited once it is a zombie, it is reaped in [`Self::wait`].
    fn runtime_is_alive(&self) -> bool {
        match procfs::process::Process::new(self.runtime_pid.as_raw()).and_then(|p| p.stat()) {
            Ok(stat) => stat.state != 'Z',
            Err(_) => false,
        }
    }

    fn forward(&mut self, signal: Signal) {
        let target = self.init_pid().unwrap_or(self.runtime_pid);
        log::debug!("forwarding {} to {}", signal, target);
        // nothing to do if the target is already gone
        let _ = kill(target, Some(signal));

        if is_termination_signal(signal) && !self.alarm_armed {
            let secs = self.termination_timeout.as_secs().max(1) as u32;
            alarm::set(secs);
            self.alarm_armed = true;
        }
    }

    fn kill_descendants(&mut self) {
        match live_descendants(self.reaper) {
            Ok(pids) => {
                for pid in pids {
                    log::debug!("killing {}", pid);
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
            Err(e) => log::warn!(
                "failed to list processes of container {}: {:#}",
                self.container_id,
                e
            ),
        }
    }

    /// Waits until the runtime exits, forwarding every signal received in the
    /// meantime. A container still running `terminationTimeout` seconds after a
    /// termination signal is killed.
    pub fn wait(&mut self) -> Result<ContainerState> {
        self.state = ContainerState::Running;
        let signal_set = SigSet::all();
        loop {
            match signal_set.wait().context("failed to call sigwait")? {
                signal::SIGCHLD => loop {
                    match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::Exited(pid, code)) if pid == self.runtime_pid => {
                            self.state = if self.killed {
                                ContainerState::Killed
                            } else {
                                ContainerState::Exited(code)
                            };
                            return Ok(self.state);
                        }
                        Ok(WaitStatus::Signaled(pid, signal, _)) if pid == self.runtime_pid => {
                            self.state = if self.killed {
                                ContainerState::Killed
                            } else {
                                ContainerState::Terminated(signal)
                            };
                            return Ok(self.state);
                        }
                        Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                        Ok(_) => {}
                        Err(e) => return Err(e).context("failed to wait for the runtime"),
                    }
                },
                signal::SIGALRM => {
                    if self.alarm_armed && !self.killed {
                        log::warn!(
                            "container {} still running {}s after termination was requested, killing it",
                            self.container_id,
                            self.termination_timeout.as_secs()
                        );
                        self.killed = true;
                        self.kill_descendants();
                    }
                }
                signal::SIGURG | signal::SIGWINCH => {}
                signal => self.forward(signal),
            }
        }
    }

    /// Kills the processes left behind and removes the cgroup directories.
    /// Errors are logged, every step is attempted.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        log::info!("cleaning up container {}", self.container_id);
        alarm::cancel();

        let deadline = Instant::now() + self.termination_timeout;
        loop {
            reap_children();
            match live_descendants(self.reaper) {
                Ok(pids) if pids.is_empty() => break,
                Ok(pids) => {
                    for pid in pids {
                        let _ = kill(pid, Signal::SIGKILL);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "failed to list processes of container {}: {:#}",
                        self.container_id,
                        e
                    );
                    break;
                }
            }
            if Instant::now() >= deadline {
                log::warn!("processes of container {} survived cleanup", self.container_id);
                break;
            }
            thread::sleep(REAP_INTERVAL);
        }

        let roots = match &self.cgroup_roots {
            Some(roots) => Ok(roots.clone()),
            None => cgroups::common::cgroup_mount_points(),
        };
        match roots {
            Ok(roots) => {
                for dir in cgroups::common::list_cgroup_dirs(&roots, &self.cgroup_path) {
                    if let Err(e) = cgroups::common::remove_cgroup(&dir) {
                        log::warn!("failed to remove cgroup {:?}: {:#}", dir, e);
                    }
                }
            }
            Err(e) => log::warn!(
                "failed to list cgroups of container {}: {:#}",
                self.container_id,
                e
            ),
        }

        if let Err(e) = self.old_mask.thread_set_mask() {
            log::warn!("failed to restore the signal mask: {}", e);
        }
    }
}

impl Drop for RunningContainer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait;
    use nix::unistd::{self, ForkResult};
    use oci_spec::runtime::Spec;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_runtime(dir: &Path, script: &str) -> Result<PathBuf> {
        let path = dir.join("runc");
        utils::write_file(&path, format!("#!/bin/sh\n{}\n", script))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn bundle(dir: &Path) -> Bundle {
        Bundle::new(dir, "sarus-supervisor-test", Spec::default(), false)
    }

    /// Supervisor whose state and cgroup hierarchy live below `dir`.
    fn supervisor(runtime: PathBuf, dir: &Path, timeout: u64) -> Supervisor {
        Supervisor {
            runtime,
            runtime_root: dir.join("state"),
            termination_timeout: Duration::from_secs(timeout),
            cgroup_roots: Some(vec![dir.join("hierarchy")]),
        }
    }

    /// Runs `body` in a forked process and returns its exit code. Signal masks
    /// and reaping must not leak into the test harness.
    fn in_child<F: FnOnce() -> bool>(body: F, parent: impl FnOnce(Pid)) -> Result<i32> {
        match unsafe { unistd::fork()? } {
            ForkResult::Parent { child } => {
                parent(child);
                match wait::waitpid(child, None)? {
                    WaitStatus::Exited(_, code) => Ok(code),
                    other => anyhow::bail!("unexpected status {:?}", other),
                }
            }
            ForkResult::Child => {
                let ok = body();
                std::process::exit(if ok { 0 } else { 1 });
            }
        }
    }

    #[test]
    fn test_runtime_args() {
        let supervisor = Supervisor {
            runtime: PathBuf::from("/usr/bin/runc"),
            runtime_root: PathBuf::from("/run/runc/1000"),
            termination_timeout: Duration::from_secs(5),
            cgroup_roots: None,
        };
        let args = supervisor.runtime_args(&bundle(Path::new("/var/sarus/OCIBundleDir")));
        assert_eq!(
            args,
            vec![
                "--root",
                "/run/runc/1000",
                "run",
                "--bundle",
                "/var/sarus/OCIBundleDir",
                "--pid-file",
                "/var/sarus/OCIBundleDir/container.pid",
                "sarus-supervisor-test"
            ]
        );
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(ContainerState::Exited(3).exit_code(), 3);
        assert_eq!(ContainerState::Terminated(Signal::SIGTERM).exit_code(), 143);
        assert_eq!(ContainerState::Killed.exit_code(), 137);
    }

    #[test]
    fn test_runtime_exit() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let runtime = fake_runtime(tmp.path(), "exit 3")?;
        let bundle = bundle(tmp.path());
        let code = in_child(
            || {
                let supervisor = supervisor(runtime, tmp.path(), 1);
                let mut container = match supervisor.launch(&bundle) {
                    Ok(container) => container,
                    Err(_) => return false,
                };
                matches!(container.wait(), Ok(ContainerState::Exited(3)))
            },
            |_| {},
        )?;
        assert_eq!(code, 0);
        Ok(())
    }

    #[test]
    fn test_sigterm_is_forwarded() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let runtime = fake_runtime(
            tmp.path(),
            "echo $$ > \"$7\"\ntrap 'exit 42' TERM\nwhile true; do sleep 0.1; done",
        )?;
        let bundle = bundle(tmp.path());
        let code = in_child(
            || {
                let supervisor = supervisor(runtime, tmp.path(), 5);
                let mut container = match supervisor.launch(&bundle) {
                    Ok(container) => container,
                    Err(_) => return false,
                };
                let state = container.wait();
                container.cleanup();
                matches!(state, Ok(ContainerState::Exited(42)))
                    && live_descendants(getpid()).map_or(false, |pids| pids.is_empty())
            },
            |child| {
                thread::sleep(Duration::from_secs(1));
                let _ = kill(child, Signal::SIGTERM);
            },
        )?;
        assert_eq!(code, 0);
        Ok(())
    }

    #[test]
    fn test_ignored_sigterm_escalates_to_kill() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let runtime = fake_runtime(
            tmp.path(),
            "echo $$ > \"$7\"\ntrap '' TERM\nwhile true; do sleep 0.1; done",
        )?;
        let bundle = bundle(tmp.path());
        let cgroup = tmp.path().join("hierarchy").join("sarus-supervisor-test");
        fs::create_dir_all(&cgroup)?;
        let started = Instant::now();
        let code = in_child(
            || {
                let supervisor = supervisor(runtime, tmp.path(), 1);
                let mut container = match supervisor.launch(&bundle) {
                    Ok(container) => container,
                    Err(_) => return false,
                };
                let state = container.wait();
                drop(container);
                matches!(state, Ok(ContainerState::Killed))
                    && live_descendants(getpid()).map_or(false, |pids| pids.is_empty())
            },
            |child| {
                thread::sleep(Duration::from_secs(1));
                let _ = kill(child, Signal::SIGTERM);
            },
        )?;
        assert_eq!(code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!cgroup.exists());
        assert!(tmp.path().join("hierarchy").exists());
        Ok(())
    }

    #[test]
    fn test_wait_for_init_pid() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let runtime = fake_runtime(tmp.path(), "sleep 0.3\necho $$ > \"$7\"\nsleep 1")?;
        let bundle = bundle(tmp.path());
        let code = in_child(
            || {
                let supervisor = supervisor(runtime, tmp.path(), 5);
                let mut container = match supervisor.launch(&bundle) {
                    Ok(container) => container,
                    Err(_) => return false,
                };
                let pid = container.wait_for_init_pid();
                pid == Some(container.runtime_pid)
                    && matches!(container.wait(), Ok(ContainerState::Exited(0)))
            },
            |_| {},
        )?;
        assert_eq!(code, 0);
        Ok(())
    }

    #[test]
    fn test_no_init_pid_when_runtime_fails() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let runtime = fake_runtime(tmp.path(), "exit 1")?;
        let bundle = bundle(tmp.path());
        let started = Instant::now();
        let code = in_child(
            || {
                let supervisor = supervisor(runtime, tmp.path(), 30);
                let mut container = match supervisor.launch(&bundle) {
                    Ok(container) => container,
                    Err(_) => return false,
                };
                container.wait_for_init_pid().is_none()
                    && matches!(container.wait(), Ok(ContainerState::Exited(1)))
            },
            |_| {},
        )?;
        assert_eq!(code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }
}
