//! Runs the registered hooks of each lifecycle stage against a bundle.

use std::io::{ErrorKind, Write};
use std::os::unix::prelude::CommandExt;
use std::{process, thread, time};

use anyhow::{Context, Result};
use nix::sys::signal;
use nix::unistd::Pid;

use super::condition::{all_match, ConditionContext};
use super::descriptor::{HookDescriptor, Stage};
use super::registry::HookRegistry;
use super::state::{ContainerStatus, State};
use crate::bundle::Bundle;
use crate::utils;

/// Stages run by Sarus before the low-level runtime is started.
pub const PRE_LAUNCH_STAGES: [Stage; 3] =
    [Stage::CreateRuntime, Stage::CreateContainer, Stage::Prestart];

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook {hook} failed with exit code {code}")]
    Failed { hook: String, code: i32 },
    #[error("hook {hook} was killed by signal {signal}")]
    Signaled { hook: String, signal: i32 },
    #[error("hook {hook} timed out after {timeout} seconds")]
    TimedOut { hook: String, timeout: u64 },
    #[error("hook {hook} removed entries from the bundle: {}", entries.join(", "))]
    RemovedEntries { hook: String, entries: Vec<String> },
}

fn kill_and_reap(child: &mut process::Child) {
    let _ = signal::kill(Pid::from_raw(child.id() as i32), signal::Signal::SIGKILL);
    let _ = child.wait();
}

/// Runs a single hook to completion. The container state is written on the
/// standard input of the hook, its output goes straight to ours.
pub fn run_hook(hook: &HookDescriptor, state: &State) -> Result<()> {
    let command = &hook.hook;
    log::debug!("[{}] running {:?}", hook.name, command);
    let envs = utils::parse_env(&command.env);

    // `args` has argv semantics, argv[0] may differ from the executable path
    let (arg0, args) = match command.args.split_first() {
        Some((arg0, args)) => (arg0.clone(), args.to_vec()),
        None => (command.path.display().to_string(), Vec::new()),
    };

    let mut child = process::Command::new(&command.path)
        .args(&args)
        .arg0(&arg0)
        .env_clear()
        .envs(envs)
        .stdin(process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute hook {} ({:?})", hook.name, command.path))?;
    let child_pid = Pid::from_raw(child.id() as i32);

    if let Some(mut stdin) = child.stdin.take() {
        let written = serde_json::to_vec(state)
            .map_err(std::io::Error::from)
            .and_then(|json| stdin.write_all(&json));
        match written {
            Ok(()) => {}
            // the hook is free to ignore its input
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => {
                // the hook may still be waiting for its input
                kill_and_reap(&mut child);
                return Err(e).with_context(|| {
                    format!("failed to pass the container state to hook {}", hook.name)
                });
            }
        }
    }

    let status = match command.timeout {
        Some(timeout) => {
            let (sender, receiver) = crossbeam_channel::unbounded();
            thread::spawn(move || {
                let _ = sender.send(child.wait());
            });
            match receiver.recv_timeout(time::Duration::from_secs(timeout)) {
                Ok(status) => status,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    let _ = signal::kill(child_pid, signal::Signal::SIGKILL);
                    return Err(HookError::TimedOut {
                        hook: hook.name.clone(),
                        timeout,
                    }
                    .into());
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("lost track of hook {}", hook.name)
                }
            }
        }
        None => child.wait(),
    }
    .with_context(|| format!("failed to wait for hook {}", hook.name))?;

    match status.code() {
        Some(0) => {
            log::debug!("[{}] completed", hook.name);
            Ok(())
        }
        Some(code) => Err(HookError::Failed {
            hook: hook.name.clone(),
            code,
        }
        .into()),
        None => {
            use std::os::unix::process::ExitStatusExt;
            Err(HookError::Signaled {
                hook: hook.name.clone(),
                signal: status.signal().unwrap_or_default(),
            }
            .into())
        }
    }
}

/// Fires the hooks of the registry stage by stage. Hooks run one at a time, in
/// registry order, and see the changes earlier hooks made to the bundle.
pub struct HookOrchestrator<'a> {
    registry: &'a HookRegistry,
}

impl<'a> HookOrchestrator<'a> {
    pub fn new(registry: &'a HookRegistry) -> Self {
        Self { registry }
    }

    /// Runs the hooks of `stage` whose conditions hold for the current bundle
    /// and returns how many ran. The bundle must have been written.
    pub fn run_stage(
        &self,
        stage: Stage,
        bundle: &mut Bundle,
        status: ContainerStatus,
        pid: Option<i32>,
    ) -> Result<usize> {
        log::info!("running {} hooks", stage);
        let mut count = 0;
        for hook in self.registry.for_stage(stage) {
            let annotations = bundle.annotations();
            let context = ConditionContext {
                annotations: &annotations,
                argv0: bundle.argv0(),
                has_bind_mounts: bundle.has_bind_mounts(),
            };
            if !all_match(&hook.conditions, &context) {
                log::debug!("[{}] conditions not met, skipping", hook.name);
                continue;
            }

            let before = bundle.entries();
            let state = State::new(
                bundle.container_id(),
                status,
                pid,
                bundle.dir(),
                annotations.clone(),
            );
            run_hook(hook, &state)?;
            count += 1;

            bundle.reload()?;
            let removed = before.removed_in(&bundle.entries());
            if !removed.is_empty() {
                return Err(HookError::RemovedEntries {
                    hook: hook.name.clone(),
                    entries: removed,
                }
                .into());
            }
        }
        log::info!("successfully ran {} {} hooks", count, stage);
        Ok(count)
    }

    /// `createRuntime`, `createContainer` then `prestart`, each stage completing
    /// before the next starts.
    pub fn run_pre_launch(&self, bundle: &mut Bundle) -> Result<()> {
        for stage in PRE_LAUNCH_STAGES {
            self.run_stage(stage, bundle, ContainerStatus::Creating, None)?;
        }
        Ok(())
    }
}
