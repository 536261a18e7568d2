use libcgtree::{plan_mounts, HierarchyRegistry};
use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use super::{
    args::{ContainerArgs, SpawnRequest},
    channel, fork,
    outer_child::container_outer_process,
    signals::SignalMask,
};
use crate::{
    barrier::{barrier_endpoints, Barrier},
    cgroup::{CgroupSync, DEFAULT_TMP_BASE},
    error::{LaunchError, Result},
    user_ns::{UidShift, UidShiftLock, UidShiftPicker, UserNamespaceIDMapper, UserNamespaceMode},
};

/// How a container run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Terminated(i32),
    /// The payload asked for a fresh container.
    Rebooted,
}

/// Kills and reaps a child unless disarmed, so a failed launch never leaves
/// a half configured container behind.
pub struct ContainerGuard {
    pid: Pid,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(pid: Pid) -> Self {
        Self { pid, armed: true }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The child was reaped by the caller.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(pid = %self.pid, "killing child after failed launch");
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => tracing::warn!(?err, pid = %self.pid, "failed to kill child"),
        }
        if let Err(err) = waitpid(self.pid, None) {
            tracing::debug!(?err, pid = %self.pid, "failed to reap child");
        }
    }
}

/// Maps the payload's wait status to an outcome. `None` for statuses that
/// do not end the process.
pub fn exit_outcome(status: WaitStatus) -> Option<ExitOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitOutcome::Terminated(code)),
        WaitStatus::Signaled(_, Signal::SIGINT, _) => Some(ExitOutcome::Terminated(0)),
        WaitStatus::Signaled(_, Signal::SIGHUP, _) => Some(ExitOutcome::Rebooted),
        WaitStatus::Signaled(_, sig, _) => Some(ExitOutcome::Terminated(128 + sig as i32)),
        _ => None,
    }
}

/// Reaps `pid`, which must have been forked while `mask` was in place.
/// The first SIGINT or SIGTERM sends `kill_signal` to the container, any
/// further one sends SIGKILL.
fn wait_for_exit(pid: Pid, mask: &SignalMask, kill_signal: Signal) -> Result<ExitOutcome> {
    let mut halting = false;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                tracing::debug!(?status, "container process changed state");
                if let Some(outcome) = exit_outcome(status) {
                    return Ok(outcome);
                }
                continue;
            }
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }

        match mask.wait()? {
            Signal::SIGCHLD => {}
            received => {
                let forwarded = if halting { Signal::SIGKILL } else { kill_signal };
                tracing::info!(%received, %forwarded, "halting container, signal again to kill it");
                match signal::kill(pid, forwarded) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => return Err(err.into()),
                }
                halting = true;
            }
        }
    }
}

fn set_child_subreaper() -> Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER only reads its integer argument.
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    Errno::result(ret)?;
    Ok(())
}

/// Runs one container described by `request` until its payload ends.
pub fn launch(request: &SpawnRequest) -> Result<ExitOutcome> {
    let mut registry = HierarchyRegistry::new(libcgtree::host::create_host());
    launch_with_registry(request, &mut registry)
}

pub fn launch_with_registry(
    request: &SpawnRequest,
    registry: &mut HierarchyRegistry,
) -> Result<ExitOutcome> {
    request.validate()?;

    let outer_version = registry.detect_version()?;
    let inner_version = request.cgroup_version.resolve(outer_version);
    let use_cgns = request.use_cgns && registry.cgroup_ns_supported();
    let plan = plan_mounts(registry, outer_version, request.cgroup_version, use_cgns)?;
    tracing::debug!(%outer_version, %inner_version, use_cgns, "resolved cgroup layout");

    let args = ContainerArgs {
        request,
        outer_version,
        inner_version,
        use_cgns,
        plan,
    };

    // Dropped last, after the guards have reaped their children.
    let signals = SignalMask::block()?;
    set_child_subreaper()?;

    // Every channel is uni-directional and shared with the children through
    // fork, so each process closes the ends it does not use.
    let (parent_sender, parent_receiver) = &mut channel::parent_channel()?;
    let (outer_sender, outer_receiver) = &mut channel::outer_channel()?;
    let (mut parent_end, child_end) = barrier_endpoints()?;
    let mut child_end = Some(child_end);

    let outer_pid = fork::container_fork("cgspawn:[1:OUTER]", || {
        for (what, res) in [
            ("parent receiver", parent_receiver.close()),
            ("outer sender", outer_sender.close()),
            ("parent barrier end", parent_end.close().map_err(LaunchError::from)),
        ] {
            if let Err(err) = res {
                tracing::debug!(?err, "failed to close {what} in outer child");
            }
        }

        let res = container_outer_process(
            &args,
            &mut *registry,
            parent_sender,
            outer_receiver,
            &mut child_end,
        );
        if let Err(err) = &res {
            let _ = parent_sender.outer_failed(err.to_string());
        }
        res.map(|_| 0)
    })?;
    let mut outer_guard = ContainerGuard::new(outer_pid);

    parent_sender.close()?;
    outer_receiver.close()?;
    if let Some(mut endpoint) = child_end.take() {
        endpoint.close()?;
    }

    let (uid_shift, _lock) = resolve_uid_shift(request.userns, parent_receiver, outer_sender)?;
    outer_sender.close()?;

    let inner_pid = parent_receiver.wait_for_inner_ready()?;
    let mut inner_guard = ContainerGuard::new(inner_pid);
    tracing::debug!(%inner_pid, "inner child started");

    // the outer child is done once it handed over the inner pid
    match waitpid(outer_pid, None)? {
        WaitStatus::Exited(_, 0) => outer_guard.disarm(),
        status => {
            outer_guard.disarm();
            return Err(LaunchError::ChildFailed(format!(
                "outer child ended with {status:?}"
            )));
        }
    }

    let mut barrier = Barrier::new(Box::new(parent_end));

    if let Some(shift) = &uid_shift {
        barrier.place_and_sync()?;
        UserNamespaceIDMapper::new().write_mappings(inner_pid, shift)?;
        barrier.place()?;
    }

    let cgroup_sync = CgroupSync::with_syscall(request.syscall.create_syscall(), DEFAULT_TMP_BASE);
    cgroup_sync.sync_and_split(registry, inner_pid, outer_version, inner_version, uid_shift)?;

    // the inner child may now join its cgroup namespace
    barrier.place()?;
    barrier.place_and_sync()?;

    let outcome = wait_for_exit(inner_pid, &signals, request.kill_signal)?;
    inner_guard.disarm();
    tracing::info!(?outcome, "container exited");
    Ok(outcome)
}

/// Receives the shift from the outer child. In pick mode the parent takes
/// the candidate, locks a free range and sends it back; the lock lives as
/// long as the returned guard.
fn resolve_uid_shift(
    mode: UserNamespaceMode,
    parent_receiver: &mut channel::ParentReceiver,
    outer_sender: &mut channel::OuterSender,
) -> Result<(Option<UidShift>, Option<UidShiftLock>)> {
    let shift = parent_receiver.wait_for_uid_shift()?;
    if mode != UserNamespaceMode::Pick {
        return Ok((shift, None));
    }

    let candidate = shift.map(|s| s.shift).unwrap_or_default();
    let (picked, lock) = UidShiftPicker::new().pick(candidate)?;
    tracing::info!(shift = picked.shift, range = picked.range, "picked uid range");
    outer_sender.uid_shift_picked(picked)?;
    Ok((Some(picked), Some(lock)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::signals::unblock_supervisor_signals,
        test_utils::{spawn_child, wait_child},
    };
    use anyhow::Result;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_exit_outcome() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            exit_outcome(WaitStatus::Exited(pid, 3)),
            Some(ExitOutcome::Terminated(3))
        );
        assert_eq!(
            exit_outcome(WaitStatus::Signaled(pid, Signal::SIGINT, false)),
            Some(ExitOutcome::Terminated(0))
        );
        assert_eq!(
            exit_outcome(WaitStatus::Signaled(pid, Signal::SIGHUP, false)),
            Some(ExitOutcome::Rebooted)
        );
        assert_eq!(
            exit_outcome(WaitStatus::Signaled(pid, Signal::SIGKILL, true)),
            Some(ExitOutcome::Terminated(137))
        );
        assert_eq!(
            exit_outcome(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
    }

    #[test]
    #[serial]
    fn test_guard_kills_and_reaps() -> Result<()> {
        let child = spawn_child(|| {
            std::thread::sleep(Duration::from_secs(60));
            0
        })?;
        drop(ContainerGuard::new(child));
        // reaped, so the pid is gone
        assert_eq!(signal::kill(child, None), Err(Errno::ESRCH));
        Ok(())
    }

    /// Runs `payload` under a forked supervisor that holds the signal mask,
    /// so the harness threads keep their own mask. The supervisor exits 0
    /// when `wait_for_exit` yields `expected` and the payload is reaped.
    fn supervise<F>(payload: F, expected: ExitOutcome) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        // blocked before forking so a signal sent right away is not lost
        let mask = SignalMask::block()?;
        let supervisor = spawn_child(|| {
            let child = match spawn_child(payload) {
                Ok(child) => child,
                Err(_) => return 10,
            };
            let code = match wait_for_exit(child, &mask, Signal::SIGTERM) {
                Ok(outcome) if outcome == expected => 0,
                _ => 1,
            };
            if signal::kill(child, None) != Err(Errno::ESRCH) {
                return 2;
            }
            code
        });
        drop(mask);
        supervisor
    }

    #[test]
    #[serial]
    fn test_disarmed_guard_leaves_child() -> Result<()> {
        let mask = SignalMask::block()?;
        let supervisor = spawn_child(|| {
            let mut guard = match spawn_child(|| 5) {
                Ok(child) => ContainerGuard::new(child),
                Err(_) => return 10,
            };
            guard.disarm();
            let child = guard.pid();
            drop(guard);
            match wait_for_exit(child, &mask, Signal::SIGTERM) {
                Ok(ExitOutcome::Terminated(5)) => 0,
                _ => 1,
            }
        })?;
        drop(mask);
        assert_eq!(wait_child(supervisor)?, WaitStatus::Exited(supervisor, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_signal_outcome_of_real_child() -> Result<()> {
        let supervisor = supervise(
            || {
                let _ = signal::raise(Signal::SIGHUP);
                0
            },
            ExitOutcome::Rebooted,
        )?;
        assert_eq!(wait_child(supervisor)?, WaitStatus::Exited(supervisor, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_sigterm_halts_container() -> Result<()> {
        let supervisor = supervise(
            || {
                let _ = unblock_supervisor_signals();
                std::thread::sleep(Duration::from_secs(60));
                0
            },
            ExitOutcome::Terminated(128 + Signal::SIGTERM as i32),
        )?;
        signal::kill(supervisor, Signal::SIGTERM)?;
        assert_eq!(wait_child(supervisor)?, WaitStatus::Exited(supervisor, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_second_shutdown_request_kills() -> Result<()> {
        let supervisor = supervise(
            || {
                // SIGTERM is still blocked here, so ignoring it first drops
                // any forwarded copy that is already pending
                let _ = unsafe { signal::signal(Signal::SIGTERM, signal::SigHandler::SigIgn) };
                let _ = unblock_supervisor_signals();
                std::thread::sleep(Duration::from_secs(60));
                0
            },
            ExitOutcome::Terminated(128 + Signal::SIGKILL as i32),
        )?;
        signal::kill(supervisor, Signal::SIGINT)?;
        signal::kill(supervisor, Signal::SIGTERM)?;
        assert_eq!(wait_child(supervisor)?, WaitStatus::Exited(supervisor, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_pick_negotiation() -> Result<()> {
        let (parent_sender, parent_receiver) = &mut channel::parent_channel()?;
        let (outer_sender, outer_receiver) = &mut channel::outer_channel()?;

        parent_sender.uid_shift(None)?;
        let (shift, lock) =
            resolve_uid_shift(UserNamespaceMode::No, parent_receiver, outer_sender)?;
        assert!(shift.is_none());
        assert!(lock.is_none());

        let fixed = UidShift {
            shift: 0x10000,
            range: 0x10000,
        };
        parent_sender.uid_shift(Some(fixed))?;
        let (shift, _) = resolve_uid_shift(
            UserNamespaceMode::Fixed {
                shift: None,
                range: 0x10000,
            },
            parent_receiver,
            outer_sender,
        )?;
        assert_eq!(shift, Some(fixed));

        // nothing was sent back to the outer child
        outer_sender.close()?;
        assert!(outer_receiver.wait_for_picked_shift().is_err());
        Ok(())
    }
}
