//! Signals the supervisor consumes with `sigwait` while the container runs.

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

/// SIGCHLD wakes the wait loop, SIGINT and SIGTERM ask for an orderly
/// shutdown of the container.
pub fn supervisor_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Keeps the supervisor signals blocked for the calling thread and restores
/// the previous mask when dropped. Forked children inherit the block.
pub struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    pub fn block() -> nix::Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&supervisor_signals()),
            Some(&mut previous),
        )?;
        Ok(Self { previous })
    }

    /// Waits for the next supervisor signal.
    pub fn wait(&self) -> nix::Result<Signal> {
        supervisor_signals().wait()
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Err(err) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            tracing::warn!(?err, "failed to restore signal mask");
        }
    }
}

/// The payload must start with the supervisor signals deliverable.
pub fn unblock_supervisor_signals() -> nix::Result<()> {
    supervisor_signals().thread_unblock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{spawn_child, wait_child};
    use anyhow::Result;
    use nix::sys::{signal, wait::WaitStatus};
    use serial_test::serial;

    fn blocked() -> nix::Result<SigSet> {
        SigSet::thread_get_mask()
    }

    #[test]
    #[serial]
    fn test_mask_restored_on_drop() -> Result<()> {
        let child = spawn_child(|| {
            let mask = match SignalMask::block() {
                Ok(mask) => mask,
                Err(_) => return 1,
            };
            match blocked() {
                Ok(set) if set.contains(Signal::SIGTERM) && set.contains(Signal::SIGCHLD) => {}
                _ => return 2,
            }
            drop(mask);
            match blocked() {
                Ok(set) if !set.contains(Signal::SIGTERM) => 0,
                _ => 3,
            }
        })?;
        assert_eq!(wait_child(child)?, WaitStatus::Exited(child, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_wait_returns_pending_signal() -> Result<()> {
        let child = spawn_child(|| {
            let mask = match SignalMask::block() {
                Ok(mask) => mask,
                Err(_) => return 1,
            };
            if signal::raise(Signal::SIGINT).is_err() {
                return 2;
            }
            match mask.wait() {
                Ok(Signal::SIGINT) => 0,
                _ => 3,
            }
        })?;
        assert_eq!(wait_child(child)?, WaitStatus::Exited(child, 0));
        Ok(())
    }
}
