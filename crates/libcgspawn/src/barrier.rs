//! Rendezvous between two processes.
//!
//! Each side counts the phases it has placed. `sync` returns once the peer
//! has placed at least as many phases as we have, so both sides leave a
//! `place_and_sync` together. A peer that goes away shows up as
//! [`BarrierError::PeerDied`] instead of a hang.

use serde::{Deserialize, Serialize};

use crate::channel::{channel, ChannelError, Receiver, Sender};

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("peer died before reaching barrier phase {phase}")]
    PeerDied { phase: u64 },
    #[error("barrier channel failed")]
    Channel(#[from] ChannelError),
}

type Result<T> = std::result::Result<T, BarrierError>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Phase(pub u64);

/// Transport under a [`Barrier`]. `recv` returns `Ok(None)` once the peer
/// is gone.
pub trait BarrierEndpoint {
    fn send(&mut self, phase: Phase) -> std::result::Result<(), ChannelError>;
    fn recv(&mut self) -> std::result::Result<Option<Phase>, ChannelError>;
}

pub struct Barrier {
    endpoint: Box<dyn BarrierEndpoint>,
    local: u64,
    remote: u64,
}

impl Barrier {
    pub fn new(endpoint: Box<dyn BarrierEndpoint>) -> Self {
        Self {
            endpoint,
            local: 0,
            remote: 0,
        }
    }

    /// Phases placed by this side so far.
    pub fn phase(&self) -> u64 {
        self.local
    }

    /// Signals the next phase without waiting for the peer.
    pub fn place(&mut self) -> Result<()> {
        self.local += 1;
        tracing::trace!(phase = self.local, "placing barrier");
        match self.endpoint.send(Phase(self.local)) {
            Ok(()) => Ok(()),
            Err(ChannelError::BrokenChannel) => Err(BarrierError::PeerDied { phase: self.local }),
            Err(err) => Err(err.into()),
        }
    }

    /// Waits until the peer has placed every phase this side has placed.
    pub fn sync(&mut self) -> Result<()> {
        while self.remote < self.local {
            match self.endpoint.recv()? {
                Some(Phase(phase)) => self.remote = self.remote.max(phase),
                None => return Err(BarrierError::PeerDied { phase: self.local }),
            }
        }
        tracing::trace!(phase = self.local, "barrier synced");
        Ok(())
    }

    pub fn place_and_sync(&mut self) -> Result<()> {
        self.place()?;
        self.sync()
    }
}

/// Barrier endpoint over a pair of socket channels, one per direction.
pub struct SocketEndpoint {
    sender: Sender<Phase>,
    receiver: Receiver<Phase>,
}

impl SocketEndpoint {
    /// Releases the descriptors of this endpoint. Each process must close the
    /// endpoint it does not use, or its peer never observes a death. Dropping
    /// the endpoint closes it as well.
    pub fn close(&mut self) -> std::result::Result<(), ChannelError> {
        self.sender.close()?;
        self.receiver.close()
    }
}

impl BarrierEndpoint for SocketEndpoint {
    fn send(&mut self, phase: Phase) -> std::result::Result<(), ChannelError> {
        self.sender.send(phase)
    }

    fn recv(&mut self) -> std::result::Result<Option<Phase>, ChannelError> {
        match self.receiver.recv() {
            Ok(phase) => Ok(Some(phase)),
            Err(ChannelError::BrokenChannel) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Creates the two ends of a barrier: one for the parent, one for the child.
pub fn barrier_endpoints() -> std::result::Result<(SocketEndpoint, SocketEndpoint), ChannelError> {
    let (to_child, from_parent) = channel::<Phase>()?;
    let (to_parent, from_child) = channel::<Phase>()?;
    Ok((
        SocketEndpoint {
            sender: to_child,
            receiver: from_child,
        },
        SocketEndpoint {
            sender: to_parent,
            receiver: from_parent,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use nix::{sys::wait, unistd};
    use serial_test::serial;
    use std::{
        sync::mpsc::{self, Receiver as MpscReceiver, Sender as MpscSender},
        thread,
    };

    struct MockEndpoint {
        tx: MpscSender<Phase>,
        rx: MpscReceiver<Phase>,
    }

    impl BarrierEndpoint for MockEndpoint {
        fn send(&mut self, phase: Phase) -> std::result::Result<(), ChannelError> {
            self.tx
                .send(phase)
                .map_err(|_| ChannelError::BrokenChannel)
        }

        fn recv(&mut self) -> std::result::Result<Option<Phase>, ChannelError> {
            Ok(self.rx.recv().ok())
        }
    }

    fn mock_pair() -> (MockEndpoint, MockEndpoint) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            MockEndpoint { tx: a_tx, rx: a_rx },
            MockEndpoint { tx: b_tx, rx: b_rx },
        )
    }

    #[test]
    fn test_both_sides_pass_every_phase() -> Result<()> {
        let (a, b) = mock_pair();
        let peer = thread::spawn(move || -> std::result::Result<u64, BarrierError> {
            let mut barrier = Barrier::new(Box::new(b));
            barrier.place()?;
            barrier.place_and_sync()?;
            barrier.place_and_sync()?;
            Ok(barrier.phase())
        });

        let mut barrier = Barrier::new(Box::new(a));
        barrier.place_and_sync()?;
        barrier.place()?;
        barrier.place_and_sync()?;
        assert_eq!(barrier.phase(), 3);
        assert_eq!(peer.join().expect("peer thread panicked")?, 3);
        Ok(())
    }

    #[test]
    fn test_sync_reports_dead_peer() {
        let (a, b) = mock_pair();
        let mut barrier = Barrier::new(Box::new(a));
        drop(b);
        assert!(matches!(
            barrier.place_and_sync(),
            Err(BarrierError::PeerDied { phase: 1 })
        ));
    }

    #[test]
    fn test_peer_dies_mid_phase() {
        let (a, b) = mock_pair();
        let peer = thread::spawn(move || {
            let mut barrier = Barrier::new(Box::new(b));
            // reaches phase one, then goes away before phase two
            barrier.place_and_sync().is_ok()
        });

        let mut barrier = Barrier::new(Box::new(a));
        assert!(barrier.place_and_sync().is_ok());
        assert!(peer.join().expect("peer thread panicked"));
        assert!(matches!(
            barrier.place_and_sync(),
            Err(BarrierError::PeerDied { phase: 2 })
        ));
    }

    #[test]
    fn test_place_to_dead_peer() {
        let (a, b) = mock_pair();
        drop(b);
        let mut barrier = Barrier::new(Box::new(a));
        assert!(matches!(
            barrier.place(),
            Err(BarrierError::PeerDied { phase: 1 })
        ));
    }

    #[test]
    #[serial]
    fn test_socket_barrier_across_fork() -> Result<()> {
        let (mut parent_end, mut child_end) = barrier_endpoints()?;
        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                child_end.close()?;
                let mut barrier = Barrier::new(Box::new(parent_end));
                barrier.place_and_sync()?;
                // the child exits after phase one
                let status = wait::waitpid(child, None)?;
                assert_eq!(status, wait::WaitStatus::Exited(child, 0));
                assert!(matches!(
                    barrier.place_and_sync(),
                    Err(BarrierError::PeerDied { phase: 2 })
                ));
            }
            unistd::ForkResult::Child => {
                let _ = parent_end.close();
                let mut barrier = Barrier::new(Box::new(child_end));
                let code = match barrier.place_and_sync() {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
        };
        Ok(())
    }
}
