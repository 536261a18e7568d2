//! Typed channels between the parent and the outer child.
//!
//! Each channel is uni-directional. The parent holds the receiver of the
//! parent channel, the outer child holds the receiver of the outer channel.
//! Senders are shared through fork, so every process must close the ends it
//! does not use.

use nix::unistd::Pid;

use crate::{
    channel::{channel, ChannelError, Receiver, Sender},
    error::{LaunchError, Result},
    process::message::Message,
    user_ns::UidShift,
};

pub fn parent_channel() -> std::result::Result<(ParentSender, ParentReceiver), ChannelError> {
    let (sender, receiver) = channel::<Message>()?;
    Ok((ParentSender { sender }, ParentReceiver { receiver }))
}

pub struct ParentSender {
    sender: Sender<Message>,
}

impl ParentSender {
    pub fn uid_shift(&mut self, shift: Option<UidShift>) -> Result<()> {
        tracing::debug!(?shift, "sending uid shift");
        self.sender.send(Message::UidShift(shift))?;
        Ok(())
    }

    pub fn inner_ready(&mut self, pid: Pid) -> Result<()> {
        tracing::debug!(%pid, "sending inner child pid");
        self.sender.send(Message::InnerReady(pid.as_raw()))?;
        Ok(())
    }

    pub fn outer_failed(&mut self, err: String) -> Result<()> {
        self.sender.send(Message::OuterFailed(err))?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.sender.close()?)
    }
}

pub struct ParentReceiver {
    receiver: Receiver<Message>,
}

impl ParentReceiver {
    fn recv(&mut self, waiting_for: &'static str) -> Result<Message> {
        match self.receiver.recv() {
            Ok(Message::OuterFailed(err)) => Err(LaunchError::ChildFailed(err)),
            Ok(msg) => Ok(msg),
            Err(ChannelError::BrokenChannel) => Err(LaunchError::ChildFailed(format!(
                "outer child went away while waiting for {waiting_for}"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub fn wait_for_uid_shift(&mut self) -> Result<Option<UidShift>> {
        match self.recv("uid shift")? {
            Message::UidShift(shift) => Ok(shift),
            msg => Err(LaunchError::UnexpectedMessage {
                msg: msg.to_string(),
                waiting_for: "uid shift",
            }),
        }
    }

    /// Waits for the outer child to report the inner child's pid.
    pub fn wait_for_inner_ready(&mut self) -> Result<Pid> {
        match self.recv("inner child pid")? {
            Message::InnerReady(pid) => Ok(Pid::from_raw(pid)),
            msg => Err(LaunchError::UnexpectedMessage {
                msg: msg.to_string(),
                waiting_for: "inner child pid",
            }),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.receiver.close()?)
    }
}

pub fn outer_channel() -> std::result::Result<(OuterSender, OuterReceiver), ChannelError> {
    let (sender, receiver) = channel::<Message>()?;
    Ok((OuterSender { sender }, OuterReceiver { receiver }))
}

pub struct OuterSender {
    sender: Sender<Message>,
}

impl OuterSender {
    pub fn uid_shift_picked(&mut self, shift: UidShift) -> Result<()> {
        tracing::debug!(shift = shift.shift, "uid range picked");
        self.sender.send(Message::UidShiftPicked(shift))?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.sender.close()?)
    }
}

pub struct OuterReceiver {
    receiver: Receiver<Message>,
}

impl OuterReceiver {
    pub fn wait_for_picked_shift(&mut self) -> Result<UidShift> {
        let msg = self.receiver.recv()?;
        match msg {
            Message::UidShiftPicked(shift) => Ok(shift),
            msg => Err(LaunchError::UnexpectedMessage {
                msg: msg.to_string(),
                waiting_for: "picked uid shift",
            }),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.receiver.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{spawn_child, wait_child};
    use anyhow::Result;
    use nix::sys::wait::WaitStatus;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_uid_negotiation() -> Result<()> {
        let (parent_sender, parent_receiver) = &mut parent_channel()?;
        let (outer_sender, outer_receiver) = &mut outer_channel()?;

        let child = spawn_child(|| {
            let candidate = UidShift {
                shift: 0x80000,
                range: 0x10000,
            };
            if parent_sender.uid_shift(Some(candidate)).is_err() {
                return 1;
            }
            match outer_receiver.wait_for_picked_shift() {
                Ok(picked) if picked.shift == 0x90000 => {}
                _ => return 2,
            }
            match parent_sender.inner_ready(Pid::from_raw(4242)) {
                Ok(()) => 0,
                Err(_) => 3,
            }
        })?;
        parent_sender.close()?;

        let shift = parent_receiver.wait_for_uid_shift()?;
        assert_eq!(shift.map(|s| s.shift), Some(0x80000));
        outer_sender.uid_shift_picked(UidShift {
            shift: 0x90000,
            range: 0x10000,
        })?;
        assert_eq!(parent_receiver.wait_for_inner_ready()?, Pid::from_raw(4242));
        assert_eq!(wait_child(child)?, WaitStatus::Exited(child, 0));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_outer_failure_is_reported() -> Result<()> {
        let (parent_sender, parent_receiver) = &mut parent_channel()?;
        let child = spawn_child(|| {
            let _ = parent_sender.outer_failed("no mount namespace".into());
            0
        })?;
        parent_sender.close()?;

        let err = parent_receiver.wait_for_inner_ready().unwrap_err();
        assert!(matches!(err, LaunchError::ChildFailed(msg) if msg == "no mount namespace"));
        wait_child(child)?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_dead_outer_child() -> Result<()> {
        let (parent_sender, parent_receiver) = &mut parent_channel()?;
        let child = spawn_child(|| 0)?;
        parent_sender.close()?;
        wait_child(child)?;

        assert!(matches!(
            parent_receiver.wait_for_inner_ready(),
            Err(LaunchError::ChildFailed(_))
        ));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_unexpected_message() -> Result<()> {
        let (parent_sender, parent_receiver) = &mut parent_channel()?;
        parent_sender.inner_ready(Pid::from_raw(1))?;
        assert!(matches!(
            parent_receiver.wait_for_uid_shift(),
            Err(LaunchError::UnexpectedMessage { .. })
        ));
        Ok(())
    }
}
