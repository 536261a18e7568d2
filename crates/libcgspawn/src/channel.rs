use std::{
    io::{IoSlice, IoSliceMut},
    marker::PhantomData,
    os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
};

use nix::{
    errno::Errno,
    sys::socket::{self, UnixAddr},
    unistd,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed unix syscalls")]
    Nix(#[from] nix::Error),
    #[error("failed serde serialization")]
    Serde(#[from] serde_json::Error),
    #[error("channel connection broken")]
    BrokenChannel,
    #[error("short message: expected {expected} bytes, got {got}")]
    ShortMessage { expected: usize, got: usize },
    #[error("channel end already closed")]
    Closed,
}

fn raw_fd(fd: &Option<OwnedFd>) -> Result<RawFd, ChannelError> {
    fd.as_ref()
        .map(|fd| fd.as_raw_fd())
        .ok_or(ChannelError::Closed)
}

fn close_fd(fd: &mut Option<OwnedFd>) -> Result<(), ChannelError> {
    match fd.take() {
        Some(fd) => Ok(unistd::close(fd.into_raw_fd())?),
        None => Ok(()),
    }
}

/// Receiving end of a message channel. Messages are json, prefixed by their
/// length, one message per datagram. The descriptor is closed on drop.
pub struct Receiver<T> {
    receiver: Option<OwnedFd>,
    phantom: PhantomData<T>,
}

pub struct Sender<T> {
    sender: Option<OwnedFd>,
    phantom: PhantomData<T>,
}

impl<T> Sender<T>
where
    T: Serialize,
{
    fn send_slice_with_len(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        let len = (data.len() as u64).to_ne_bytes();
        let iov = [IoSlice::new(&len), IoSlice::new(data)];
        // a dead peer must surface as EPIPE rather than kill us with SIGPIPE
        let sent = socket::sendmsg::<UnixAddr>(
            raw_fd(&self.sender)?,
            &iov,
            &[],
            socket::MsgFlags::MSG_NOSIGNAL,
            None,
        )
        .map_err(|err| match err {
            Errno::EPIPE | Errno::ECONNRESET => ChannelError::BrokenChannel,
            err => ChannelError::Nix(err),
        })?;

        let expected = len.len() + data.len();
        if sent != expected {
            return Err(ChannelError::ShortMessage {
                expected,
                got: sent,
            });
        }
        Ok(sent)
    }

    pub fn send(&mut self, object: T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(&object)?;
        self.send_slice_with_len(&payload)?;

        Ok(())
    }

    /// Closes this end now. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        close_fd(&mut self.sender)
    }
}

impl<T> Receiver<T>
where
    T: serde::de::DeserializeOwned,
{
    fn peek_size(&mut self) -> Result<u64, ChannelError> {
        let mut len = [0u8; std::mem::size_of::<u64>()];
        let mut iov = [IoSliceMut::new(&mut len)];
        let msg = socket::recvmsg::<UnixAddr>(
            raw_fd(&self.receiver)?,
            &mut iov,
            None,
            socket::MsgFlags::MSG_PEEK,
        )?;
        // zero bytes means every sender is gone
        match (msg.bytes, u64::from_ne_bytes(len)) {
            (0, _) | (_, 0) => Err(ChannelError::BrokenChannel),
            (_, len) => Ok(len),
        }
    }

    fn recv_into_buf_with_len(&mut self) -> Result<Vec<u8>, ChannelError> {
        let msg_len = self.peek_size()? as usize;
        let mut len = [0u8; std::mem::size_of::<u64>()];
        let mut buf = vec![0u8; msg_len];
        let fd = raw_fd(&self.receiver)?;
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut len), IoSliceMut::new(&mut buf)];
            socket::recvmsg::<UnixAddr>(fd, &mut iov, None, socket::MsgFlags::empty())?
                .bytes
        };

        let expected = len.len() + msg_len;
        match bytes {
            0 => Err(ChannelError::BrokenChannel),
            n if n != expected => Err(ChannelError::ShortMessage { expected, got: n }),
            _ => Ok(buf),
        }
    }

    /// Blocks until the next message of type T arrives.
    pub fn recv(&mut self) -> Result<T, ChannelError> {
        let buf = self.recv_into_buf_with_len()?;
        Ok(serde_json::from_slice(&buf[..])?)
    }

    pub fn close(&mut self) -> Result<(), ChannelError> {
        close_fd(&mut self.receiver)
    }
}

pub fn channel<T>() -> Result<(Sender<T>, Receiver<T>), ChannelError>
where
    T: for<'de> Deserialize<'de> + Serialize,
{
    let (os_sender, os_receiver) = unix_channel()?;
    let receiver = Receiver {
        receiver: Some(os_receiver),
        phantom: PhantomData,
    };
    let sender = Sender {
        sender: Some(os_sender),
        phantom: PhantomData,
    };
    Ok((sender, receiver))
}

// Use socketpair as the underlying pipe.
fn unix_channel() -> Result<(OwnedFd, OwnedFd), ChannelError> {
    let pair = socket::socketpair(
        socket::AddressFamily::Unix,
        socket::SockType::SeqPacket,
        None,
        socket::SockFlag::SOCK_CLOEXEC,
    )?;
    Ok(pair)
}
