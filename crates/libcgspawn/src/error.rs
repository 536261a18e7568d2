use std::path::PathBuf;

use libcgtree::CgroupError;

use crate::{
    barrier::BarrierError, capabilities::UnknownCapability, cgroup::CgroupSetupError,
    channel::ChannelError, syscall::SyscallError, user_ns::UserNamespaceError,
};

/// Everything that can abort a launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error(transparent)]
    CgroupSetup(#[from] CgroupSetupError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    UserNamespace(#[from] UserNamespaceError),
    #[error(transparent)]
    Capability(#[from] UnknownCapability),
    #[error("{0}")]
    Unsupported(String),
    #[error("invalid spawn request: {0}")]
    InvalidRequest(String),
    #[error("{path:?}: {msg}")]
    InvalidRoot { path: PathBuf, msg: &'static str },
    #[error("child process failed: {0}")]
    ChildFailed(String),
    #[error("unexpected message {msg} while waiting for {waiting_for}")]
    UnexpectedMessage {
        msg: String,
        waiting_for: &'static str,
    },
    #[error("failed to fork")]
    Fork(#[source] nix::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("io error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Whether the launch failed because the kernel lacks a feature.
    pub fn is_unsupported(&self) -> bool {
        match self {
            LaunchError::Unsupported(_) => true,
            LaunchError::Cgroup(err) => matches!(err, CgroupError::Unsupported(_)),
            LaunchError::CgroupSetup(CgroupSetupError::Cgroup(err)) => {
                matches!(err, CgroupError::Unsupported(_))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;
