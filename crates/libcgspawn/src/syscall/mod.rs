//! Contains a wrapper of syscalls for unit tests
//! This provides a uniform interface for the rest of cgspawn
//! to call the syscalls required to set up a container

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;

pub use syscall::{create_syscall, Syscall, SyscallType};

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("set keep capabilities to {value} returned {errno}")]
    PrctlSetKeepCapabilitesFailed {
        errno: nix::errno::Errno,
        value: bool,
    },
    #[error("failed to set hostname to {hostname}: {errno}")]
    SetHostnameFailed {
        errno: nix::errno::Errno,
        hostname: String,
    },
    #[error("failed to set real gid to {gid}: {errno}")]
    SetRealGidFailed {
        errno: nix::errno::Errno,
        gid: nix::unistd::Gid,
    },
    #[error("failed to set real uid to {uid}: {errno}")]
    SetRealUidFailed {
        errno: nix::errno::Errno,
        uid: nix::unistd::Uid,
    },
    #[error("failed to unshare {flags:?}: {errno}")]
    UnshareFailed {
        flags: nix::sched::CloneFlags,
        errno: nix::errno::Errno,
    },
    #[error("failed to set capabilities: {0}")]
    SetCapsFailed(#[from] caps::errors::CapsError),
    #[error("failed to chroot to {path:?}: {errno}")]
    ChrootFailed {
        path: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("failed to mount {fstype:?} on {mount_target:?}: {errno}")]
    MountFailed {
        mount_source: Option<std::path::PathBuf>,
        mount_target: std::path::PathBuf,
        fstype: Option<String>,
        flags: nix::mount::MsFlags,
        data: Option<String>,
        errno: nix::errno::Errno,
    },
    #[error("failed to unmount {target:?}: {errno}")]
    UmountFailed {
        target: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("failed to symlink {new_path:?} -> {old_path:?}: {err}")]
    SymlinkFailed {
        old_path: std::path::PathBuf,
        new_path: std::path::PathBuf,
        err: std::io::Error,
    },
    #[error("failed to chown {path:?}: {errno}")]
    ChownFailed {
        path: std::path::PathBuf,
        owner: Option<nix::unistd::Uid>,
        group: Option<nix::unistd::Gid>,
        errno: nix::errno::Errno,
    },
}

impl SyscallError {
    /// The errno behind the failure, where there is one.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            SyscallError::PrctlSetKeepCapabilitesFailed { errno, .. }
            | SyscallError::SetHostnameFailed { errno, .. }
            | SyscallError::SetRealGidFailed { errno, .. }
            | SyscallError::SetRealUidFailed { errno, .. }
            | SyscallError::UnshareFailed { errno, .. }
            | SyscallError::ChrootFailed { errno, .. }
            | SyscallError::MountFailed { errno, .. }
            | SyscallError::UmountFailed { errno, .. }
            | SyscallError::ChownFailed { errno, .. } => Some(*errno),
            SyscallError::SymlinkFailed { err, .. } => {
                err.raw_os_error().map(nix::errno::Errno::from_raw)
            }
            SyscallError::SetCapsFailed(_) => None,
        }
    }
}

type Result<T> = std::result::Result<T, SyscallError>;
