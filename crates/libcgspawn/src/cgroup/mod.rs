//! Puts the container into its cgroup and builds its view of the cgroup
//! tree.

mod mount;
mod sync;

pub use mount::{CgroupMountOptions, CgroupMounter};
pub use sync::{CgroupSync, CHOWN_FILES, DEFAULT_TMP_BASE, PAYLOAD_CGROUP, SUPERVISOR_CGROUP};

use std::path::PathBuf;

use libcgtree::CgroupError;

use crate::syscall::SyscallError;

#[derive(Debug, thiserror::Error)]
pub enum CgroupSetupError {
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error("failed to check whether {path:?} is a mount point")]
    MountPoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0:?} is already mounted but not a cgroup hierarchy")]
    NotACgroup(PathBuf),
    #[error("{path:?} exists and does not point at {target:?}")]
    SymlinkConflict { path: PathBuf, target: PathBuf },
    #[error("failed to create temporary cgroup mount point")]
    TempDir(#[source] nix::Error),
    #[error("io error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, CgroupSetupError>;
