use crate::common::{JoinSafelyError, WrappedIoError};

/// Errors produced while modelling the host cgroup tree.
#[derive(thiserror::Error, Debug)]
pub enum CgroupError {
    /// A `/proc` entry or hierarchy is missing. For `/proc/<pid>/cgroup` this
    /// means the process is gone.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed cgroup data: {0}")]
    DataCorrupt(String),
    #[error("invalid cgroup path: {0}")]
    InvalidPath(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Io(#[from] WrappedIoError),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("io error: {0}")]
    StdIo(#[from] std::io::Error),
}

impl CgroupError {
    /// The errno carried by this error, if it came from the OS.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            CgroupError::Nix(errno) => Some(*errno),
            CgroupError::Io(err) => err.inner().raw_os_error().map(nix::errno::Errno::from_raw),
            CgroupError::StdIo(err) => err.raw_os_error().map(nix::errno::Errno::from_raw),
            _ => None,
        }
    }
}

impl From<JoinSafelyError> for CgroupError {
    fn from(err: JoinSafelyError) -> Self {
        CgroupError::InvalidPath(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CgroupError>;
