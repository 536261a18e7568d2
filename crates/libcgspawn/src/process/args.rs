use std::path::{Path, PathBuf};

use caps::Capability;
use libcgtree::{CgroupVersion, MountAction, RequestedVersion};
use nix::sys::signal::Signal;

use crate::{
    error::{LaunchError, Result},
    syscall::SyscallType,
    user_ns::UserNamespaceMode,
};

/// A fully resolved request to run one container.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Directory holding the container's OS tree
    pub root: PathBuf,
    /// Cgroup layout the container expects
    pub cgroup_version: RequestedVersion,
    pub userns: UserNamespaceMode,
    /// Run the payload in its own network namespace
    pub private_network: bool,
    /// Use a cgroup namespace when the kernel supports one
    pub use_cgns: bool,
    pub hostname: Option<String>,
    /// Kept in the bounding set on top of the defaults
    pub capabilities: Vec<Capability>,
    /// Working directory inside the container
    pub chdir: Option<PathBuf>,
    /// `KEY=VALUE` pairs handed to the payload
    pub env: Vec<String>,
    /// Program and arguments. Empty runs `/bin/sh`.
    pub command: Vec<String>,
    /// Sent to the container on the first SIGINT or SIGTERM the launcher
    /// receives. A second one kills it.
    pub kill_signal: Signal,
    /// Interface to operating system primitives
    pub syscall: SyscallType,
}

impl SpawnRequest {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            cgroup_version: RequestedVersion::default(),
            userns: UserNamespaceMode::default(),
            private_network: false,
            use_cgns: true,
            hostname: None,
            capabilities: Vec::new(),
            chdir: None,
            env: Vec::new(),
            command: Vec::new(),
            kill_signal: Signal::SIGTERM,
            syscall: SyscallType::default(),
        }
    }

    /// Rejects requests that cannot describe a bootable tree.
    pub fn validate(&self) -> Result<()> {
        validate_root(&self.root)?;

        if let UserNamespaceMode::Fixed { shift, range } = self.userns {
            if range == 0 {
                return Err(LaunchError::InvalidRequest("uid range must not be zero".into()));
            }
            if let Some(shift) = shift {
                if shift.checked_add(range).is_none() {
                    return Err(LaunchError::InvalidRequest(format!(
                        "uid shift {shift:#x} with range {range:#x} overflows"
                    )));
                }
            }
        }

        for entry in &self.env {
            if !entry.contains('=') || entry.starts_with('=') {
                return Err(LaunchError::InvalidRequest(format!(
                    "environment entry {entry:?} is not KEY=VALUE"
                )));
            }
        }

        if let Some(chdir) = &self.chdir {
            if !chdir.is_absolute() {
                return Err(LaunchError::InvalidRequest(format!(
                    "working directory {chdir:?} must be absolute"
                )));
            }
        }

        Ok(())
    }
}

/// What the parent worked out before forking, shared with both children.
#[derive(Debug, Clone)]
pub struct ContainerArgs<'a> {
    pub request: &'a SpawnRequest,
    /// Host cgroup version
    pub outer_version: CgroupVersion,
    /// Cgroup version the container sees
    pub inner_version: CgroupVersion,
    /// Whether the payload gets a cgroup namespace. Decides which child
    /// applies `plan`.
    pub use_cgns: bool,
    pub plan: Vec<MountAction>,
}

fn validate_root(root: &Path) -> Result<()> {
    let meta = root.metadata().map_err(|source| LaunchError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(LaunchError::InvalidRoot {
            path: root.to_path_buf(),
            msg: "not a directory",
        });
    }

    let canonical = root.canonicalize().map_err(|source| LaunchError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    if canonical == Path::new("/") {
        return Err(LaunchError::InvalidRoot {
            path: root.to_path_buf(),
            msg: "refusing to use the host root",
        });
    }

    if !canonical.join("usr").is_dir() {
        return Err(LaunchError::InvalidRoot {
            path: root.to_path_buf(),
            msg: "does not look like an OS tree, usr/ is missing",
        });
    }
    Ok(())
}
