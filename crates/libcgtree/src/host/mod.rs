//! Read-only view of the kernel surfaces the cgroup model is built from.
//! Everything the registry and the planner learn about the host goes through
//! [`CgroupHost`], so unit tests can describe a host in memory.

pub mod linux;

use std::{
    any::Any,
    io,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;

pub use linux::LinuxHost;
pub use test::TestHost;

/// Filesystem type of a directory, as far as the cgroup code cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Cgroup2,
    Cgroup1,
    Tmpfs,
    Other,
}

/// One line of `/proc/self/mountinfo`, reduced to what the planner mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    /// Comma separated superblock options, without `rw`/`ro`.
    pub super_options: String,
}

pub trait CgroupHost {
    fn as_any(&self) -> &dyn Any;
    /// Contents of `/proc/<pid>/cgroup`, or of `/proc/self/cgroup` for `None`.
    fn proc_cgroup(&self, pid: Option<Pid>) -> io::Result<String>;
    fn filesystem(&self, path: &Path) -> io::Result<FsKind>;
    fn subdirectories(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
    /// Fails with `InvalidInput` when `path` is not a symlink.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
    /// Symlinks directly inside `dir` as `(link, target)` pairs.
    fn symlinks(&self, dir: &Path) -> io::Result<Vec<(PathBuf, PathBuf)>>;
    fn mount_entries(&self) -> io::Result<Vec<MountEntry>>;
    /// Names of the controllers the kernel has enabled.
    fn kernel_controllers(&self) -> io::Result<Vec<String>>;
    fn cgroup_ns_supported(&self) -> bool;
}

#[derive(Clone, Copy)]
pub enum HostType {
    Linux,
    Test,
}

impl Default for HostType {
    fn default() -> Self {
        if cfg!(test) {
            HostType::Test
        } else {
            HostType::Linux
        }
    }
}

impl HostType {
    pub fn create_host(&self) -> Box<dyn CgroupHost> {
        match self {
            HostType::Linux => Box::new(LinuxHost),
            HostType::Test => Box::<TestHost>::default(),
        }
    }
}

pub fn create_host() -> Box<dyn CgroupHost> {
    HostType::default().create_host()
}
