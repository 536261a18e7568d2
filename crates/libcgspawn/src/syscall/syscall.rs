//! An interface trait so that the rest of cgspawn can call
//! necessary functions without having to worry about their
//! implementation details
use std::{any::Any, path::Path};

use caps::{CapSet, CapsHashSet};
use nix::{
    mount::{MntFlags, MsFlags},
    sched::CloneFlags,
    unistd::{Gid, Uid},
};

use crate::syscall::{linux::LinuxSyscall, test::TestHelperSyscall, Result};

/// This specifies various kernel/other functionalities required for
/// setting up a container
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn chroot(&self, path: &Path) -> Result<()>;
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()>;
    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()>;
    fn set_hostname(&self, hostname: &str) -> Result<()>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(LinuxSyscall),
            SyscallType::Test => Box::<TestHelperSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
