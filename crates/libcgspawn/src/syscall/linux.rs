//! Implements Command trait for Linux systems
use std::{any::Any, os::unix::fs::symlink, path::Path};

use caps::{CapSet, CapsHashSet};
use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    unistd::{chown, chroot, sethostname, Gid, Uid},
};

use super::{Result, Syscall, SyscallError};

/// Empty structure to implement Syscall trait for
#[derive(Clone, Copy)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    /// To enable dynamic typing,
    /// see <https://doc.rust-lang.org/std/any/index.html> for more information
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        chroot(path).map_err(|errno| {
            tracing::error!(?errno, ?path, "failed to chroot");
            SyscallError::ChrootFailed {
                path: path.to_path_buf(),
                errno,
            }
        })
    }

    /// set uid and gid for process
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()> {
        prctl::set_keep_capabilities(true).map_err(|errno| {
            tracing::error!(?errno, "failed to set keep capabilities to true");
            SyscallError::PrctlSetKeepCapabilitesFailed {
                errno: Errno::from_raw(errno),
                value: true,
            }
        })?;

        // This is safe because at this point we have only
        // one thread in the process
        let raw_gid = gid.as_raw();
        if unsafe { libc::syscall(libc::SYS_setresgid, raw_gid, raw_gid, raw_gid) } == -1 {
            let errno = Errno::last();
            tracing::error!(?errno, ?gid, "failed to set real, effective and saved set gid");
            return Err(SyscallError::SetRealGidFailed { errno, gid });
        }

        let raw_uid = uid.as_raw();
        if unsafe { libc::syscall(libc::SYS_setresuid, raw_uid, raw_uid, raw_uid) } == -1 {
            let errno = Errno::last();
            tracing::error!(?errno, ?uid, "failed to set real, effective and saved set uid");
            return Err(SyscallError::SetRealUidFailed { errno, uid });
        }

        // a non root user only keeps what the kernel checks against
        if uid != Uid::from_raw(0) {
            let permitted = caps::read(None, CapSet::Permitted)?;
            caps::set(None, CapSet::Effective, &permitted)?;
        }

        prctl::set_keep_capabilities(false).map_err(|errno| {
            tracing::error!(?errno, "failed to set keep capabilities to false");
            SyscallError::PrctlSetKeepCapabilitesFailed {
                errno: Errno::from_raw(errno),
                value: false,
            }
        })?;
        Ok(())
    }

    /// Disassociate parts of execution context
    // see https://man7.org/linux/man-pages/man2/unshare.2.html for more information
    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags).map_err(|errno| {
            tracing::error!(?errno, ?flags, "failed to unshare");
            SyscallError::UnshareFailed { flags, errno }
        })
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()> {
        match cset {
            // caps::set cannot set capabilities in bounding set,
            // so every capability outside of value is dropped one by one
            CapSet::Bounding => {
                let all = caps::read(None, CapSet::Bounding)?;
                for c in all.difference(value) {
                    caps::drop(None, CapSet::Bounding, *c)?
                }
            }
            _ => {
                caps::set(None, cset, value)?;
            }
        }
        Ok(())
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        sethostname(hostname).map_err(|errno| {
            tracing::error!(?errno, hostname, "failed to set hostname");
            SyscallError::SetHostnameFailed {
                errno,
                hostname: hostname.to_owned(),
            }
        })
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| {
            tracing::error!(?errno, ?source, ?target, ?fstype, ?flags, ?data, "failed to mount");
            SyscallError::MountFailed {
                mount_source: source.map(|p| p.to_path_buf()),
                mount_target: target.to_path_buf(),
                fstype: fstype.map(|s| s.to_owned()),
                flags,
                data: data.map(|s| s.to_owned()),
                errno,
            }
        })
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags).map_err(|errno| {
            tracing::error!(?errno, ?target, "failed to unmount");
            SyscallError::UmountFailed {
                target: target.to_path_buf(),
                errno,
            }
        })
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        symlink(original, link).map_err(|err| {
            tracing::error!(?err, ?original, ?link, "failed to create symlink");
            SyscallError::SymlinkFailed {
                old_path: original.to_path_buf(),
                new_path: link.to_path_buf(),
                err,
            }
        })
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        chown(path, owner, group).map_err(|errno| SyscallError::ChownFailed {
            path: path.to_path_buf(),
            owner,
            group,
            errno,
        })
    }
}
