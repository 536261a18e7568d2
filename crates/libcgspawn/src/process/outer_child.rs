//! The outer child owns a fresh mount namespace. It turns the container's
//! root into a mount of its own, works out the uid shift with the parent,
//! and forks the inner child into the remaining namespaces.

use std::{
    fs,
    path::{Path, PathBuf},
};

use libcgtree::HierarchyRegistry;
use nix::{errno::Errno, mount::MsFlags, sched::CloneFlags, unistd};

use super::{
    args::ContainerArgs,
    channel::{OuterReceiver, ParentSender},
    fork::container_fork,
    inner_child::container_inner_process,
};
use crate::{
    barrier::SocketEndpoint,
    cgroup::{CgroupMountOptions, CgroupMounter},
    error::{LaunchError, Result},
    syscall::{Syscall, SyscallError},
    user_ns::{determine_uid_shift, UidShift, UserNamespaceMode},
};

const SYSFS_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NODEV);

pub fn container_outer_process(
    args: &ContainerArgs,
    registry: &mut HierarchyRegistry,
    parent_sender: &mut ParentSender,
    outer_receiver: &mut OuterReceiver,
    child_barrier: &mut Option<SocketEndpoint>,
) -> Result<()> {
    let request = args.request;
    let syscall = request.syscall.create_syscall();

    set_parent_death_signal()?;

    syscall
        .unshare(CloneFlags::CLONE_NEWNS)
        .map_err(unshare_error)?;

    prepare_root(syscall.as_ref(), &request.root)?;

    let uid_shift = negotiate_uid_shift(request.userns, &request.root, parent_sender, outer_receiver)?;

    mount_sysfs(syscall.as_ref(), &request.root, uid_shift)?;

    if !args.use_cgns {
        let cgroup_root = request.root.join("sys/fs/cgroup");
        let mounter = CgroupMounter::with_syscall(request.syscall.create_syscall());
        mounter.apply(
            registry,
            &args.plan,
            &CgroupMountOptions {
                cgroup_root: &cgroup_root,
                use_cgns: false,
                use_userns: uid_shift.is_some(),
                tmpfs_owner: uid_shift.map(|s| s.shift),
            },
        )?;
    }

    move_root(syscall.as_ref(), &request.root)?;

    syscall
        .unshare(namespace_flags(request.userns, request.private_network))
        .map_err(unshare_error)?;

    let inner_pid = container_fork("cgspawn:[2:INNER]", || {
        let endpoint = child_barrier.take().ok_or_else(|| {
            LaunchError::ChildFailed("barrier endpoint already taken".into())
        })?;
        // the inner child only talks to the parent through the barrier
        if let Err(err) = parent_sender.close() {
            tracing::debug!(?err, "failed to close parent sender in inner child");
        }
        if let Err(err) = outer_receiver.close() {
            tracing::debug!(?err, "failed to close outer receiver in inner child");
        }
        container_inner_process(args, registry, endpoint, uid_shift.is_some())
    })?;

    if let Some(mut endpoint) = child_barrier.take() {
        if let Err(err) = endpoint.close() {
            tracing::debug!(?err, "failed to close child barrier end");
        }
    }

    parent_sender.inner_ready(inner_pid)?;
    Ok(())
}

fn set_parent_death_signal() -> Result<()> {
    // SAFETY: PR_SET_PDEATHSIG only reads its integer argument.
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    Errno::result(ret)?;
    Ok(())
}

/// Namespace creation failing with EINVAL means the kernel lacks it.
pub(crate) fn unshare_error(err: SyscallError) -> LaunchError {
    match err {
        SyscallError::UnshareFailed {
            flags,
            errno: Errno::EINVAL,
        } => LaunchError::Unsupported(format!(
            "failed to create {flags:?}; does the kernel support namespaces?"
        )),
        err => err.into(),
    }
}

pub(crate) fn namespace_flags(userns: UserNamespaceMode, private_network: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    if userns.enabled() {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    if private_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

/// Keeps host mount events out of the namespace, then makes the root a
/// shared mount point of its own.
pub(crate) fn prepare_root(syscall: &dyn Syscall, root: &Path) -> Result<()> {
    syscall.mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None,
    )?;
    syscall.mount(
        Some(root),
        root,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )?;
    syscall.mount(None, root, None, MsFlags::MS_SHARED | MsFlags::MS_REC, None)?;
    Ok(())
}

/// Sends the shift derived from the tree to the parent. In pick mode that
/// is only a candidate and the parent answers with the range it locked.
fn negotiate_uid_shift(
    mode: UserNamespaceMode,
    root: &Path,
    parent_sender: &mut ParentSender,
    outer_receiver: &mut OuterReceiver,
) -> Result<Option<UidShift>> {
    let shift = determine_uid_shift(mode, root)?;
    parent_sender.uid_shift(shift)?;

    if mode == UserNamespaceMode::Pick {
        let picked = outer_receiver.wait_for_picked_shift()?;
        tracing::debug!(shift = picked.shift, range = picked.range, "using picked uid range");
        return Ok(Some(picked));
    }
    Ok(shift)
}

/// Read-only sysfs, or a tmpfs stand-in when the payload runs under a user
/// namespace that cannot see the host's devices.
pub(crate) fn mount_sysfs(syscall: &dyn Syscall, root: &Path, uid_shift: Option<UidShift>) -> Result<()> {
    let sys = root.join("sys");
    create_dir(&sys)?;

    match uid_shift {
        None => syscall.mount(
            Some(Path::new("sysfs")),
            &sys,
            Some("sysfs"),
            SYSFS_FLAGS | MsFlags::MS_RDONLY,
            None,
        )?,
        Some(shift) => {
            let options = format!("mode=755,uid={},gid={}", shift.shift, shift.shift);
            syscall.mount(
                Some(Path::new("tmpfs")),
                &sys,
                Some("tmpfs"),
                SYSFS_FLAGS,
                Some(&options),
            )?;
            create_dir(&sys.join("fs/cgroup"))?;
        }
    }
    Ok(())
}

/// Makes `root` the root of the mount namespace.
fn move_root(syscall: &dyn Syscall, root: &Path) -> Result<()> {
    unistd::chdir(root)?;
    syscall.mount(Some(root), Path::new("/"), None, MsFlags::MS_MOVE, None)?;
    syscall.chroot(Path::new("."))?;
    unistd::chdir("/")?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| LaunchError::Io {
        path: PathBuf::from(path),
        source,
    })
}
