use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use libcgtree::{
    common::PathBufExt, host::CgroupHost, CgroupError, CgroupRef, HierarchyId, HierarchyRegistry,
    MountAction,
};
use nix::{
    errno::Errno,
    mount::{MntFlags, MsFlags},
};

use super::{CgroupSetupError, Result};
use crate::syscall::{create_syscall, Syscall};

const BASE_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NODEV);

#[derive(Debug, Clone, Copy)]
pub struct CgroupMountOptions<'a> {
    /// Directory the plan's destinations are relative to, usually
    /// `<root>/sys/fs/cgroup`.
    pub cgroup_root: &'a Path,
    pub use_cgns: bool,
    pub use_userns: bool,
    /// Owner written into the tmpfs root's mount options.
    pub tmpfs_owner: Option<u32>,
}

/// Applies a plan produced by [`libcgtree::plan_mounts`].
pub struct CgroupMounter {
    syscall: Box<dyn Syscall>,
}

impl Default for CgroupMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupMounter {
    pub fn new() -> Self {
        Self::with_syscall(create_syscall())
    }

    pub fn with_syscall(syscall: Box<dyn Syscall>) -> Self {
        Self { syscall }
    }

    pub fn syscall(&self) -> &dyn Syscall {
        self.syscall.as_ref()
    }

    /// Mounts every action in order. Destinations that already carry a
    /// cgroup hierarchy are left alone.
    pub fn apply(
        &self,
        registry: &mut HierarchyRegistry,
        plan: &[MountAction],
        options: &CgroupMountOptions,
    ) -> Result<()> {
        let mut used_tmpfs = false;

        for action in plan {
            let dst = join_dst(options.cgroup_root, action.dst());
            tracing::debug!(%action, ?dst, "applying cgroup mount");

            match action {
                MountAction::Symlink { target, .. } => {
                    if let Some(parent) = dst.parent() {
                        if let Err(err) = fs::create_dir_all(parent) {
                            tracing::debug!(?err, ?parent, "failed to create symlink parent");
                        }
                    }
                    self.symlink_idempotent(Path::new(target), &dst)?;
                }
                MountAction::Tmpfs {
                    options: tmpfs_options,
                    ..
                } => {
                    used_tmpfs = true;
                    if is_mount_point(registry.host(), &dst)? {
                        tracing::debug!(?dst, "tmpfs already mounted");
                        continue;
                    }
                    let data = patch_tmpfs_options(tmpfs_options, options.tmpfs_owner);
                    self.syscall.mount(
                        Some(Path::new("tmpfs")),
                        &dst,
                        Some("tmpfs"),
                        BASE_FLAGS | MsFlags::MS_STRICTATIME,
                        non_empty(&data),
                    )?;
                }
                MountAction::CgroupV1 {
                    options: cg_options,
                    dst: rel,
                } => self.mount_hierarchy(registry, &dst, rel, cg_options, false, options)?,
                MountAction::CgroupV2 {
                    options: cg_options,
                    dst: rel,
                } => self.mount_hierarchy(registry, &dst, rel, cg_options, true, options)?,
            }
        }

        if used_tmpfs && (!options.use_userns || !options.use_cgns) {
            self.syscall.mount(
                None,
                options.cgroup_root,
                None,
                MsFlags::MS_REMOUNT | BASE_FLAGS | MsFlags::MS_STRICTATIME | MsFlags::MS_RDONLY,
                Some("mode=755"),
            )?;
        }

        Ok(())
    }

    fn symlink_idempotent(&self, target: &Path, link: &Path) -> Result<()> {
        match self.syscall.symlink(target, link) {
            Ok(()) => Ok(()),
            Err(err) if err.errno() == Some(Errno::EEXIST) => match fs::read_link(link) {
                Ok(existing) if existing == target => Ok(()),
                _ => Err(CgroupSetupError::SymlinkConflict {
                    path: link.to_path_buf(),
                    target: target.to_path_buf(),
                }),
            },
            Err(err) => Err(err.into()),
        }
    }

    fn mount_hierarchy(
        &self,
        registry: &mut HierarchyRegistry,
        dst: &Path,
        rel: &str,
        cg_options: &str,
        unified: bool,
        options: &CgroupMountOptions,
    ) -> Result<()> {
        if is_mount_point(registry.host(), dst)? {
            if dst.join(libcgtree::common::CGROUP_PROCS).exists() {
                tracing::debug!(?dst, "cgroup hierarchy already mounted");
                return Ok(());
            }
            return Err(CgroupSetupError::NotACgroup(dst.to_path_buf()));
        }
        if let Err(err) = fs::create_dir_all(dst) {
            tracing::debug!(?err, ?dst, "failed to create cgroup mount point");
        }

        let fstype = if unified { "cgroup2" } else { "cgroup" };
        // the container only gets to write to the unified or systemd tree,
        // unless a user and a cgroup namespace already confine it
        let rw = (options.use_userns && options.use_cgns) || unified || rel == "systemd";
        let mut flags = BASE_FLAGS;
        if !rw || !options.use_cgns {
            flags |= MsFlags::MS_RDONLY;
        }

        self.syscall.mount(
            Some(Path::new("cgroup")),
            dst,
            Some(fstype),
            flags,
            non_empty(cg_options),
        )?;

        if rw && !options.use_cgns {
            let own = own_cgroup(registry, unified, cg_options)?;
            self.expose_own_cgroup(dst, fstype, cg_options, &own)?;
        }
        Ok(())
    }

    /// Without a cgroup namespace the hierarchy is mounted read-only and only
    /// our own subtree is bind mounted writable on top of it.
    fn expose_own_cgroup(
        &self,
        dst: &Path,
        fstype: &str,
        cg_options: &str,
        own: &CgroupRef,
    ) -> Result<()> {
        let mut rw_mountpoint = OsString::from(dst.as_os_str());
        rw_mountpoint.push(".");
        let rw_mountpoint = PathBuf::from(rw_mountpoint);
        let source = rw_mountpoint
            .join_safely(own.path())
            .map_err(CgroupError::from)?;
        let target = dst
            .to_path_buf()
            .join_safely(own.path())
            .map_err(CgroupError::from)?;

        if let Err(err) = fs::create_dir(&rw_mountpoint) {
            tracing::debug!(?err, ?rw_mountpoint, "failed to create writable mount point");
        }
        self.syscall.mount(
            Some(Path::new("cgroup")),
            &rw_mountpoint,
            Some(fstype),
            BASE_FLAGS,
            non_empty(cg_options),
        )?;
        self.syscall.mount(
            Some(&source),
            &target,
            None,
            MsFlags::MS_BIND,
            None,
        )?;
        self.syscall.umount2(&rw_mountpoint, MntFlags::empty())?;
        fs::remove_dir(&rw_mountpoint).map_err(|source| CgroupSetupError::Io {
            path: rw_mountpoint,
            source,
        })
    }
}

/// Finds the calling process's cgroup in the hierarchy a mount with
/// `cg_options` attaches to.
fn own_cgroup(
    registry: &mut HierarchyRegistry,
    unified: bool,
    cg_options: &str,
) -> Result<CgroupRef> {
    // the mount may just have created a named hierarchy
    registry.flush();

    if unified {
        return Ok(registry.pid_cgroup(None, HierarchyId::UNIFIED)?);
    }

    for selector in cg_options.split(',').filter(|s| !s.is_empty() && *s != "none") {
        let id = match registry.get_v1_hierarchy(selector) {
            Ok(hierarchy) => hierarchy.id,
            Err(CgroupError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        return Ok(registry.pid_cgroup(None, id)?);
    }

    Err(CgroupError::NotFound(format!(
        "no numbered hierarchy matches cgroup mount options {cg_options:?}"
    ))
    .into())
}

fn join_dst(root: &Path, dst: &str) -> PathBuf {
    if dst.is_empty() {
        root.to_path_buf()
    } else {
        root.join(dst.trim_start_matches('/'))
    }
}

fn non_empty(data: &str) -> Option<&str> {
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

fn patch_tmpfs_options(options: &str, owner: Option<u32>) -> String {
    match owner {
        Some(id) if options.is_empty() => format!("uid={id},gid={id}"),
        Some(id) => format!("{options},uid={id},gid={id}"),
        None => options.to_owned(),
    }
}

/// A path is a mount point when the mount table has an entry for it, which
/// includes bind mounts on the same device. Symlinks are followed.
pub(crate) fn is_mount_point(host: &dyn CgroupHost, path: &Path) -> Result<bool> {
    let path = match fs::canonicalize(path) {
        Ok(path) => path,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(CgroupSetupError::MountPoint {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let entries = host
        .mount_entries()
        .map_err(|source| CgroupSetupError::MountPoint {
            path: path.clone(),
            source,
        })?;
    Ok(entries.iter().any(|entry| entry.mount_point == path))
}
