use std::{
    fs,
    path::{Path, PathBuf},
};

use libcgtree::{
    common::{
        create_cgroup_dir, read_cgroup_file, read_cgroup_procs, write_cgroup_file, PathBufExt,
        CGROUP_CONTROLLERS, CGROUP_PROCS, CGROUP_SUBTREE_CONTROL,
    },
    CgroupError, CgroupVersion, HierarchyId, HierarchyRegistry,
};
use nix::{
    errno::Errno,
    mount::{MntFlags, MsFlags},
    unistd::{self, Gid, Pid, Uid},
};

use super::{CgroupSetupError, Result};
use crate::{
    syscall::{create_syscall, Syscall},
    user_ns::UidShift,
};

pub const PAYLOAD_CGROUP: &str = "payload";
pub const SUPERVISOR_CGROUP: &str = "supervisor";

/// Files handed to the container's root when its cgroup is delegated.
pub const CHOWN_FILES: &[&str] = &[
    ".",
    "cgroup.clone_children",
    "cgroup.controllers",
    "cgroup.events",
    "cgroup.procs",
    "cgroup.stat",
    "cgroup.subtree_control",
    "cgroup.threads",
    "notify_on_release",
    "tasks",
];

/// Where temporary cgroup mounts are created.
pub const DEFAULT_TMP_BASE: &str = "/tmp";

/// A private cgroup mount under a fresh temporary directory. Unmounted and
/// removed when dropped.
struct TempCgroupMount<'a> {
    syscall: &'a dyn Syscall,
    path: PathBuf,
    mounted: bool,
}

impl<'a> TempCgroupMount<'a> {
    fn new(syscall: &'a dyn Syscall, base: &Path) -> Result<Self> {
        let path = unistd::mkdtemp(&base.join("containerXXXXXX"))
            .map_err(CgroupSetupError::TempDir)?;
        Ok(Self {
            syscall,
            path,
            mounted: false,
        })
    }

    fn mount(&mut self, fstype: &str, data: Option<&str>) -> Result<()> {
        self.syscall.mount(
            Some(Path::new("cgroup")),
            &self.path,
            Some(fstype),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            data,
        )?;
        self.mounted = true;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempCgroupMount<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = self.syscall.umount2(&self.path, MntFlags::empty()) {
                tracing::warn!(?err, path = ?self.path, "failed to unmount temporary cgroup tree");
            }
        }
        if let Err(err) = fs::remove_dir(&self.path) {
            tracing::debug!(?err, path = ?self.path, "failed to remove temporary mount point");
        }
    }
}

/// Removes a cgroup subtree bottom up. Only directories are touched; the
/// control files inside vanish with them.
fn remove_cgroup_tree(path: &Path) {
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                remove_cgroup_tree(&entry.path());
            }
        }
    }
    if let Err(err) = fs::remove_dir(path) {
        tracing::trace!(?err, ?path, "could not remove stale cgroup");
    }
}

/// Places the container's processes on the host cgroup tree.
pub struct CgroupSync {
    syscall: Box<dyn Syscall>,
    tmp_base: PathBuf,
}

impl Default for CgroupSync {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupSync {
    pub fn new() -> Self {
        Self::with_syscall(create_syscall(), DEFAULT_TMP_BASE)
    }

    pub fn with_syscall<P: Into<PathBuf>>(syscall: Box<dyn Syscall>, tmp_base: P) -> Self {
        Self {
            syscall,
            tmp_base: tmp_base.into(),
        }
    }

    pub fn syscall(&self) -> &dyn Syscall {
        self.syscall.as_ref()
    }

    /// Mirrors the systemd cgroup of `pid` into the hierarchy the container
    /// expects but the host does not track it in. Nothing happens when host
    /// and container agree on where systemd lives.
    pub fn sync(
        &self,
        registry: &mut HierarchyRegistry,
        pid: Pid,
        outer: CgroupVersion,
        inner: CgroupVersion,
        uid_shift: Option<UidShift>,
    ) -> Result<()> {
        if outer.systemd_on_unified() == inner.systemd_on_unified() {
            return Ok(());
        }

        let hierarchy = registry.systemd_hierarchy()?;
        let cgroup = registry.pid_cgroup(Some(pid), hierarchy)?;
        tracing::debug!(%pid, %cgroup, %outer, %inner, "syncing systemd cgroup");

        let mut tree = TempCgroupMount::new(self.syscall.as_ref(), &self.tmp_base)?;
        if outer.systemd_on_unified() {
            tree.mount("cgroup", Some("none,name=systemd,xattr"))?;
        } else {
            tree.mount("cgroup2", None)?;
        }

        let target = tree
            .path()
            .to_path_buf()
            .join_safely(cgroup.path())
            .map_err(CgroupError::from)?;
        // a launcher that died abruptly leaves its subtree behind
        remove_cgroup_tree(&target);
        fs::create_dir_all(&target).map_err(|source| CgroupSetupError::Io {
            path: target.clone(),
            source,
        })?;
        write_cgroup_file(target.join(CGROUP_PROCS), pid).map_err(CgroupError::from)?;

        if let Some(shift) = uid_shift {
            self.chown_tree(&target, &shift);
        }
        Ok(())
    }

    /// On a unified host the launcher and the payload may not share an inner
    /// cgroup, so both move into children of it. Returns whether the split
    /// happened; it is skipped when anything else lives in the cgroup.
    pub fn split_payload(&self, registry: &mut HierarchyRegistry, pid: Pid) -> Result<bool> {
        let own = registry.pid_cgroup(None, HierarchyId::UNIFIED)?;
        let path = registry.filepath(&own)?;
        let me = unistd::getpid();

        let members = read_cgroup_procs(&path).map_err(CgroupError::from)?;
        if members.len() != 2 || !members.contains(&me) || !members.contains(&pid) {
            tracing::debug!(cgroup = %own, ?members, "not splitting shared cgroup");
            return Ok(false);
        }

        let payload = path.join(PAYLOAD_CGROUP);
        let supervisor = path.join(SUPERVISOR_CGROUP);
        create_cgroup_dir(&payload).map_err(CgroupError::from)?;
        create_cgroup_dir(&supervisor).map_err(CgroupError::from)?;
        write_cgroup_file(payload.join(CGROUP_PROCS), pid).map_err(CgroupError::from)?;
        write_cgroup_file(supervisor.join(CGROUP_PROCS), me).map_err(CgroupError::from)?;
        tracing::debug!(cgroup = %own, %pid, "moved payload and supervisor apart");

        self.enable_controllers(&path);
        registry.flush();
        Ok(true)
    }

    fn enable_controllers(&self, path: &Path) {
        let available = match read_cgroup_file(path.join(CGROUP_CONTROLLERS)) {
            Ok(available) => available,
            Err(err) => {
                tracing::warn!(?err, ?path, "failed to read available controllers");
                return;
            }
        };

        for controller in available.split_whitespace() {
            if let Err(err) =
                write_cgroup_file(path.join(CGROUP_SUBTREE_CONTROL), format!("+{controller}"))
            {
                tracing::warn!(?err, controller, "failed to enable controller for payload");
            }
        }
    }

    /// Hands the cgroup at `path` to the container's root user. Missing
    /// files are expected, other failures only get logged.
    pub fn chown_tree(&self, path: &Path, shift: &UidShift) {
        if shift.shift == 0 {
            return;
        }

        let uid = Uid::from_raw(shift.shift);
        let gid = Gid::from_raw(shift.shift);
        for file in CHOWN_FILES {
            let target = path.join(file);
            match self.syscall.chown(&target, Some(uid), Some(gid)) {
                Ok(()) => {}
                Err(err) if err.errno() == Some(Errno::ENOENT) => {
                    tracing::debug!(path = ?target, "not chowning missing cgroup file");
                }
                Err(err) => {
                    tracing::warn!(?err, path = ?target, "failed to chown cgroup file");
                }
            }
        }
    }

    /// Chowns the cgroup `pid` ended up in. A hybrid container also owns its
    /// `name=systemd` cgroup.
    pub fn chown_cgroup(
        &self,
        registry: &mut HierarchyRegistry,
        pid: Pid,
        inner: CgroupVersion,
        uid_shift: Option<UidShift>,
    ) -> Result<()> {
        let shift = match uid_shift {
            Some(shift) if shift.shift != 0 => shift,
            _ => return Ok(()),
        };

        let hierarchy = registry.systemd_hierarchy()?;
        let cgroup = registry.pid_cgroup(Some(pid), hierarchy)?;
        let path = registry.filepath(&cgroup)?;
        self.chown_tree(&path, &shift);

        if inner == CgroupVersion::HybridLegacy {
            let id = registry.get_v1_hierarchy("name=systemd")?.id;
            let cgroup = registry.pid_cgroup(Some(pid), id)?;
            let path = registry.filepath(&cgroup)?;
            self.chown_tree(&path, &shift);
        }
        Ok(())
    }

    /// The full placement step run once the payload's pid is known.
    pub fn sync_and_split(
        &self,
        registry: &mut HierarchyRegistry,
        pid: Pid,
        outer: CgroupVersion,
        inner: CgroupVersion,
        uid_shift: Option<UidShift>,
    ) -> Result<()> {
        self.sync(registry, pid, outer, inner, uid_shift)?;

        if outer == CgroupVersion::All && inner == CgroupVersion::All {
            self.split_payload(registry, pid)?;
        }

        registry.flush();
        self.chown_cgroup(registry, pid, inner, uid_shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        syscall::test::{mount_failed, ArgName, TestHelperSyscall},
        test_utils::create_cgroup_tree,
    };
    use anyhow::Result;
    use libcgtree::host::{FsKind, TestHost};
    use nix::unistd::getpid;

    const PAYLOAD_PID: i32 = 4242;

    fn helper(sync: &CgroupSync) -> &TestHelperSyscall {
        sync.syscall()
            .as_any()
            .downcast_ref::<TestHelperSyscall>()
            .unwrap()
    }

    fn shift() -> Option<UidShift> {
        Some(UidShift {
            shift: 0x10000,
            range: 0x10000,
        })
    }

    /// A unified host whose cgroup root is `root`; the launcher lives in
    /// `/machine.slice/c.scope`.
    fn unified_registry(root: &Path) -> HierarchyRegistry {
        let host = TestHost::new()
            .with_filesystem(root, FsKind::Cgroup2)
            .with_proc_cgroup(0, "0::/machine.slice/c.scope\n")
            .with_proc_cgroup(1, "0::/init.scope\n")
            .with_proc_cgroup(PAYLOAD_PID, "0::/machine.slice/c.scope\n");
        HierarchyRegistry::with_root(Box::new(host), root)
    }

    fn occupy(root: &Path, pids: &[i32]) -> Result<PathBuf> {
        let procs: String = pids.iter().map(|p| format!("{p}\n")).collect();
        let cgroup = root.join("machine.slice/c.scope");
        create_cgroup_tree(
            &cgroup,
            &[
                (CGROUP_PROCS, &procs),
                (CGROUP_CONTROLLERS, "cpu memory pids"),
                (CGROUP_SUBTREE_CONTROL, ""),
                ("payload/cgroup.procs", ""),
                ("supervisor/cgroup.procs", ""),
            ],
        )?;
        Ok(cgroup)
    }

    #[test]
    fn test_sync_is_noop_for_matching_versions() -> Result<()> {
        use CgroupVersion::*;
        let tmp = tempfile::tempdir()?;
        let mut registry = unified_registry(tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());
        let pid = Pid::from_raw(PAYLOAD_PID);

        for (outer, inner) in [
            (None, None),
            (SystemdOnly, All),
            (HybridLegacy, SystemdOnly),
            (All, HybridLegacy),
            (All, All),
        ] {
            sync.sync(&mut registry, pid, outer, inner, shift())?;
        }

        assert!(helper(&sync).get_mount_args().is_empty());
        assert!(helper(&sync).get_chown_args().is_empty());
        Ok(())
    }

    #[test]
    fn test_sync_unmounts_after_failed_placement() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut registry = unified_registry(tmp.path());
        let base = tempfile::tempdir()?;
        let sync = CgroupSync::with_syscall(create_syscall(), base.path());

        // nothing is really mounted, so writing cgroup.procs has to fail
        let result = sync.sync(
            &mut registry,
            Pid::from_raw(PAYLOAD_PID),
            CgroupVersion::All,
            CgroupVersion::None,
            shift(),
        );
        assert!(matches!(result, Err(CgroupSetupError::Cgroup(_))));

        let mounts = helper(&sync).get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype.as_deref(), Some("cgroup"));
        assert_eq!(mounts[0].data.as_deref(), Some("none,name=systemd,xattr"));
        assert_eq!(helper(&sync).get_umount_args(), vec![mounts[0].target.clone()]);
        assert!(helper(&sync).get_chown_args().is_empty());
        Ok(())
    }

    #[test]
    fn test_sync_mounts_unified_for_legacy_host() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let host = TestHost::new()
            .with_filesystem(tmp.path().join("systemd"), FsKind::Cgroup1)
            .with_proc_cgroup(0, "1:name=systemd:/machine.slice/c.scope\n0::/\n")
            .with_proc_cgroup(1, "1:name=systemd:/init.scope\n0::/\n")
            .with_proc_cgroup(PAYLOAD_PID, "1:name=systemd:/machine.slice/c.scope\n0::/\n");
        let mut registry = HierarchyRegistry::with_root(Box::new(host), tmp.path());
        let base = tempfile::tempdir()?;
        let sync = CgroupSync::with_syscall(create_syscall(), base.path());

        let result = sync.sync(
            &mut registry,
            Pid::from_raw(PAYLOAD_PID),
            CgroupVersion::None,
            CgroupVersion::All,
            None,
        );
        assert!(result.is_err());

        let mounts = helper(&sync).get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype.as_deref(), Some("cgroup2"));
        assert_eq!(mounts[0].data, None);
        assert_eq!(helper(&sync).get_umount_args().len(), 1);
        Ok(())
    }

    #[test]
    fn test_sync_mount_failure_leaves_no_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut registry = unified_registry(tmp.path());
        let base = tempfile::tempdir()?;
        let sync = CgroupSync::with_syscall(create_syscall(), base.path());
        helper(&sync).set_ret_err(ArgName::Mount, mount_failed);

        let result = sync.sync(
            &mut registry,
            Pid::from_raw(PAYLOAD_PID),
            CgroupVersion::All,
            CgroupVersion::None,
            None,
        );
        assert!(matches!(result, Err(CgroupSetupError::Syscall(_))));
        assert!(helper(&sync).get_umount_args().is_empty());
        assert_eq!(fs::read_dir(base.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_split_with_one_occupant() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let me = getpid().as_raw();
        let cgroup = occupy(tmp.path(), &[me])?;
        let mut registry = unified_registry(tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());

        assert!(!sync.split_payload(&mut registry, Pid::from_raw(PAYLOAD_PID))?);
        assert_eq!(fs::read_to_string(cgroup.join("payload/cgroup.procs"))?, "");
        Ok(())
    }

    #[test]
    fn test_split_with_self_and_payload() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let me = getpid().as_raw();
        let cgroup = occupy(tmp.path(), &[me, PAYLOAD_PID])?;
        let mut registry = unified_registry(tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());

        assert!(sync.split_payload(&mut registry, Pid::from_raw(PAYLOAD_PID))?);
        assert_eq!(
            fs::read_to_string(cgroup.join("payload/cgroup.procs"))?,
            PAYLOAD_PID.to_string()
        );
        assert_eq!(
            fs::read_to_string(cgroup.join("supervisor/cgroup.procs"))?,
            me.to_string()
        );
        // each write lands at the start of the fake control file
        let subtree = fs::read_to_string(cgroup.join(CGROUP_SUBTREE_CONTROL))?;
        assert!(subtree.starts_with('+'));
        Ok(())
    }

    #[test]
    fn test_split_with_two_strangers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cgroup = occupy(tmp.path(), &[PAYLOAD_PID, PAYLOAD_PID + 1])?;
        let mut registry = unified_registry(tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());

        assert!(!sync.split_payload(&mut registry, Pid::from_raw(PAYLOAD_PID))?);
        assert_eq!(fs::read_to_string(cgroup.join("payload/cgroup.procs"))?, "");
        Ok(())
    }

    #[test]
    fn test_split_with_three_occupants() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let me = getpid().as_raw();
        let cgroup = occupy(tmp.path(), &[me, PAYLOAD_PID, PAYLOAD_PID + 1])?;
        let mut registry = unified_registry(tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());

        assert!(!sync.split_payload(&mut registry, Pid::from_raw(PAYLOAD_PID))?);
        assert_eq!(fs::read_to_string(cgroup.join("supervisor/cgroup.procs"))?, "");
        Ok(())
    }

    #[test]
    fn test_chown_tree_tolerates_missing_files() -> Result<()> {
        let sync = CgroupSync::with_syscall(create_syscall(), "/tmp");
        helper(&sync).set_ret_err(ArgName::Chown, chown_missing);
        helper(&sync).set_ret_err_times(ArgName::Chown, 3);
        let path = Path::new("/sys/fs/cgroup/machine.slice/c.scope");

        sync.chown_tree(path, &shift().unwrap());

        let got = helper(&sync).get_chown_args();
        assert_eq!(got.len(), CHOWN_FILES.len() - 3);
        assert!(got.iter().all(|c| c.owner == Some(Uid::from_raw(0x10000))
            && c.group == Some(Gid::from_raw(0x10000))));
        assert_eq!(got.last().unwrap().path, path.join("tasks"));
        Ok(())
    }

    #[test]
    fn test_chown_tree_skips_zero_shift() {
        let sync = CgroupSync::with_syscall(create_syscall(), "/tmp");
        sync.chown_tree(
            Path::new("/sys/fs/cgroup"),
            &UidShift {
                shift: 0,
                range: 0x10000,
            },
        );
        assert!(helper(&sync).get_chown_args().is_empty());
    }

    #[test]
    fn test_sync_and_split_chowns_payload_cgroup() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let me = getpid().as_raw();
        occupy(tmp.path(), &[me, PAYLOAD_PID])?;
        let host = TestHost::new()
            .with_filesystem(tmp.path(), FsKind::Cgroup2)
            .with_proc_cgroup(0, "0::/machine.slice/c.scope\n")
            .with_proc_cgroup(1, "0::/init.scope\n")
            .with_proc_cgroup(PAYLOAD_PID, "0::/machine.slice/c.scope/payload\n");
        let mut registry = HierarchyRegistry::with_root(Box::new(host), tmp.path());
        let sync = CgroupSync::with_syscall(create_syscall(), tmp.path());

        sync.sync_and_split(
            &mut registry,
            Pid::from_raw(PAYLOAD_PID),
            CgroupVersion::All,
            CgroupVersion::All,
            shift(),
        )?;

        assert!(helper(&sync).get_mount_args().is_empty());
        let chowned = helper(&sync).get_chown_args();
        assert_eq!(chowned.len(), CHOWN_FILES.len());
        assert_eq!(chowned[0].path, tmp.path().join("machine.slice/c.scope/payload/."));
        Ok(())
    }

    fn chown_missing() -> std::result::Result<(), crate::syscall::SyscallError> {
        Err(crate::syscall::SyscallError::ChownFailed {
            path: PathBuf::from("/"),
            owner: None,
            group: None,
            errno: Errno::ENOENT,
        })
    }
}
