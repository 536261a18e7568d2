use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;

use crate::{
    common::{normalize_cgroup_path, PathBufExt, DEFAULT_CGROUP_ROOT},
    error::{CgroupError, Result},
    host::{create_host, CgroupHost, FsKind},
    version::CgroupVersion,
};

const SYSTEMD_SELECTOR: &str = "name=systemd";
const ROOT_SUFFIXES: &[&str] = &["/init.scope", "/system.slice", "/system"];

/// Kernel hierarchy id. `0` is the unified hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HierarchyId(pub u32);

impl HierarchyId {
    pub const UNIFIED: HierarchyId = HierarchyId(0);

    pub fn is_unified(self) -> bool {
        self == Self::UNIFIED
    }
}

impl Display for HierarchyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    pub id: HierarchyId,
    /// Comma separated controller list, empty for the unified hierarchy.
    pub controllers: String,
    /// Where the hierarchy is mounted, if it could be located.
    pub mountpoint: Option<PathBuf>,
}

impl Hierarchy {
    pub fn controllers(&self) -> impl Iterator<Item = &str> {
        self.controllers.split(',').filter(|c| !c.is_empty())
    }

    /// Exact token match against the controller list.
    pub fn has_controller(&self, selector: &str) -> bool {
        self.controllers().any(|c| c == selector)
    }

    /// Directory name of a v1 hierarchy below the cgroup root: the controller
    /// list with any `name=` prefix removed.
    pub fn dirname(&self) -> &str {
        self.controllers
            .strip_prefix("name=")
            .unwrap_or(&self.controllers)
    }

    fn primary_controller(&self) -> &str {
        let first = self.controllers().next().unwrap_or_default();
        first.strip_prefix("name=").unwrap_or(first)
    }
}

/// A path inside one hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CgroupRef {
    hierarchy: HierarchyId,
    path: String,
}

impl CgroupRef {
    pub fn new<S: AsRef<str>>(hierarchy: HierarchyId, path: S) -> Self {
        Self {
            hierarchy,
            path: normalize_cgroup_path(path.as_ref()),
        }
    }

    pub fn hierarchy(&self) -> HierarchyId {
        self.hierarchy
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The cgroup `name` below this one.
    pub fn child(&self, name: &str) -> CgroupRef {
        CgroupRef::new(self.hierarchy, format!("{}/{}", self.path, name))
    }
}

impl Display for CgroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hierarchy, self.path)
    }
}

/// A cgroup expressed relative to a prefix cgroup, usually the root systemd
/// places units under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedCgroupRef {
    pub prefix: CgroupRef,
    pub suffix: String,
}

impl ScopedCgroupRef {
    pub fn cgroup(&self) -> CgroupRef {
        CgroupRef::new(
            self.prefix.hierarchy,
            format!("{}{}", self.prefix.path, self.suffix),
        )
    }
}

/// Output slot for [`HierarchyRegistry::pid_cgroups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupSlot {
    pub hierarchy: HierarchyId,
    pub cgroup: Option<CgroupRef>,
}

impl CgroupSlot {
    pub fn new(hierarchy: HierarchyId) -> Self {
        Self {
            hierarchy,
            cgroup: None,
        }
    }
}

struct ProcCgroupLine<'a> {
    id: HierarchyId,
    controllers: &'a str,
    path: &'a str,
}

fn parse_line(line: &str) -> Option<ProcCgroupLine<'_>> {
    let mut parts = line.splitn(3, ':');
    let (id, controllers, path) = (parts.next()?, parts.next()?, parts.next()?);
    let id = id.parse::<u32>().ok()?;
    if (id == 0) != controllers.is_empty() {
        return None;
    }
    Some(ProcCgroupLine {
        id: HierarchyId(id),
        controllers,
        path,
    })
}

/// Process local model of the host cgroup hierarchies. Everything is read
/// lazily and cached until [`HierarchyRegistry::flush`].
pub struct HierarchyRegistry {
    host: Box<dyn CgroupHost>,
    root: PathBuf,
    hierarchies: Option<Vec<Hierarchy>>,
    version: Option<CgroupVersion>,
    systemd_root: Option<CgroupRef>,
}

impl Default for HierarchyRegistry {
    fn default() -> Self {
        Self::new(create_host())
    }
}

impl HierarchyRegistry {
    pub fn new(host: Box<dyn CgroupHost>) -> Self {
        Self::with_root(host, DEFAULT_CGROUP_ROOT)
    }

    pub fn with_root<P: Into<PathBuf>>(host: Box<dyn CgroupHost>, root: P) -> Self {
        Self {
            host,
            root: root.into(),
            hierarchies: None,
            version: None,
            systemd_root: None,
        }
    }

    pub fn host(&self) -> &dyn CgroupHost {
        self.host.as_ref()
    }

    /// Directory the host mounts its cgroup hierarchies under.
    pub fn cgroup_root(&self) -> &Path {
        &self.root
    }

    pub fn cgroup_ns_supported(&self) -> bool {
        self.host.cgroup_ns_supported()
    }

    /// Drops every cached fact. Needed after the calling process moved to
    /// another cgroup.
    pub fn flush(&mut self) {
        self.hierarchies = None;
        self.version = None;
        self.systemd_root = None;
    }

    fn read_proc_cgroup(&self, pid: Option<Pid>) -> Result<String> {
        self.host.proc_cgroup(pid).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CgroupError::NotFound(match pid {
                Some(pid) => format!("process {pid} has no cgroup file"),
                None => "/proc/self/cgroup is missing".to_owned(),
            }),
            _ => CgroupError::StdIo(err),
        })
    }

    /// Reads the hierarchy table of the calling process.
    pub fn init(&mut self) -> Result<()> {
        if self.hierarchies.is_some() {
            return Ok(());
        }

        let content = self.read_proc_cgroup(None)?;
        let mut hierarchies: Vec<Hierarchy> = Vec::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            let parsed = parse_line(line)
                .ok_or_else(|| CgroupError::DataCorrupt(format!("bad cgroup line {line:?}")))?;
            if hierarchies.iter().any(|h| h.id == parsed.id) {
                return Err(CgroupError::DataCorrupt(format!(
                    "hierarchy {} listed twice",
                    parsed.id
                )));
            }

            let mut hierarchy = Hierarchy {
                id: parsed.id,
                controllers: parsed.controllers.to_owned(),
                mountpoint: None,
            };
            hierarchy.mountpoint = self.resolve_mountpoint(&hierarchy)?;
            hierarchies.push(hierarchy);
        }
        hierarchies.sort_by_key(|h| h.id);

        tracing::debug!(count = hierarchies.len(), "cgroup hierarchies loaded");
        self.hierarchies = Some(hierarchies);
        Ok(())
    }

    fn resolve_mountpoint(&self, hierarchy: &Hierarchy) -> Result<Option<PathBuf>> {
        if hierarchy.id.is_unified() {
            if matches!(self.host.filesystem(&self.root), Ok(FsKind::Cgroup2)) {
                return Ok(Some(self.root.clone()));
            }
            let candidates = match self.host.subdirectories(&self.root) {
                Ok(candidates) => candidates,
                Err(err) => {
                    tracing::debug!(?err, root = ?self.root, "cannot list cgroup root");
                    return Ok(None);
                }
            };
            for candidate in candidates {
                if matches!(self.host.filesystem(&candidate), Ok(FsKind::Cgroup2)) {
                    return Ok(Some(self.host.canonicalize(&candidate)?));
                }
            }
            tracing::debug!("unified hierarchy is not mounted");
            return Ok(None);
        }

        let path = self.root.join(hierarchy.primary_controller());
        match self.host.canonicalize(&path) {
            Ok(mountpoint) => Ok(Some(mountpoint)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(?path, hierarchy = %hierarchy.id, "hierarchy is not mounted");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn hierarchies(&mut self) -> Result<&[Hierarchy]> {
        self.init()?;
        Ok(self.hierarchies.as_deref().unwrap_or_default())
    }

    pub fn hierarchy(&mut self, id: HierarchyId) -> Result<&Hierarchy> {
        self.hierarchies()?
            .iter()
            .find(|h| h.id == id)
            .ok_or_else(|| CgroupError::NotFound(format!("hierarchy {id}")))
    }

    /// Finds the v1 hierarchy carrying `selector`, e.g. `cpu` or
    /// `name=systemd`.
    pub fn get_v1_hierarchy(&mut self, selector: &str) -> Result<&Hierarchy> {
        self.hierarchies()?
            .iter()
            .find(|h| !h.id.is_unified() && h.has_controller(selector))
            .ok_or_else(|| CgroupError::NotFound(format!("no hierarchy for {selector}")))
    }

    pub fn get_v2_hierarchy(&mut self) -> Result<&Hierarchy> {
        self.hierarchy(HierarchyId::UNIFIED)
    }

    /// Fills each slot with the cgroup `pid` has in that slot's hierarchy and
    /// returns how many slots matched. `None` reads the calling process.
    pub fn pid_cgroups(&mut self, pid: Option<Pid>, slots: &mut [CgroupSlot]) -> Result<usize> {
        self.init()?;
        let content = self.read_proc_cgroup(pid)?;

        let mut matched = 0;
        for line in content.lines().filter(|l| !l.is_empty()) {
            let parsed = parse_line(line)
                .ok_or_else(|| CgroupError::DataCorrupt(format!("bad cgroup line {line:?}")))?;
            for slot in slots.iter_mut().filter(|s| s.hierarchy == parsed.id) {
                slot.cgroup = Some(CgroupRef::new(parsed.id, parsed.path));
                matched += 1;
            }
        }
        Ok(matched)
    }

    pub fn pid_cgroup(&mut self, pid: Option<Pid>, hierarchy: HierarchyId) -> Result<CgroupRef> {
        let mut slots = [CgroupSlot::new(hierarchy)];
        self.pid_cgroups(pid, &mut slots)?;
        let [slot] = slots;
        slot.cgroup.ok_or_else(|| {
            CgroupError::NotFound(format!("process is not in hierarchy {hierarchy}"))
        })
    }

    /// Absolute path of a cgroup directory on the host.
    pub fn filepath(&mut self, cgroup: &CgroupRef) -> Result<PathBuf> {
        let hierarchy = self.hierarchy(cgroup.hierarchy())?;
        let mountpoint = hierarchy
            .mountpoint
            .as_ref()
            .ok_or_else(|| CgroupError::NotFound(format!("hierarchy {} is not mounted", hierarchy.id)))?;
        Ok(mountpoint.join_safely(cgroup.path())?)
    }

    /// Detects which cgroup layout the host runs.
    pub fn detect_version(&mut self) -> Result<CgroupVersion> {
        if let Some(version) = self.version {
            return Ok(version);
        }

        let version = match self.probe_version() {
            Some(version) => version,
            None => self.version_from_table()?,
        };
        tracing::debug!(%version, "detected host cgroup version");
        self.version = Some(version);
        Ok(version)
    }

    fn probe_version(&self) -> Option<CgroupVersion> {
        let fs = |sub: &str| {
            let path = if sub.is_empty() {
                self.root.clone()
            } else {
                self.root.join(sub)
            };
            self.host.filesystem(&path).ok()
        };

        if fs("") == Some(FsKind::Cgroup2) {
            return Some(CgroupVersion::All);
        }
        if fs("unified") == Some(FsKind::Cgroup2) {
            return Some(CgroupVersion::HybridLegacy);
        }
        match fs("systemd") {
            Some(FsKind::Cgroup2) => Some(CgroupVersion::SystemdOnly),
            Some(FsKind::Cgroup1) => Some(CgroupVersion::None),
            _ => None,
        }
    }

    fn version_from_table(&mut self) -> Result<CgroupVersion> {
        let hierarchies = self.hierarchies()?;
        let unified = hierarchies.iter().any(|h| h.id.is_unified());
        let named_systemd = hierarchies
            .iter()
            .any(|h| !h.id.is_unified() && h.has_controller(SYSTEMD_SELECTOR));
        let legacy = hierarchies.iter().any(|h| !h.id.is_unified());

        match (unified, named_systemd, legacy) {
            (true, _, false) => Ok(CgroupVersion::All),
            (true, true, true) => Ok(CgroupVersion::HybridLegacy),
            (true, false, true) => Ok(CgroupVersion::SystemdOnly),
            (false, true, _) => Ok(CgroupVersion::None),
            (false, false, _) => Err(CgroupError::Unsupported(
                "no systemd cgroup hierarchy found".to_owned(),
            )),
        }
    }

    /// The hierarchy systemd tracks processes in.
    pub fn systemd_hierarchy(&mut self) -> Result<HierarchyId> {
        if self.detect_version()? == CgroupVersion::None {
            Ok(self.get_v1_hierarchy(SYSTEMD_SELECTOR)?.id)
        } else {
            Ok(self.get_v2_hierarchy()?.id)
        }
    }

    /// The cgroup systemd places units under, derived from where PID 1 lives.
    pub fn systemd_root(&mut self) -> Result<CgroupRef> {
        if let Some(root) = &self.systemd_root {
            return Ok(root.clone());
        }

        let hierarchy = self.systemd_hierarchy()?;
        let init = self.pid_cgroup(Some(Pid::from_raw(1)), hierarchy)?;
        let path = ROOT_SUFFIXES
            .iter()
            .find_map(|suffix| init.path().strip_suffix(suffix))
            .unwrap_or(init.path());
        // "/init.scope" leaves an empty path, which means the whole hierarchy
        let root = CgroupRef::new(hierarchy, path);

        self.systemd_root = Some(root.clone());
        Ok(root)
    }

    /// The systemd cgroup of `pid` relative to [`Self::systemd_root`].
    pub fn pid_systemd_cgroup(&mut self, pid: Option<Pid>) -> Result<ScopedCgroupRef> {
        let root = self.systemd_root()?;
        let mine = self.pid_cgroup(pid, root.hierarchy())?;

        let suffix = if root.path() == "/" {
            mine.path()
        } else {
            mine.path()
                .strip_prefix(root.path())
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .ok_or_else(|| {
                    CgroupError::InvalidPath(format!(
                        "{} is outside of the systemd root {}",
                        mine.path(),
                        root.path()
                    ))
                })?
        };

        Ok(ScopedCgroupRef {
            suffix: suffix.to_owned(),
            prefix: root,
        })
    }
}
