use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// How much of the cgroup tree lives on the unified hierarchy. The variants
/// are ordered: a larger value means more of the tree is unified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CgroupVersion {
    /// Everything, including the systemd hierarchy, is legacy v1.
    None,
    /// systemd tracks processes on cgroup2, controllers stay on v1.
    SystemdOnly,
    /// Legacy layout with an additional cgroup2 tree mounted at `unified`.
    HybridLegacy,
    /// Pure cgroup2.
    All,
}

impl CgroupVersion {
    /// Whether systemd's own process tracking uses the unified hierarchy.
    pub fn systemd_on_unified(self) -> bool {
        self >= CgroupVersion::SystemdOnly
    }
}

impl Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CgroupVersion::None => "legacy",
            CgroupVersion::SystemdOnly => "systemd",
            CgroupVersion::HybridLegacy => "hybrid",
            CgroupVersion::All => "unified",
        };
        write!(f, "{s}")
    }
}

/// The version a container asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestedVersion {
    /// Mirror whatever the host has mounted.
    #[default]
    Inherit,
    Exact(CgroupVersion),
}

impl RequestedVersion {
    /// The version the container ends up with on a host running `outer`.
    pub fn resolve(self, outer: CgroupVersion) -> CgroupVersion {
        match self {
            RequestedVersion::Inherit => outer,
            RequestedVersion::Exact(version) => version,
        }
    }
}

impl From<CgroupVersion> for RequestedVersion {
    fn from(version: CgroupVersion) -> Self {
        RequestedVersion::Exact(version)
    }
}
