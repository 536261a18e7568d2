//! Model of the host cgroup tree: which hierarchies exist and where they are
//! mounted, how systemd names the cgroups inside them, and which mounts
//! recreate that tree inside a container.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod test;

pub mod common;
pub mod error;
pub mod escape;
pub mod hierarchy;
pub mod host;
pub mod planner;
pub mod resolver;
pub mod version;

pub use error::CgroupError;
pub use hierarchy::{CgroupRef, CgroupSlot, Hierarchy, HierarchyId, HierarchyRegistry, ScopedCgroupRef};
pub use planner::{plan_mounts, MountAction};
pub use version::{CgroupVersion, RequestedVersion};

/// Host cgroup version as seen by `registry`. Cached until the registry is
/// flushed.
pub fn detect_version(registry: &mut HierarchyRegistry) -> Result<CgroupVersion, CgroupError> {
    registry.detect_version()
}
