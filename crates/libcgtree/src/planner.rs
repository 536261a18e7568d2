//! Works out which mounts make up `/sys/fs/cgroup` inside a container.
//!
//! Destinations are relative to the container's cgroup root; an empty
//! destination is the root itself.

use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::{CgroupError, Result},
    hierarchy::HierarchyRegistry,
    version::{CgroupVersion, RequestedVersion},
};

const SYSTEMD_SELECTOR: &str = "name=systemd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAction {
    /// Symlink `link` pointing at `target`, both relative to the root.
    Symlink { target: String, link: String },
    Tmpfs { options: String, dst: String },
    CgroupV1 { options: String, dst: String },
    CgroupV2 { options: String, dst: String },
}

impl MountAction {
    pub fn dst(&self) -> &str {
        match self {
            MountAction::Symlink { link, .. } => link,
            MountAction::Tmpfs { dst, .. }
            | MountAction::CgroupV1 { dst, .. }
            | MountAction::CgroupV2 { dst, .. } => dst,
        }
    }

    fn symlink(target: &str, link: &str) -> Self {
        MountAction::Symlink {
            target: target.to_owned(),
            link: link.to_owned(),
        }
    }

    fn tmpfs(options: &str, dst: &str) -> Self {
        MountAction::Tmpfs {
            options: options.to_owned(),
            dst: dst.to_owned(),
        }
    }

    fn cgroup_v1(options: &str, dst: &str) -> Self {
        MountAction::CgroupV1 {
            options: options.to_owned(),
            dst: dst.to_owned(),
        }
    }

    fn cgroup_v2(options: &str, dst: &str) -> Self {
        MountAction::CgroupV2 {
            options: options.to_owned(),
            dst: dst.to_owned(),
        }
    }
}

impl Display for MountAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountAction::Symlink { target, link } => write!(f, "symlink {link} -> {target}"),
            MountAction::Tmpfs { options, dst } => write!(f, "tmpfs /{dst} ({options})"),
            MountAction::CgroupV1 { options, dst } => write!(f, "cgroup /{dst} ({options})"),
            MountAction::CgroupV2 { options, dst } => write!(f, "cgroup2 /{dst} ({options})"),
        }
    }
}

fn controller_dirname(controller: &str) -> &str {
    controller.strip_prefix("name=").unwrap_or(controller)
}

/// A name that can be a single directory entry.
fn is_filename(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Plans the container's cgroup tree for a host running `outer`.
pub fn plan_mounts(
    registry: &mut HierarchyRegistry,
    outer: CgroupVersion,
    inner: RequestedVersion,
    use_cgns: bool,
) -> Result<Vec<MountAction>> {
    let plan = match inner {
        RequestedVersion::Inherit => plan_inherit(registry)?,
        RequestedVersion::Exact(CgroupVersion::All) => vec![MountAction::cgroup_v2("", "")],
        RequestedVersion::Exact(inner) => plan_legacy(registry, outer, inner, use_cgns)?,
    };

    for action in &plan {
        tracing::debug!(%action, "planned cgroup mount");
    }
    Ok(plan)
}

fn plan_inherit(registry: &mut HierarchyRegistry) -> Result<Vec<MountAction>> {
    let root = registry.cgroup_root().to_path_buf();
    let host = registry.host();

    let mut tmpfs = Vec::new();
    let mut cgroups = Vec::new();
    for entry in host.mount_entries()? {
        let Ok(relative) = entry.mount_point.strip_prefix(&root) else {
            continue;
        };
        let Some(name) = relative.to_str() else {
            continue;
        };
        if !name.is_empty() && !is_filename(name) {
            continue;
        }

        match entry.fs_type.as_str() {
            "tmpfs" => tmpfs.push(MountAction::tmpfs(&entry.super_options, name)),
            "cgroup" => cgroups.push(MountAction::cgroup_v1(&entry.super_options, name)),
            "cgroup2" => {
                if !name.is_empty() && name != "systemd" {
                    return Err(CgroupError::Unsupported(format!(
                        "refusing to mirror cgroup2 hierarchy mounted at {}",
                        entry.mount_point.display()
                    )));
                }
                cgroups.push(MountAction::cgroup_v2(&entry.super_options, name));
            }
            _ => {}
        }
    }

    let mut links = Vec::new();
    for action in &tmpfs {
        let dir = root.join(action.dst());
        for (link, target) in host.symlinks(&dir)? {
            let (Some(link), Some(target)) = (link.file_name(), target.to_str()) else {
                continue;
            };
            let link = Path::new(action.dst()).join(link);
            links.push((link.to_string_lossy().into_owned(), target.to_owned()));
        }
    }

    let mut plan = tmpfs;
    for action in cgroups {
        let attached: Vec<MountAction> = match &action {
            MountAction::CgroupV1 { dst, .. } => links
                .iter()
                .filter(|(_, target)| target == dst)
                .map(|(link, target)| MountAction::symlink(target, link))
                .collect(),
            _ => Vec::new(),
        };
        plan.push(action);
        plan.extend(attached);
    }
    Ok(plan)
}

fn plan_legacy(
    registry: &mut HierarchyRegistry,
    outer: CgroupVersion,
    inner: CgroupVersion,
    use_cgns: bool,
) -> Result<Vec<MountAction>> {
    let mut plan = vec![MountAction::tmpfs("mode=755", "")];

    if outer != CgroupVersion::All {
        if use_cgns {
            plan_hierarchies(registry, &mut plan)?;
        } else {
            plan_kernel_controllers(registry, &mut plan)?;
        }
    }

    match inner {
        CgroupVersion::None => {
            plan.push(MountAction::cgroup_v1("none,name=systemd", "systemd"));
        }
        CgroupVersion::SystemdOnly => {
            plan.push(MountAction::cgroup_v2("", "systemd"));
        }
        CgroupVersion::HybridLegacy => {
            plan.push(MountAction::cgroup_v1("none,name=systemd", "systemd"));
            plan.push(MountAction::cgroup_v2("", "unified"));
        }
        CgroupVersion::All => {
            return Err(CgroupError::Unsupported(
                "a unified container needs no legacy cgroup tree".to_owned(),
            ))
        }
    }
    Ok(plan)
}

/// One mount per v1 hierarchy the calling process is a member of.
fn plan_hierarchies(registry: &mut HierarchyRegistry, plan: &mut Vec<MountAction>) -> Result<()> {
    for hierarchy in registry.hierarchies()? {
        if hierarchy.id.is_unified() || hierarchy.controllers == SYSTEMD_SELECTOR {
            continue;
        }

        let dirname = controller_dirname(&hierarchy.controllers);
        plan.push(MountAction::cgroup_v1(&hierarchy.controllers, dirname));
        for controller in hierarchy.controllers() {
            if controller == hierarchy.controllers {
                break;
            }
            plan.push(MountAction::symlink(dirname, controller_dirname(controller)));
        }
    }
    Ok(())
}

enum ControllerMount {
    Single(String),
    Combined { controller: String, combined: String },
}

/// One mount per kernel controller, folding co-mounted controllers into the
/// hierarchy their `/sys/fs/cgroup/<controller>` symlink points at.
fn plan_kernel_controllers(
    registry: &mut HierarchyRegistry,
    plan: &mut Vec<MountAction>,
) -> Result<()> {
    let root = registry.cgroup_root().to_path_buf();
    let host = registry.host();

    let mut mounts = Vec::new();
    for controller in host.kernel_controllers()? {
        let origin: PathBuf = root.join(&controller);
        match host.read_link(&origin) {
            Ok(target) => {
                let combined = target.to_string_lossy().into_owned();
                if !is_filename(&combined) {
                    tracing::warn!(?origin, %combined, "ignoring invalid combined hierarchy");
                    continue;
                }
                mounts.push(ControllerMount::Combined {
                    controller,
                    combined,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                mounts.push(ControllerMount::Single(controller));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(?origin, "controller is not mounted on the host");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut seen: Vec<&str> = Vec::new();
    for mount in &mounts {
        match mount {
            ControllerMount::Single(controller) => {
                plan.push(MountAction::cgroup_v1(controller, controller));
            }
            ControllerMount::Combined { combined, .. } => {
                if seen.contains(&combined.as_str()) {
                    continue;
                }
                seen.push(combined);
                plan.push(MountAction::cgroup_v1(combined, combined));
                for other in &mounts {
                    if let ControllerMount::Combined {
                        controller,
                        combined: target,
                    } = other
                    {
                        if target == combined {
                            plan.push(MountAction::symlink(combined, controller));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
