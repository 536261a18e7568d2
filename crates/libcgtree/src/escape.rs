//! Escaping of cgroup path segments and classification of unit names.
//!
//! A cgroup directory may not be named like a kernel control file, so names
//! that could collide get a single leading `_`.

/// The slice every unit lives under when no other slice is named.
pub const ROOT_SLICE: &str = "-.slice";

const UNIT_NAME_MAX: usize = 256;
const VALID_UNIT_CHARS: &str = ":-_.\\";
const UNIT_SUFFIXES: &[&str] = &[
    "service",
    "socket",
    "device",
    "mount",
    "automount",
    "swap",
    "target",
    "path",
    "timer",
    "slice",
    "scope",
];
const CONTROLLERS: &[&str] = &[
    "cpu", "cpuacct", "cpuset", "io", "blkio", "memory", "devices", "pids", "bpf-firewall",
    "bpf-devices", "freezer", "net_cls", "net_prio", "perf_event", "hugetlb", "rdma", "misc",
];
const RESERVED_FILES: &[&str] = &["notify_on_release", "release_agent", "tasks"];

/// Returns `name` in the form it must take as a cgroup directory.
pub fn escape(name: &str) -> String {
    if needs_escape(name) {
        format!("_{name}")
    } else {
        name.to_owned()
    }
}

fn needs_escape(name: &str) -> bool {
    if name.starts_with('_') || name.starts_with('.') {
        return true;
    }
    if RESERVED_FILES.contains(&name) || name.starts_with("cgroup.") {
        return true;
    }
    // controller attribute files are `<controller>.<attribute>`, split at the last dot
    if let Some((head, _)) = name.rsplit_once('.') {
        return CONTROLLERS.contains(&head);
    }
    false
}

/// Strips the escape marker added by [`escape`]. Names without a marker are
/// returned untouched.
pub fn unescape(name: &str) -> &str {
    name.strip_prefix('_').unwrap_or(name)
}

/// Whether `candidate` names a slice unit, accepting the escaped form.
pub fn is_valid_slice_name(candidate: &str) -> bool {
    if candidate.len() < "x.slice".len() || !candidate.ends_with(".slice") {
        return false;
    }
    is_valid_plain_unit_name(unescape(candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitForm {
    Plain,
    Instance,
}

fn classify_unit_name(name: &str) -> Option<UnitForm> {
    if name.is_empty() || name.len() > UNIT_NAME_MAX {
        return None;
    }
    let (stem, suffix) = name.rsplit_once('.')?;
    if !UNIT_SUFFIXES.contains(&suffix) || stem.is_empty() {
        return None;
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '@' || VALID_UNIT_CHARS.contains(c))
    {
        return None;
    }

    match stem.split_once('@') {
        None => Some(UnitForm::Plain),
        Some((prefix, instance)) => {
            if prefix.is_empty() || instance.is_empty() || instance.contains('@') {
                None
            } else {
                Some(UnitForm::Instance)
            }
        }
    }
}

pub fn is_valid_plain_unit_name(name: &str) -> bool {
    classify_unit_name(name) == Some(UnitForm::Plain)
}

/// Accepts `foo.service` and `foo@bar.service`, rejects templates such as
/// `foo@.service`.
pub fn is_valid_unit_name(name: &str) -> bool {
    classify_unit_name(name).is_some()
}
