//! Splits systemd cgroup paths into slice, unit and whatever lies below the
//! unit.

use crate::{
    error::{CgroupError, Result},
    escape::{is_valid_slice_name, is_valid_unit_name, unescape, ROOT_SLICE},
    hierarchy::{CgroupRef, ScopedCgroupRef},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceUnitPath {
    /// The innermost slice, unescaped.
    pub slice: String,
    /// The unit, unescaped.
    pub unit: String,
    /// Everything below the unit, relative to the cgroup of the unit.
    pub extra: ScopedCgroupRef,
}

/// Decomposes `/a.slice/b.slice/unit.service/rest` into its parts.
pub fn parse(cgroup: &ScopedCgroupRef) -> Result<SliceUnitPath> {
    let path = cgroup.suffix.as_str();
    let mut rest = path;
    let mut slice = ROOT_SLICE;

    loop {
        let trimmed = rest.trim_start_matches('/');
        let end = trimmed.find('/').unwrap_or(trimmed.len());
        let part = &trimmed[..end];
        if !is_valid_slice_name(part) {
            break;
        }
        slice = part;
        rest = &trimmed[end..];
    }
    let slice = unescape(slice);

    let trimmed = rest.trim_start_matches('/');
    let end = trimmed.find('/').unwrap_or(trimmed.len());
    let unit = unescape(&trimmed[..end]);
    if !is_valid_unit_name(unit) {
        return Err(CgroupError::InvalidPath(format!(
            "{path:?} does not name a unit below its slices"
        )));
    }

    let extra = &trimmed[end..];
    let consumed = &path[..path.len() - extra.len()];
    Ok(SliceUnitPath {
        slice: slice.to_owned(),
        unit: unit.to_owned(),
        extra: ScopedCgroupRef {
            prefix: CgroupRef::new(
                cgroup.prefix.hierarchy(),
                format!("{}{}", cgroup.prefix.path(), consumed),
            ),
            suffix: extra.to_owned(),
        },
    })
}

/// The uid owning a cgroup below `user-<uid>.slice`.
pub fn owner_uid(cgroup: &ScopedCgroupRef) -> Result<u32> {
    let parsed = parse(cgroup)?;
    parse_user_slice(&parsed.slice)
        .ok_or_else(|| CgroupError::InvalidPath(format!("{} is not a user slice", parsed.slice)))
}

fn parse_user_slice(slice: &str) -> Option<u32> {
    let digits = slice.strip_prefix("user-")?.strip_suffix(".slice")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let uid = digits.parse::<u32>().ok()?;
    // (uid_t) -1 and the 16 bit overflow id are never real users
    if uid == u32::MAX || uid == 0xFFFF {
        return None;
    }
    Some(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyId;

    fn scoped(prefix: &str, suffix: &str) -> ScopedCgroupRef {
        ScopedCgroupRef {
            prefix: CgroupRef::new(HierarchyId::UNIFIED, prefix),
            suffix: suffix.to_owned(),
        }
    }

    #[test]
    fn test_parse_nested_slices() -> anyhow::Result<()> {
        let parsed = parse(&scoped(
            "",
            "/foo.slice/bar.slice/baz.slice/unit.service/extra/more",
        ))?;
        assert_eq!(parsed.slice, "baz.slice");
        assert_eq!(parsed.unit, "unit.service");
        assert_eq!(parsed.extra.suffix, "/extra/more");
        assert_eq!(
            parsed.extra.prefix.path(),
            "/foo.slice/bar.slice/baz.slice/unit.service"
        );
        assert_eq!(
            parsed.extra.cgroup().path(),
            "/foo.slice/bar.slice/baz.slice/unit.service/extra/more"
        );
        Ok(())
    }

    #[test]
    fn test_parse_keeps_prefix() -> anyhow::Result<()> {
        let parsed = parse(&scoped("/lxc/c1", "/machine.slice/machine-c2.scope"))?;
        assert_eq!(parsed.slice, "machine.slice");
        assert_eq!(parsed.unit, "machine-c2.scope");
        assert_eq!(parsed.extra.suffix, "");
        assert_eq!(parsed.extra.prefix.path(), "/lxc/c1/machine.slice/machine-c2.scope");
        Ok(())
    }

    #[test]
    fn test_parse_root_slice() -> anyhow::Result<()> {
        let parsed = parse(&scoped("", "/init.scope"))?;
        assert_eq!(parsed.slice, ROOT_SLICE);
        assert_eq!(parsed.unit, "init.scope");
        assert_eq!(parsed.extra.suffix, "");
        Ok(())
    }

    #[test]
    fn test_parse_escaped_components() -> anyhow::Result<()> {
        let parsed = parse(&scoped("", "/_cpu.slice/_cgroup.service/payload"))?;
        assert_eq!(parsed.slice, "cpu.slice");
        assert_eq!(parsed.unit, "cgroup.service");
        assert_eq!(parsed.extra.suffix, "/payload");
        Ok(())
    }

    #[test]
    fn test_parse_requires_unit() {
        for suffix in ["/user.slice", "/user.slice/not-a-unit", "", "/", "/foo@.service"] {
            assert!(
                matches!(parse(&scoped("", suffix)), Err(CgroupError::InvalidPath(_))),
                "{suffix:?}"
            );
        }
    }

    #[test]
    fn test_parse_instance_unit() -> anyhow::Result<()> {
        let parsed = parse(&scoped("", "/system.slice/system-getty.slice/getty@tty1.service"))?;
        assert_eq!(parsed.slice, "system-getty.slice");
        assert_eq!(parsed.unit, "getty@tty1.service");
        Ok(())
    }

    #[test]
    fn test_owner_uid() -> anyhow::Result<()> {
        let uid = owner_uid(&scoped(
            "",
            "/user.slice/user-1000.slice/session-2.scope",
        ))?;
        assert_eq!(uid, 1000);

        for suffix in [
            "/user.slice/session-2.scope",
            "/user.slice/user-.slice/session-2.scope",
            "/user.slice/user-10x0.slice/session-2.scope",
            "/user.slice/user-4294967295.slice/session-2.scope",
            "/user.slice/user-65535.slice/session-2.scope",
            "/init.scope",
        ] {
            assert!(
                matches!(owner_uid(&scoped("", suffix)), Err(CgroupError::InvalidPath(_))),
                "{suffix:?}"
            );
        }
        Ok(())
    }
}
