//! Handles the capability bounding set of the payload
use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};

use crate::syscall::{Syscall, SyscallError};

/// Capabilities a container keeps unless told otherwise.
pub const DEFAULT_CAPABILITIES: &[Capability] = &[
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_IPC_OWNER,
    Capability::CAP_KILL,
    Capability::CAP_LEASE,
    Capability::CAP_LINUX_IMMUTABLE,
    Capability::CAP_MKNOD,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_BROADCAST,
    Capability::CAP_NET_RAW,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_SYS_RESOURCE,
    Capability::CAP_SYS_TTY_CONFIG,
];

#[derive(Debug, thiserror::Error)]
#[error("unknown capability {0:?}")]
pub struct UnknownCapability(pub String);

/// Parses `CAP_SYS_ADMIN`, `cap_sys_admin` or `SYS_ADMIN`.
pub fn parse_capability(name: &str) -> Result<Capability, UnknownCapability> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };
    Capability::from_str(&full).map_err(|_| UnknownCapability(name.to_owned()))
}

/// The default set plus `extra`.
pub fn bounding_set(extra: &[Capability]) -> CapsHashSet {
    DEFAULT_CAPABILITIES
        .iter()
        .chain(extra.iter())
        .copied()
        .collect()
}

/// Drops every capability outside the default set and `extra` from the
/// bounding set of the calling process.
pub fn drop_privileges(syscall: &dyn Syscall, extra: &[Capability]) -> Result<(), SyscallError> {
    let keep = bounding_set(extra);
    tracing::debug!(count = keep.len(), "limiting capability bounding set");
    syscall.set_capability(CapSet::Bounding, &keep)
}
