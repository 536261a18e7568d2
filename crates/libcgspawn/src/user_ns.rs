use std::{
    fs::{self, File, OpenOptions},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::stat,
    unistd::{Gid, Group, Pid, Uid, User},
};
use serde::{Deserialize, Serialize};

/// Lowest base handed out when picking a range.
pub const UID_SHIFT_PICK_MIN: u32 = 0x0008_0000;
/// Highest base handed out when picking a range.
pub const UID_SHIFT_PICK_MAX: u32 = 0x6FFF_0000;
/// Size of a range derived from the root owner or picked.
pub const DEFAULT_UID_RANGE: u32 = 0x10000;

const PICK_TRIES: u32 = 100;
const DEFAULT_LOCK_DIR: &str = "/run/cgspawn/uid";

/// How the container's user namespace is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserNamespaceMode {
    /// No user namespace.
    #[default]
    No,
    /// Map `range` ids starting at `shift`. Without a shift the base is read
    /// from the owner of the root directory.
    Fixed { shift: Option<u32>, range: u32 },
    /// Find a free 64k range.
    Pick,
}

impl UserNamespaceMode {
    pub fn enabled(&self) -> bool {
        !matches!(self, UserNamespaceMode::No)
    }
}

/// Host id that container id 0 maps to, and how many ids follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidShift {
    pub shift: u32,
    pub range: u32,
}

impl UidShift {
    pub fn uid(&self) -> Uid {
        Uid::from_raw(self.shift)
    }

    pub fn gid(&self) -> Gid {
        Gid::from_raw(self.shift)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserNamespaceError {
    #[error("failed to determine uid base of {path:?}")]
    RootOwner {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("uid base {uid:#x} and gid base {gid:#x} of the root directory don't match")]
    OwnerMismatch { uid: u32, gid: u32 },
    #[error("uid base {shift:#x} too high for range {range:#x}")]
    RangeOverflow { shift: u32, range: u32 },
    #[error("no free uid range found after {0} attempts")]
    ResourceExhausted(u32),
    #[error("failed to lock uid range at {path:?}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    IDMapping(#[from] MappingError),
}

type Result<T> = std::result::Result<T, UserNamespaceError>;

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to write id mapping to {path:?}")]
    WriteIDMapping {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn check_range(shift: u32, range: u32) -> Result<()> {
    if range == 0 || shift.checked_add(range).is_none() {
        return Err(UserNamespaceError::RangeOverflow { shift, range });
    }
    Ok(())
}

/// Works out the shift the outer child reports to the parent. `None` means
/// no user namespace.
pub fn determine_uid_shift(mode: UserNamespaceMode, root: &Path) -> Result<Option<UidShift>> {
    let shift = match mode {
        UserNamespaceMode::No => return Ok(None),
        UserNamespaceMode::Fixed {
            shift: Some(shift),
            range,
        } => UidShift { shift, range },
        UserNamespaceMode::Fixed { shift: None, .. } | UserNamespaceMode::Pick => {
            let st = stat::stat(root).map_err(|source| UserNamespaceError::RootOwner {
                path: root.to_path_buf(),
                source,
            })?;
            let uid = st.st_uid & 0xffff_0000;
            let gid = st.st_gid & 0xffff_0000;
            if uid != gid {
                return Err(UserNamespaceError::OwnerMismatch { uid, gid });
            }
            UidShift {
                shift: uid,
                range: DEFAULT_UID_RANGE,
            }
        }
    };

    check_range(shift.shift, shift.range)?;
    Ok(Some(shift))
}

/// Exclusive claim on a picked range. The claim lasts as long as this value.
#[derive(Debug)]
pub struct UidShiftLock {
    path: PathBuf,
    _file: File,
}

impl UidShiftLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UidShiftLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(?err, path = ?self.path, "failed to remove uid lock file");
        }
    }
}

fn id_in_user_database(id: u32) -> bool {
    matches!(User::from_uid(Uid::from_raw(id)), Ok(Some(_)))
        || matches!(Group::from_gid(Gid::from_raw(id)), Ok(Some(_)))
}

/// Picks free uid ranges, serialised between launchers by lock files.
pub struct UidShiftPicker {
    lock_dir: PathBuf,
    id_in_use: fn(u32) -> bool,
}

impl Default for UidShiftPicker {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            id_in_use: id_in_user_database,
        }
    }
}

impl UidShiftPicker {
    pub fn new() -> Self {
        Default::default()
    }

    #[cfg(test)]
    pub fn new_test(lock_dir: PathBuf, id_in_use: fn(u32) -> bool) -> Self {
        Self {
            lock_dir,
            id_in_use,
        }
    }

    /// Tries `candidate` first, then random 64k aligned bases.
    pub fn pick(&self, mut candidate: u32) -> Result<(UidShift, UidShiftLock)> {
        if let Err(err) = fs::create_dir_all(&self.lock_dir) {
            tracing::debug!(?err, dir = ?self.lock_dir, "failed to create uid lock directory");
        }

        for _ in 0..PICK_TRIES {
            if let Some(lock) = self.try_candidate(candidate)? {
                tracing::debug!(shift = candidate, "picked uid range");
                return Ok((
                    UidShift {
                        shift: candidate,
                        range: DEFAULT_UID_RANGE,
                    },
                    lock,
                ));
            }
            candidate = fastrand::u32(UID_SHIFT_PICK_MIN..UID_SHIFT_PICK_MAX) & 0xffff_0000;
        }

        Err(UserNamespaceError::ResourceExhausted(PICK_TRIES))
    }

    fn try_candidate(&self, candidate: u32) -> Result<Option<UidShiftLock>> {
        if !(UID_SHIFT_PICK_MIN..=UID_SHIFT_PICK_MAX).contains(&candidate)
            || candidate & 0xffff != 0
        {
            return Ok(None);
        }

        let path = self.lock_dir.join(candidate.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|source| UserNamespaceError::Lock {
                path: path.clone(),
                source,
            })?;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == -1 {
            let errno = Errno::last();
            if errno == Errno::EWOULDBLOCK {
                // another launcher holds this range
                return Ok(None);
            }
            return Err(UserNamespaceError::Lock {
                path,
                source: errno.into(),
            });
        }

        let lock = UidShiftLock { path, _file: file };
        if (self.id_in_use)(candidate) || (self.id_in_use)(candidate + 0xfffe) {
            return Ok(None);
        }
        Ok(Some(lock))
    }
}

// Wrap the uid/gid path function into a struct for dependency injection. This
// allows us to mock the id mapping logic in unit tests by using a different
// base path other than `/proc`.
#[derive(Debug, Clone)]
pub struct UserNamespaceIDMapper {
    base_path: PathBuf,
}

impl Default for UserNamespaceIDMapper {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/proc"),
        }
    }
}

impl UserNamespaceIDMapper {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get_uid_path(&self, pid: &Pid) -> PathBuf {
        self.base_path.join(pid.to_string()).join("uid_map")
    }

    pub fn get_gid_path(&self, pid: &Pid) -> PathBuf {
        self.base_path.join(pid.to_string()).join("gid_map")
    }

    #[cfg(test)]
    pub fn ensure_proc_path(&self, pid: &Pid) -> std::io::Result<()> {
        fs::create_dir_all(self.base_path.join(pid.to_string()))
    }

    #[cfg(test)]
    pub fn new_test(path: PathBuf) -> Self {
        Self { base_path: path }
    }

    /// Maps container ids `0..range` onto `shift..shift+range` for both
    /// uids and gids of `pid`.
    pub fn write_mappings(&self, pid: Pid, shift: &UidShift) -> Result<()> {
        let mapping = format!("0 {} {}\n", shift.shift, shift.range);
        write_id_mapping(&self.get_uid_path(&pid), &mapping)?;
        write_id_mapping(&self.get_gid_path(&pid), &mapping)?;
        Ok(())
    }
}

fn write_id_mapping(map_file: &Path, mapping: &str) -> std::result::Result<(), MappingError> {
    tracing::debug!(?map_file, mapping, "write id mapping");
    fs::write(map_file, mapping).map_err(|source| {
        tracing::error!(?source, ?map_file, mapping, "failed to write uid/gid mapping");
        MappingError::WriteIDMapping {
            path: map_file.to_path_buf(),
            source,
        }
    })
}
