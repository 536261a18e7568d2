use std::{
    any::Any,
    fs, io,
    path::{Path, PathBuf},
};

use nix::{
    sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, CGROUP_SUPER_MAGIC, TMPFS_MAGIC},
    unistd::Pid,
};
use procfs::process::Process;

use super::{CgroupHost, FsKind, MountEntry};

const PROC_CGROUPS: &str = "/proc/cgroups";
const CGROUP_NS: &str = "/proc/self/ns/cgroup";

/// Reads the live kernel state.
#[derive(Clone, Copy)]
pub struct LinuxHost;

fn proc_error(err: procfs::ProcError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

impl CgroupHost for LinuxHost {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn proc_cgroup(&self, pid: Option<Pid>) -> io::Result<String> {
        let path = match pid {
            Some(pid) => PathBuf::from(format!("/proc/{pid}/cgroup")),
            None => PathBuf::from("/proc/self/cgroup"),
        };
        fs::read_to_string(path)
    }

    fn filesystem(&self, path: &Path) -> io::Result<FsKind> {
        let stat = statfs(path).map_err(io::Error::from)?;
        let kind = match stat.filesystem_type() {
            t if t == CGROUP2_SUPER_MAGIC => FsKind::Cgroup2,
            t if t == CGROUP_SUPER_MAGIC => FsKind::Cgroup1,
            t if t == TMPFS_MAGIC => FsKind::Tmpfs,
            _ => FsKind::Other,
        };
        Ok(kind)
    }

    fn subdirectories(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn symlinks(&self, dir: &Path) -> io::Result<Vec<(PathBuf, PathBuf)>> {
        let mut links = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                let target = fs::read_link(entry.path())?;
                links.push((entry.path(), target));
            }
        }
        links.sort();
        Ok(links)
    }

    fn mount_entries(&self) -> io::Result<Vec<MountEntry>> {
        let entries = Process::myself()
            .map_err(proc_error)?
            .mountinfo()
            .map_err(proc_error)?
            .into_iter()
            .map(|m| {
                let mut options: Vec<String> = m
                    .super_options
                    .into_iter()
                    .filter(|(key, _)| key != "rw" && key != "ro")
                    .map(|(key, value)| match value {
                        Some(value) => format!("{key}={value}"),
                        None => key,
                    })
                    .collect();
                options.sort();
                MountEntry {
                    mount_point: m.mount_point,
                    fs_type: m.fs_type,
                    super_options: options.join(","),
                }
            })
            .collect();
        Ok(entries)
    }

    fn kernel_controllers(&self) -> io::Result<Vec<String>> {
        // #subsys_name hierarchy num_cgroups enabled
        let content = fs::read_to_string(PROC_CGROUPS)?;
        let controllers = content
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    [name, _, _, "1"] => Some((*name).to_owned()),
                    _ => None,
                }
            })
            .collect();
        Ok(controllers)
    }

    fn cgroup_ns_supported(&self) -> bool {
        Path::new(CGROUP_NS).exists()
    }
}
