use std::{fs, path::Path};

use anyhow::{Context, Result};
use nix::{
    sys::wait::{self, WaitStatus},
    unistd::{self, Pid},
};

/// Lays out `files` below `dir`, creating intermediate directories. Used to
/// fake a mounted cgroup hierarchy.
pub fn create_cgroup_tree(dir: &Path, files: &[(&str, &str)]) -> Result<()> {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {parent:?}"))?;
        }
        fs::write(&path, content).with_context(|| format!("failed to write {path:?}"))?;
    }
    Ok(())
}

/// Forks, runs `cb` in the child and exits with its return value. A panic in
/// the child exits with 101.
pub fn spawn_child<F>(cb: F) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    match unsafe { unistd::fork().context("failed to fork")? } {
        unistd::ForkResult::Parent { child } => Ok(child),
        unistd::ForkResult::Child => {
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb)).unwrap_or(101);
            std::process::exit(code);
        }
    }
}

pub fn wait_child(pid: Pid) -> Result<WaitStatus> {
    wait::waitpid(pid, None).context("failed to wait for child")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_tree() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        create_cgroup_tree(tmp.path(), &[("a/b/cgroup.procs", "1\n"), ("cgroup.procs", "")])?;
        assert_eq!(fs::read_to_string(tmp.path().join("a/b/cgroup.procs"))?, "1\n");
        assert!(tmp.path().join("cgroup.procs").exists());
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn test_child_exit_code() -> Result<()> {
        let child = spawn_child(|| 7)?;
        assert_eq!(wait_child(child)?, WaitStatus::Exited(child, 7));
        Ok(())
    }
}
