use nix::unistd::{self, Pid};

use crate::error::{LaunchError, Result};

// Execute the cb in another process. Make the fork works more like thread_spawn
// or clone, so it is easier to reason. Fork takes care of copying every
// variable the callback borrows into the new process.
pub fn container_fork<F: FnOnce() -> Result<i32>>(name: &str, cb: F) -> Result<Pid> {
    match unsafe { unistd::fork().map_err(LaunchError::Fork)? } {
        unistd::ForkResult::Parent { child } => Ok(child),
        unistd::ForkResult::Child => {
            if let Err(err) = prctl::set_name(name) {
                tracing::debug!(?err, name, "failed to set process name");
            }
            let ret = match cb() {
                Err(error) => {
                    tracing::error!(?error, "{name} failed");
                    -1
                }
                Ok(ec) => ec,
            };
            std::process::exit(ret);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::{bail, Result};
    use nix::sys::wait::{waitpid, WaitStatus};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_container_fork() -> Result<()> {
        let pid = container_fork("cgspawn:test", || Ok(0))?;
        match waitpid(pid, None).expect("wait pid failed.") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 0);
                Ok(())
            }
            _ => bail!("test failed"),
        }
    }

    #[test]
    #[serial]
    fn test_container_err_fork() -> Result<()> {
        let pid = container_fork("cgspawn:test", || {
            Err(LaunchError::Unsupported("test".into()))
        })?;
        match waitpid(pid, None).expect("wait pid failed.") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 255);
                Ok(())
            }
            _ => bail!("test failed"),
        }
    }
}
