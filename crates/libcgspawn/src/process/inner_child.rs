use std::{
    ffi::CString,
    fs,
    path::{Path, PathBuf},
};

use libcgtree::HierarchyRegistry;
use nix::{
    mount::MsFlags,
    sched::CloneFlags,
    unistd::{self, Gid, Uid},
};

use super::args::{ContainerArgs, SpawnRequest};
use crate::{
    barrier::{Barrier, SocketEndpoint},
    capabilities,
    cgroup::{CgroupMountOptions, CgroupMounter},
    error::{LaunchError, Result},
    process::{outer_child::unshare_error, signals::unblock_supervisor_signals},
    syscall::Syscall,
};

const DEFAULT_COMMAND: &str = "/bin/sh";
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const PROC_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NODEV);

/// Runs as pid 1 of the new pid namespace. Only returns on failure.
pub fn container_inner_process(
    args: &ContainerArgs,
    registry: &mut HierarchyRegistry,
    endpoint: SocketEndpoint,
    use_userns: bool,
) -> Result<i32> {
    let request = args.request;
    let syscall = request.syscall.create_syscall();
    let mut barrier = Barrier::new(Box::new(endpoint));

    if use_userns {
        // ready for the parent to write our id maps
        barrier.place()?;
        barrier.place_and_sync()?;
        syscall.set_id(Uid::from_raw(0), Gid::from_raw(0))?;
    }

    mount_proc(syscall.as_ref())?;

    // the parent moves us into our final cgroup meanwhile
    barrier.place_and_sync()?;

    if args.use_cgns {
        syscall
            .unshare(CloneFlags::CLONE_NEWCGROUP)
            .map_err(unshare_error)?;
        let mounter = CgroupMounter::with_syscall(request.syscall.create_syscall());
        mounter.apply(
            registry,
            &args.plan,
            &CgroupMountOptions {
                cgroup_root: Path::new("/sys/fs/cgroup"),
                use_cgns: true,
                use_userns,
                tmpfs_owner: use_userns.then_some(0),
            },
        )?;
    }

    if let Some(hostname) = &request.hostname {
        syscall.set_hostname(hostname)?;
    }

    capabilities::drop_privileges(syscall.as_ref(), &request.capabilities)?;

    unistd::setsid()?;
    let cwd = request.chdir.clone().unwrap_or_else(|| PathBuf::from("/"));
    unistd::chdir(&cwd)?;

    let (command, argv, envp) = exec_args(request)?;

    barrier.place_and_sync()?;

    // blocked since the parent forked us; the payload gets them back
    unblock_supervisor_signals()?;
    tracing::debug!(?command, "executing payload");
    match unistd::execvpe(&command, &argv, &envp)? {}
}

pub(crate) fn mount_proc(syscall: &dyn Syscall) -> Result<()> {
    let proc = Path::new("/proc");
    fs::create_dir_all(proc).map_err(|source| LaunchError::Io {
        path: proc.to_path_buf(),
        source,
    })?;
    syscall.mount(Some(Path::new("proc")), proc, Some("proc"), PROC_FLAGS, None)?;
    Ok(())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| LaunchError::InvalidRequest(format!("{s:?} contains a nul byte")))
}

/// Program, arguments and environment for `execvpe`.
pub(crate) fn exec_args(request: &SpawnRequest) -> Result<(CString, Vec<CString>, Vec<CString>)> {
    let argv = if request.command.is_empty() {
        vec![cstring(DEFAULT_COMMAND)?]
    } else {
        request
            .command
            .iter()
            .map(|arg| cstring(arg))
            .collect::<Result<Vec<_>>>()?
    };

    let mut env = vec![
        DEFAULT_PATH.to_owned(),
        "container=cgspawn".to_owned(),
        "HOME=/root".to_owned(),
    ];
    for entry in &request.env {
        let key = entry.split('=').next().unwrap_or_default();
        env.retain(|e| e.split('=').next() != Some(key));
        env.push(entry.clone());
    }
    if let Some(hostname) = &request.hostname {
        env.push(format!("HOSTNAME={hostname}"));
    }
    let envp = env.iter().map(|e| cstring(e)).collect::<Result<Vec<_>>>()?;

    Ok((argv[0].clone(), argv, envp))
}
