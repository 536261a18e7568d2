//! # cgspawn
//! Runs a command or a whole OS tree in fresh namespaces, with a cgroup tree
//! laid out the way the payload's init system expects it.
mod observability;

use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use caps::Capability;
use clap::Parser;
use libcgspawn::{
    capabilities::parse_capability,
    user_ns::{UserNamespaceMode, DEFAULT_UID_RANGE},
    ExitOutcome, SpawnRequest,
};
use libcgtree::{CgroupVersion, RequestedVersion};
use nix::sys::signal::Signal;

const DEFAULT_BOOT_MAX: u32 = 16;

#[derive(clap::Args, Debug)]
pub struct LogOpts {
    /// Write logs to this file instead of stderr
    #[clap(long)]
    pub log: Option<PathBuf>,
    /// text or json
    #[clap(long)]
    pub log_format: Option<String>,
    /// Log at debug level
    #[clap(long)]
    pub debug: bool,
    /// error, warn, info, debug or trace. Overrides --debug
    #[clap(long)]
    pub log_level: Option<String>,
    /// Also send logs to the journal
    #[clap(long)]
    pub systemd_log: bool,
}

#[derive(Parser, Debug)]
#[clap(version, author = env!("CARGO_PKG_AUTHORS"), about)]
pub struct Opts {
    /// Root directory of the container
    #[clap(short = 'D', long)]
    directory: PathBuf,

    /// inherit, legacy, systemd, hybrid or unified
    #[clap(long, value_parser = parse_cgroup_version, default_value = "inherit")]
    cgroup_version: RequestedVersion,

    /// no, pick, yes, or SHIFT[:RANGE]
    #[clap(long, value_parser = parse_private_users, default_value = "no")]
    private_users: UserNamespaceMode,

    /// Disconnect the container from the host network
    #[clap(long)]
    private_network: bool,

    /// Do not give the container a cgroup namespace
    #[clap(long)]
    no_cgroupns: bool,

    #[clap(long)]
    hostname: Option<String>,

    /// Keep this capability on top of the default set
    #[clap(long = "capability", value_parser = parse_capability_arg)]
    capabilities: Vec<Capability>,

    /// How many reboots the container may request before cgspawn gives up
    #[clap(long, default_value_t = DEFAULT_BOOT_MAX)]
    boot_max: u32,

    /// Working directory inside the container
    #[clap(long)]
    chdir: Option<PathBuf>,

    /// KEY=VALUE passed to the payload
    #[clap(long = "setenv")]
    env: Vec<String>,

    /// Signal sent to the container when cgspawn is asked to stop
    #[clap(long, value_parser = parse_signal, default_value = "SIGTERM")]
    kill_signal: Signal,

    #[clap(flatten)]
    log: LogOpts,

    /// Program to run, /bin/sh by default
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Opts {
    fn to_request(&self) -> SpawnRequest {
        let mut request = SpawnRequest::new(&self.directory);
        request.cgroup_version = self.cgroup_version;
        request.userns = self.private_users;
        request.private_network = self.private_network;
        request.use_cgns = !self.no_cgroupns;
        request.hostname = self.hostname.clone();
        request.capabilities = self.capabilities.clone();
        request.chdir = self.chdir.clone();
        request.env = self.env.clone();
        request.command = self.command.clone();
        request.kill_signal = self.kill_signal;
        request
    }
}

fn parse_cgroup_version(s: &str) -> std::result::Result<RequestedVersion, String> {
    match s {
        "inherit" => Ok(RequestedVersion::Inherit),
        "legacy" | "none" => Ok(CgroupVersion::None.into()),
        "systemd" => Ok(CgroupVersion::SystemdOnly.into()),
        "hybrid" => Ok(CgroupVersion::HybridLegacy.into()),
        "unified" => Ok(CgroupVersion::All.into()),
        other => Err(format!("unknown cgroup version {other:?}")),
    }
}

fn parse_private_users(s: &str) -> std::result::Result<UserNamespaceMode, String> {
    match s {
        "no" | "false" => return Ok(UserNamespaceMode::No),
        "pick" => return Ok(UserNamespaceMode::Pick),
        "yes" | "true" => {
            return Ok(UserNamespaceMode::Fixed {
                shift: None,
                range: DEFAULT_UID_RANGE,
            })
        }
        _ => {}
    }

    let (shift, range) = match s.split_once(':') {
        Some((shift, range)) => (shift, Some(range)),
        None => (s, None),
    };
    let shift = shift
        .parse::<u32>()
        .map_err(|err| format!("invalid uid shift {shift:?}: {err}"))?;
    let range = match range {
        Some(range) => range
            .parse::<u32>()
            .map_err(|err| format!("invalid uid range {range:?}: {err}"))?,
        None => DEFAULT_UID_RANGE,
    };
    Ok(UserNamespaceMode::Fixed {
        shift: Some(shift),
        range,
    })
}

fn parse_signal(s: &str) -> std::result::Result<Signal, String> {
    if let Ok(num) = s.parse::<i32>() {
        return Signal::try_from(num).map_err(|err| format!("invalid signal {num}: {err}"));
    }
    let upper = s.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal {s:?}"))
}

fn parse_capability_arg(s: &str) -> std::result::Result<Capability, String> {
    parse_capability(s).map_err(|err| err.to_string())
}

/// Launches the container until it stops asking for reboots.
fn run(request: &SpawnRequest, boot_max: u32) -> Result<i32> {
    let mut boots = 0;
    loop {
        match libcgspawn::launch(request).context("failed to launch container")? {
            ExitOutcome::Terminated(code) => return Ok(code),
            ExitOutcome::Rebooted => {
                boots += 1;
                if boots > boot_max {
                    bail!("container rebooted {boots} times, giving up");
                }
                tracing::info!(boots, "container asked for a reboot");
            }
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {:?}", e);
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    if !nix::unistd::geteuid().is_root() {
        bail!("cgspawn needs to run as root");
    }

    let request = opts.to_request();
    request
        .validate()
        .with_context(|| format!("invalid container directory {:?}", opts.directory))?;

    let code = run(&request, opts.boot_max)?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_users() {
        assert_eq!(parse_private_users("no"), Ok(UserNamespaceMode::No));
        assert_eq!(parse_private_users("pick"), Ok(UserNamespaceMode::Pick));
        assert_eq!(
            parse_private_users("yes"),
            Ok(UserNamespaceMode::Fixed {
                shift: None,
                range: DEFAULT_UID_RANGE
            })
        );
        assert_eq!(
            parse_private_users("524288"),
            Ok(UserNamespaceMode::Fixed {
                shift: Some(524288),
                range: DEFAULT_UID_RANGE
            })
        );
        assert_eq!(
            parse_private_users("524288:1000"),
            Ok(UserNamespaceMode::Fixed {
                shift: Some(524288),
                range: 1000
            })
        );
        assert!(parse_private_users("maybe").is_err());
        assert!(parse_private_users("1:x").is_err());
    }

    #[test]
    fn test_parse_cgroup_version() {
        assert_eq!(parse_cgroup_version("inherit"), Ok(RequestedVersion::Inherit));
        assert_eq!(
            parse_cgroup_version("hybrid"),
            Ok(RequestedVersion::Exact(CgroupVersion::HybridLegacy))
        );
        assert!(parse_cgroup_version("v3").is_err());
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGTERM"), Ok(Signal::SIGTERM));
        assert_eq!(parse_signal("kill"), Ok(Signal::SIGKILL));
        assert_eq!(parse_signal("1"), Ok(Signal::SIGHUP));
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("0").is_err());
    }

    #[test]
    fn test_opts_to_request() {
        let opts = Opts::parse_from([
            "cgspawn",
            "-D",
            "/var/lib/machines/fedora",
            "--private-users",
            "pick",
            "--no-cgroupns",
            "--capability",
            "CAP_NET_ADMIN",
            "--setenv",
            "LANG=C",
            "/usr/bin/env",
            "-i",
        ]);
        let request = opts.to_request();
        assert_eq!(request.root, PathBuf::from("/var/lib/machines/fedora"));
        assert_eq!(request.userns, UserNamespaceMode::Pick);
        assert!(!request.use_cgns);
        assert_eq!(request.capabilities, vec![Capability::CAP_NET_ADMIN]);
        assert_eq!(request.env, vec!["LANG=C".to_owned()]);
        assert_eq!(request.command, vec!["/usr/bin/env".to_owned(), "-i".to_owned()]);
        assert_eq!(request.cgroup_version, RequestedVersion::Inherit);
        assert_eq!(request.kill_signal, Signal::SIGTERM);
        assert_eq!(opts.boot_max, DEFAULT_BOOT_MAX);
    }
}
