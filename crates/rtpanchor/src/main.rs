//! rtpanchor: RTP/RTCP media relay daemon
//!
//! Bootstraps the relay engine: command-line parsing, logging, control
//! socket creation, daemonization, PID file, signal wiring, and the
//! event loop. All media and protocol logic lives in
//! `rtpanchor-relay-core`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};

use rtpanchor_relay_core::config::{Config, ControlMode};
use rtpanchor_relay_core::control::ControlTransport;
use rtpanchor_relay_core::registry::Registry;
use rtpanchor_relay_core::resolver::{resolve_bind_host, Family};
use rtpanchor_relay_core::{engine, CPROTOVER, PROTO_CAPS};

/// RTP/RTCP media relay daemon
#[derive(Parser, Debug)]
#[command(name = "rtpanchor", disable_version_flag = true)]
struct Args {
    /// Stay in the foreground, do not daemonize
    #[arg(short = 'f')]
    foreground: bool,

    /// Send small (low-bitrate) packets twice
    #[arg(short = '2')]
    double_send: bool,

    /// Do not record RTCP when recording is requested
    #[arg(short = 'R')]
    no_rtcp_record: bool,

    /// IPv4 listen address; addr1/addr2 enables bridging mode
    #[arg(short = 'l', value_name = "addr1[/addr2]")]
    listen4: Option<String>,

    /// IPv6 listen address; addr1/addr2 enables bridging mode
    #[arg(short = '6', value_name = "addr1[/addr2]")]
    listen6: Option<String>,

    /// Control socket: {unix:|udp:|udp6:}path
    #[arg(short = 's', value_name = "socket")]
    socket: Option<String>,

    /// IP TOS for media sockets
    #[arg(short = 't', value_name = "tos")]
    tos: Option<u8>,

    /// Directory to write recordings into
    #[arg(short = 'r', value_name = "rdir")]
    rdir: Option<PathBuf>,

    /// Per-session recording subdirectory, requires -r
    #[arg(short = 'S', value_name = "sdir")]
    sdir: Option<String>,

    /// PID file path
    #[arg(short = 'p', value_name = "pidfile")]
    pid_file: Option<PathBuf>,

    /// Session TTL in seconds
    #[arg(short = 'T', value_name = "ttl")]
    ttl: Option<i32>,

    /// Raise RLIMIT_NOFILE to this many descriptors
    #[arg(short = 'L', value_name = "nfiles")]
    nofiles: Option<u64>,

    /// Lowest media port
    #[arg(short = 'm', value_name = "port")]
    port_min: Option<u16>,

    /// Highest media port
    #[arg(short = 'M', value_name = "port")]
    port_max: Option<u16>,

    /// Print protocol version and capabilities, then exit
    #[arg(short = 'v')]
    version_caps: bool,
}

/// Split an `addr1[/addr2]` listen argument; a second address enables
/// bridging mode.
fn split_listen(arg: &str) -> (Option<&str>, Option<&str>) {
    match arg.split_once('/') {
        Some((a, b)) => (Some(a), Some(b)),
        None => (Some(arg), None),
    }
}

fn build_config(args: &Args) -> Result<Config> {
    let mut cfg = Config::default();
    cfg.nodaemon = args.foreground;
    cfg.dmode = args.double_send;
    cfg.rrtcp = !args.no_rtcp_record;
    cfg.rdir = args.rdir.clone();
    cfg.sdir = args.sdir.clone();
    if let Some(tos) = args.tos {
        cfg.tos = tos;
    }
    if let Some(ttl) = args.ttl {
        cfg.max_ttl = ttl;
    }
    if let Some(p) = args.port_min {
        cfg.port_min = p;
    }
    if let Some(p) = args.port_max {
        cfg.port_max = p;
    }
    if let Some(pid) = &args.pid_file {
        cfg.pid_file = pid.clone();
    }

    if let Some(socket) = &args.socket {
        if let Some(path) = socket.strip_prefix("udp:") {
            cfg.umode = ControlMode::Udp;
            cfg.cmd_sock = path.to_string();
        } else if let Some(path) = socket.strip_prefix("udp6:") {
            cfg.umode = ControlMode::Udp6;
            cfg.cmd_sock = path.to_string();
        } else if let Some(path) = socket.strip_prefix("unix:") {
            cfg.umode = ControlMode::Unix;
            cfg.cmd_sock = path.to_string();
        } else {
            cfg.umode = ControlMode::Unix;
            cfg.cmd_sock = socket.clone();
        }
    }

    let (bh, bh6) = (
        args.listen4.as_deref().map(split_listen),
        args.listen6.as_deref().map(split_listen),
    );
    let mut hosts: [[Option<&str>; 2]; 2] = [[None, None], [None, None]];
    if let Some((a, b)) = bh {
        hosts[0] = [a.filter(|s| !s.is_empty()), b.filter(|s| !s.is_empty())];
        if hosts[0][1].is_some() {
            cfg.bmode = true;
        }
    }
    if let Some((a, b)) = bh6 {
        hosts[1] = [a.filter(|s| !s.is_empty()), b.filter(|s| !s.is_empty())];
        if hosts[1][1].is_some() {
            cfg.bmode = true;
        }
    }

    let configured = hosts.iter().flatten().filter(|h| h.is_some()).count();
    if configured == 0 {
        if cfg.umode != ControlMode::Unix {
            bail!("explicit binding address has to be specified in UDP command mode");
        }
        hosts[0][0] = Some("*");
    }
    if cfg.bmode {
        if hosts[0][0].is_some() && hosts[1][0].is_some() {
            bail!(
                "either IPv4 or IPv6 should be configured for external interface \
                 in bridging mode, not both"
            );
        }
        if hosts[0][1].is_some() && hosts[1][1].is_some() {
            bail!(
                "either IPv4 or IPv6 should be configured for internal interface \
                 in bridging mode, not both"
            );
        }
        if configured != 2 {
            bail!(
                "incomplete configuration of the bridging mode - exactly 2 listen \
                 addresses required, {} provided",
                configured
            );
        }
    } else if configured > 1 {
        bail!("exactly 1 listen address required, {} provided", configured);
    }

    for i in 0..2 {
        cfg.bind_addr[i] = if let Some(host) = hosts[0][i] {
            Some(resolve_bind_host(host, Family::V4)?)
        } else if let Some(host) = hosts[1][i] {
            Some(resolve_bind_host(host, Family::V6)?)
        } else {
            None
        };
    }
    if cfg.bind_addr[0].is_none() {
        cfg.bind_addr = [cfg.bind_addr[1].take(), None];
    }

    cfg.validate()?;
    Ok(cfg)
}

fn install_signal_handlers() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGUSR1,
        signal_hook::consts::SIGUSR2,
        signal_hook::consts::SIGXCPU,
        signal_hook::consts::SIGXFSZ,
        signal_hook::consts::SIGVTALRM,
        signal_hook::consts::SIGPROF,
    ] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .with_context(|| format!("can't install handler for signal {}", sig))?;
    }
    // A dead control client must not kill the daemon
    unsafe {
        nix::sys::signal::signal(nix::sys::signal::Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)
            .context("can't ignore SIGPIPE")?;
    }
    Ok(shutdown)
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version_caps {
        println!("Basic version: {}", CPROTOVER);
        for (id, description) in PROTO_CAPS.iter().skip(1) {
            println!("Extension {}: {}", id, description);
        }
        return Ok(());
    }

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Some(nfiles) = args.nofiles {
        nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, nfiles, nfiles)
            .context("setrlimit")?;
    }

    let cfg = build_config(&args)?;

    // The control socket must exist before we detach so the controller
    // can connect as soon as the parent exits
    let control = ControlTransport::bind(&cfg)
        .with_context(|| format!("can't create control socket at {}", cfg.cmd_sock))?;

    if !cfg.nodaemon {
        nix::unistd::daemon(false, false).context("can't switch into daemon mode")?;
    }

    info!("rtpanchor started, pid {}", std::process::id());
    if let Err(e) = std::fs::write(&cfg.pid_file, format!("{}\n", std::process::id())) {
        error!("can't open pidfile for writing: {}", e);
    }

    let shutdown = install_signal_handlers()?;

    let mut reg = Registry::new(cfg.table_capacity(), control.as_raw_fd(), cfg.port_min);
    engine::run(&cfg, &mut reg, &control, &shutdown);

    control.cleanup(&cfg);
    let _ = std::fs::remove_file(&cfg.pid_file);
    info!("rtpanchor ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rtpanchor").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn bridging_from_slash_syntax() {
        let args = parse(&["-l", "192.168.1.1/10.0.0.1", "-f"]);
        let cfg = build_config(&args).unwrap();
        assert!(cfg.bmode);
        assert_eq!(cfg.bind_addr[0], Some("192.168.1.1".parse().unwrap()));
        assert_eq!(cfg.bind_addr[1], Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn default_binds_wildcard() {
        let args = parse(&["-f"]);
        let cfg = build_config(&args).unwrap();
        assert!(!cfg.bmode);
        assert_eq!(cfg.bind_addr[0], Some("0.0.0.0".parse().unwrap()));
        assert_eq!(cfg.bind_addr[1], None);
    }

    #[test]
    fn udp_control_requires_listen_address() {
        let args = parse(&["-s", "udp:127.0.0.1:22222", "-f"]);
        assert!(build_config(&args).is_err());

        let args = parse(&["-s", "udp:127.0.0.1:22222", "-l", "127.0.0.1", "-f"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.umode, ControlMode::Udp);
        assert_eq!(cfg.cmd_sock, "127.0.0.1:22222");
    }

    #[test]
    fn sdir_without_rdir_rejected() {
        let args = parse(&["-S", "sub", "-f"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn two_plain_listen_addresses_rejected() {
        let args = parse(&["-l", "127.0.0.1", "-6", "::1", "-f"]);
        assert!(build_config(&args).is_err());
    }
}
