//! Runtime configuration record
//!
//! All process-wide settings live in one `Config` constructed at
//! startup and passed by reference. Mutable loop state (port cursors,
//! session counters) belongs to the registry, not here.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::Error;
use crate::{Result, CMD_SOCK, PID_FILE, PORT_MAX, PORT_MIN, SESSION_TIMEOUT, TOS};

/// Transport of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// UNIX stream socket, one command per accepted connection
    Unix,
    /// IPv4 datagram socket, cookie-prefixed commands
    Udp,
    /// IPv6 datagram socket, cookie-prefixed commands
    Udp6,
}

/// Process configuration, fixed after startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Stay in the foreground (`-f`)
    pub nodaemon: bool,
    /// Send small packets twice (`-2`)
    pub dmode: bool,
    /// Bridging mode: two bind addresses, external and internal
    pub bmode: bool,
    /// Record RTCP alongside RTP (`-R` disables)
    pub rrtcp: bool,
    /// Control channel transport
    pub umode: ControlMode,
    /// Control socket path (UNIX) or `host[:port]` (UDP modes)
    pub cmd_sock: String,
    /// PID file path
    pub pid_file: PathBuf,
    /// IP TOS applied to IPv4 media sockets
    pub tos: u8,
    /// Recording directory (`-r`), recording disabled when absent
    pub rdir: Option<PathBuf>,
    /// Per-session recording subdirectory (`-S`), requires `rdir`
    pub sdir: Option<String>,
    /// Session TTL in ticks
    pub max_ttl: i32,
    /// Media port range, both bounds even
    pub port_min: u16,
    pub port_max: u16,
    /// Bind addresses; `[1]` is the internal side in bridging mode
    pub bind_addr: [Option<IpAddr>; 2],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodaemon: false,
            dmode: false,
            bmode: false,
            rrtcp: true,
            umode: ControlMode::Unix,
            cmd_sock: CMD_SOCK.to_string(),
            pid_file: PathBuf::from(PID_FILE),
            tos: TOS,
            rdir: None,
            sdir: None,
            max_ttl: SESSION_TIMEOUT,
            port_min: PORT_MIN,
            port_max: PORT_MAX,
            bind_addr: [None, None],
        }
    }
}

impl Config {
    /// Check invariants the rest of the engine relies on and round the
    /// port bounds to even values. Call once after assembling the
    /// configuration from the command line.
    pub fn validate(&mut self) -> Result<()> {
        if self.rdir.is_none() && self.sdir.is_some() {
            return Err(Error::Config(
                "-S switch requires -r switch".to_string(),
            ));
        }
        if self.port_min == 0 {
            return Err(Error::Config(
                "invalid value of the port_min argument, not in the range 1-65535".to_string(),
            ));
        }
        if self.port_max == 0 {
            return Err(Error::Config(
                "invalid value of the port_max argument, not in the range 1-65535".to_string(),
            ));
        }
        if self.port_min > self.port_max {
            return Err(Error::Config(
                "port_min should be less than port_max".to_string(),
            ));
        }

        if self.port_min % 2 != 0 {
            self.port_min += 1;
        }
        if self.port_max % 2 != 0 {
            self.port_max -= 1;
        }
        if self.port_min > self.port_max {
            return Err(Error::Config(
                "port range too narrow after rounding to even bounds".to_string(),
            ));
        }

        if self.bind_addr[0].is_none() {
            return Err(Error::Config(
                "no listen address configured".to_string(),
            ));
        }
        if self.bmode && self.bind_addr[1].is_none() {
            return Err(Error::Config(
                "bridging mode requires exactly 2 listen addresses".to_string(),
            ));
        }
        Ok(())
    }

    /// Which port cursor serves `laddr`: 0 for the primary (external)
    /// bind address, 1 for the bridged internal one.
    pub fn cursor_for(&self, laddr: IpAddr) -> usize {
        if Some(laddr) == self.bind_addr[0] {
            0
        } else {
            1
        }
    }

    /// Registry capacity: two descriptors per allocatable port pair plus
    /// the control slot.
    pub fn table_capacity(&self) -> usize {
        (self.port_max - self.port_min + 1) as usize * 2 + 1
    }
}
