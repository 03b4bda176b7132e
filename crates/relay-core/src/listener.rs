//! Media listener allocation
//!
//! A call leg gets two consecutive UDP sockets: RTP on an even port and
//! RTCP on the next odd one. Allocation scans the configured range in
//! steps of two from a rotating cursor, wrapping once; a range with no
//! free adjacent pair is an error. IP TOS is applied to IPv4 sockets and
//! both sockets are non-blocking.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::Result;

/// An RTP/RTCP socket pair on adjacent ports
pub struct TwinSockets {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    /// The even RTP port; RTCP is `port + 1`
    pub port: u16,
}

enum BindFailure {
    /// Port in use or not permitted; try the next pair
    Busy,
    /// Anything else; abandon the scan
    Fatal(std::io::Error),
}

fn bind_media_socket(cfg: &Config, addr: SocketAddr) -> std::result::Result<UdpSocket, BindFailure> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(BindFailure::Fatal)?;
    if addr.is_ipv4() {
        if let Err(e) = socket.set_tos(u32::from(cfg.tos)) {
            warn!(tos = cfg.tos, error = %e, "unable to set TOS");
        }
    }
    socket
        .set_nonblocking(true)
        .map_err(BindFailure::Fatal)?;
    match socket.bind(&addr.into()) {
        Ok(()) => Ok(socket.into()),
        Err(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied => {
                Err(BindFailure::Busy)
            }
            _ => Err(BindFailure::Fatal(e)),
        },
    }
}

/// Bind the RTP/RTCP pair starting at `port`
fn create_twinlistener(
    cfg: &Config,
    laddr: IpAddr,
    port: u16,
) -> std::result::Result<TwinSockets, BindFailure> {
    let rtp = bind_media_socket(cfg, SocketAddr::new(laddr, port))?;
    let rtcp = bind_media_socket(cfg, SocketAddr::new(laddr, port + 1))?;
    Ok(TwinSockets { rtp, rtcp, port })
}

/// Allocate a free adjacent pair on `laddr`, scanning from `startport`.
/// The scan steps by two, wraps from `port_max` back to `port_min`
/// exactly once, and fails when the whole range is busy.
pub fn create_listener(cfg: &Config, laddr: IpAddr, startport: u16) -> Result<TwinSockets> {
    let mut port = if startport < cfg.port_min || startport > cfg.port_max {
        cfg.port_min
    } else {
        startport
    };
    let first = port;
    let mut init = false;

    while port != first || !init {
        init = true;
        match create_twinlistener(cfg, laddr, port) {
            Ok(twin) => {
                debug!(%laddr, port, "media listener pair bound");
                return Ok(twin);
            }
            Err(BindFailure::Fatal(e)) => {
                return Err(Error::Listener(format!(
                    "can't bind to {}:{}: {}",
                    laddr, port, e
                )));
            }
            Err(BindFailure::Busy) => {
                if port >= cfg.port_max {
                    port = cfg.port_min;
                } else {
                    port += 2;
                }
            }
        }
    }
    Err(Error::Listener(format!(
        "no free port pair in {}-{} on {}",
        cfg.port_min, cfg.port_max, laddr
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(min: u16, max: u16) -> Config {
        let mut cfg = Config::default();
        cfg.bind_addr[0] = Some("127.0.0.1".parse().unwrap());
        cfg.port_min = min;
        cfg.port_max = max;
        cfg
    }

    #[test]
    fn allocates_adjacent_even_pair() {
        let cfg = test_config(36000, 36100);
        let laddr: IpAddr = "127.0.0.1".parse().unwrap();
        let twin = create_listener(&cfg, laddr, 36000).unwrap();
        assert_eq!(twin.port % 2, 0);
        assert_eq!(
            twin.rtp.local_addr().unwrap().port() + 1,
            twin.rtcp.local_addr().unwrap().port()
        );
    }

    #[test]
    fn skips_busy_pairs() {
        let cfg = test_config(36200, 36210);
        let laddr: IpAddr = "127.0.0.1".parse().unwrap();
        // Occupy the first RTP port so the scan has to move on
        let _blocker = UdpSocket::bind("127.0.0.1:36200").unwrap();
        let twin = create_listener(&cfg, laddr, 36200).unwrap();
        assert!(twin.port >= 36202);
    }

    #[test]
    fn wraps_from_range_end() {
        let cfg = test_config(36300, 36310);
        let laddr: IpAddr = "127.0.0.1".parse().unwrap();
        // Cursor past the end wraps to port_min before scanning
        let twin = create_listener(&cfg, laddr, 36312).unwrap();
        assert_eq!(twin.port, 36300);
    }

    #[test]
    fn exhausted_range_fails() {
        let cfg = test_config(36400, 36400);
        let laddr: IpAddr = "127.0.0.1".parse().unwrap();
        let _hold = UdpSocket::bind("127.0.0.1:36400").unwrap();
        assert!(create_listener(&cfg, laddr, 36400).is_err());
    }
}
