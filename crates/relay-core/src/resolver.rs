//! Address parsing and rendering
//!
//! Bind hosts may be names and are resolved at startup; remote endpoints
//! supplied over the control channel are numeric only and never trigger
//! DNS from the packet path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::Error;
use crate::Result;

/// Address family selected by the `6` command modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Resolve a bind host for the requested family. `*` and the empty
/// string select the family wildcard; anything else may be a numeric
/// address or a name.
pub fn resolve_bind_host(host: &str, family: Family) -> Result<IpAddr> {
    if host.is_empty() || host == "*" {
        return Ok(match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return check_family(ip, family, host);
    }
    let candidates = (host, 0u16).to_socket_addrs().map_err(|e| Error::BindHost {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    for addr in candidates {
        if family_of(addr.ip()) == family {
            return Ok(addr.ip());
        }
    }
    Err(Error::BindHost {
        host: host.to_string(),
        reason: "no address of the requested family".to_string(),
    })
}

fn check_family(ip: IpAddr, family: Family, host: &str) -> Result<IpAddr> {
    if family_of(ip) == family {
        Ok(ip)
    } else {
        Err(Error::BindHost {
            host: host.to_string(),
            reason: "address family mismatch".to_string(),
        })
    }
}

fn family_of(ip: IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

/// Parse a remote endpoint supplied by the controller. Returns `None`
/// for anything unusable: non-numeric hosts, short strings, bad ports,
/// a family other than the requested one, or a null host. A `None` never
/// fails the command; the address is simply not pre-filled.
pub fn parse_remote(addr: &str, port: &str, family: Family) -> Option<SocketAddr> {
    if addr.len() < 7 {
        return None;
    }
    let ip = addr.parse::<IpAddr>().ok()?;
    if family_of(ip) != family || is_host_null(ip) {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Whether `ip` is the family wildcard
pub fn is_host_null(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

/// Host-only equality, the comparison used for asymmetric peers
pub fn is_host_eq(a: SocketAddr, b: SocketAddr) -> bool {
    a.ip() == b.ip()
}

/// Render a bind address for a command reply: bare host, with the ` 6`
/// marker appended for IPv6 per the wire grammar.
pub fn format_reply_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("{} 6", v6),
    }
}
