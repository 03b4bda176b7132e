//! Core engine of the rtpanchor media relay.
//!
//! rtpanchor anchors RTP/RTCP media between the two legs of a signalled
//! call under the direction of an external controller (typically a SIP
//! proxy). The controller allocates a local port pair per call leg over
//! the control protocol; the relay then learns the peers' real addresses
//! from the media itself and shovels datagrams between the sides.
//!
//! The engine is single-threaded and cooperative: one `poll(2)` loop
//! multiplexes every media socket and the control channel, with a 1 Hz
//! tick driving session expiry. There are no locks and no background
//! threads; session removal is the only cancellation mechanism.

pub mod command;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod session;

pub use error::Error;

/// Result type alias for relay-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Base control protocol version advertised by the `V` command
pub const CPROTOVER: u32 = 20040107;

/// Known capability date-stamps, basic version first. The first entry is
/// the base protocol version and is not listed as an extension by `-v`.
pub const PROTO_CAPS: &[(&str, &str)] = &[
    ("20040107", "Basic RTP proxy functionality"),
    ("20050322", "Support for multiple RTP streams and MOH"),
    ("20060704", "Support for extra parameter in the V command"),
    ("20071116", "Support for RTP re-packetization"),
];

/// TTL clock period, seconds
pub const TIMETICK: u64 = 1;

/// Default session TTL in ticks
pub const SESSION_TIMEOUT: i32 = 60;

/// Default IP TOS for media sockets
pub const TOS: u8 = 0xB8;

/// Packets smaller than this are sent twice when double-send mode is on
pub const LBR_THRS: usize = 128;

/// Poll-rate ceiling, calls per second
pub const POLL_LIMIT: u64 = 200;

/// Poll timeout while sessions or players exist, milliseconds
pub const RTPS_TICKS_MIN: i32 = 10;

/// Default media port range (both bounds even)
pub const PORT_MIN: u16 = 35000;
pub const PORT_MAX: u16 = 65000;

/// Default UDP control port
pub const CPORT: &str = "22222";

/// Default control socket path
pub const CMD_SOCK: &str = "/var/run/rtpanchor.sock";

/// Default PID file
pub const PID_FILE: &str = "/var/run/rtpanchor.pid";

/// Command token cap, including the cookie in datagram mode
pub const MAX_ARGS: usize = 10;

/// Packets drained from one descriptor per readiness event
pub const DRAIN_MAX: usize = 5;
