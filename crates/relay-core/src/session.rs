//! Session model
//!
//! A session is one media stream between the two legs of a call. It owns
//! two tracks, RTP on an even local port and its RTCP twin on the odd
//! one, each with two directions: 0 faces the callee, 1 the caller.
//! The primary (RTP) side owns the twin outright; there is no cyclic
//! pairing, and only the primary carries a TTL.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::rc::Rc;
use tracing::info;

use rtpanchor_rtp_core::player::RtpPlayer;
use rtpanchor_rtp_core::record::Recorder;
use rtpanchor_rtp_core::resizer::RtpResizer;

/// Direction index facing the callee
pub const DIR_CALLEE: usize = 0;
/// Direction index facing the caller
pub const DIR_CALLER: usize = 1;

/// Shared handle to a session; the engine is single-threaded, so plain
/// reference counting suffices.
pub type SessionRef = Rc<RefCell<Session>>;

/// Which track of a session a poll-table slot refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Rtp,
    Rtcp,
}

/// How a needle tag relates to a session tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    /// Byte-for-byte equal
    Exact,
    /// Needle is a prefix terminated by `;<medianum>`
    Prefix { medianum: u32 },
}

/// Compare a session's stored tag against a needle from a command.
/// `abc;2` matches needle `abc` as `Prefix { medianum: 2 }`; `abc`
/// matches `abc` exactly; `abcd` does not match `abc` at all.
pub fn compare_session_tags(session_tag: &str, needle: &str) -> Option<TagMatch> {
    let rest = session_tag.strip_prefix(needle)?;
    if rest.is_empty() {
        return Some(TagMatch::Exact);
    }
    let digits = rest.strip_prefix(';')?;
    let medianum = digits
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, b| {
            acc.wrapping_mul(10).wrapping_add((b - b'0') as u32)
        });
    Some(TagMatch::Prefix { medianum })
}

/// Per-direction, per-track media state
pub struct Track {
    /// Local sockets; absent until the controller binds that side
    pub sockets: [Option<UdpSocket>; 2],
    /// Local ports matching `sockets`
    pub ports: [u16; 2],
    /// Local bind address per direction (differs in bridging mode)
    pub laddr: [IpAddr; 2],
    /// Learned or controller-supplied remote endpoint
    pub remote: [Option<SocketAddr>; 2],
    /// Ignore source ports when authenticating this direction
    pub asymmetric: [bool; 2],
    /// Next authentic packet may rewrite `remote`
    pub can_update: [bool; 2],
    /// Counters: in from callee, in from caller, relayed, dropped
    pub pcount: [u64; 4],
    /// Capture sinks per direction
    pub recorders: [Option<Recorder>; 2],
    /// Poll-table back-indexes; authoritative for slot ownership
    pub sidx: [Option<usize>; 2],
}

impl Track {
    fn new(laddr: [IpAddr; 2]) -> Self {
        Self {
            sockets: [None, None],
            ports: [0, 0],
            laddr,
            remote: [None, None],
            asymmetric: [false, false],
            can_update: [false, false],
            pcount: [0; 4],
            recorders: [None, None],
            sidx: [None, None],
        }
    }
}

/// One media stream with its RTCP twin
pub struct Session {
    /// Opaque call identity from the controller
    pub call_id: String,
    /// Tag of the creating leg, possibly carrying `;<medianum>`
    pub tag: String,
    /// Primary track, even port
    pub rtp: Track,
    /// Twin track, odd port
    pub rtcp: Track,
    /// Repacketizer per direction, RTP only
    pub resizers: [RtpResizer; 2],
    /// Prompt players per direction, RTP only
    pub players: [Option<RtpPlayer>; 2],
    /// Strong liveness hold
    pub strong: bool,
    /// Weak liveness holds per direction
    pub weak: [bool; 2],
    /// Ticks until expiry; refreshed by commands and authentic media
    pub ttl: i32,
    /// Both local port pairs bound; relaying enabled
    pub complete: bool,
    /// Back-index into the player registry
    pub sridx: Option<usize>,
}

impl Session {
    pub fn new(call_id: &str, tag: &str, laddr: [IpAddr; 2], ttl: i32) -> Self {
        Self {
            call_id: call_id.to_string(),
            tag: tag.to_string(),
            rtp: Track::new(laddr),
            rtcp: Track::new(laddr),
            resizers: [RtpResizer::new(), RtpResizer::new()],
            players: [None, None],
            strong: false,
            weak: [false, false],
            ttl,
            complete: false,
            sridx: None,
        }
    }

    pub fn track(&self, kind: TrackKind) -> &Track {
        match kind {
            TrackKind::Rtp => &self.rtp,
            TrackKind::Rtcp => &self.rtcp,
        }
    }

    pub fn track_mut(&mut self, kind: TrackKind) -> &mut Track {
        match kind {
            TrackKind::Rtp => &mut self.rtp,
            TrackKind::Rtcp => &mut self.rtcp,
        }
    }

    /// Whether any liveness hold keeps the session alive
    pub fn held(&self) -> bool {
        self.strong || self.weak[0] || self.weak[1]
    }

    /// Whether either direction has an active player
    pub fn playing(&self) -> bool {
        self.players[0].is_some() || self.players[1].is_some()
    }

    /// Final accounting, logged on teardown
    pub fn log_stats(&self) {
        info!(
            call_id = %self.call_id,
            "RTP stats: {} in from callee, {} in from caller, {} relayed, {} dropped",
            self.rtp.pcount[0], self.rtp.pcount[1], self.rtp.pcount[2], self.rtp.pcount[3]
        );
        info!(
            call_id = %self.call_id,
            "RTCP stats: {} in from callee, {} in from caller, {} relayed, {} dropped",
            self.rtcp.pcount[0], self.rtcp.pcount[1], self.rtcp.pcount[2], self.rtcp.pcount[3]
        );
        info!(
            call_id = %self.call_id,
            "session on ports {}/{} is cleaned up",
            self.rtp.ports[0], self.rtp.ports[1]
        );
    }
}
