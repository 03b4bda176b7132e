//! RTP media primitives for the rtpanchor relay.
//!
//! This crate carries the media-side collaborators of the relay engine:
//! the RTP packet model, the repacketizer (resizer), the synthetic
//! prompt player, and the packet capture sink. The relay engine itself
//! lives in `rtpanchor-relay-core`.

pub mod error;
pub mod packet;
pub mod player;
pub mod record;
pub mod resizer;

pub use error::Error;

/// Result type alias for rtp-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// RTP sequence number type
pub type RtpSequenceNumber = u16;

/// RTP timestamp type
pub type RtpTimestamp = u32;

/// RTP synchronization source identifier type
pub type RtpSsrc = u32;

/// Sample clock shared by every codec the relay touches (Hz)
pub const RTP_SRATE: u32 = 8000;
