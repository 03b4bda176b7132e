//! RTP packet model according to RFC 3550
//!
//! Only the parts of RTP the relay actually touches are modelled here:
//! the fixed header (plus CSRC list and extension skipping), the payload,
//! and per-payload-type sample accounting used by the resizer and the
//! prompt player. SRTP, header extensions, and RTCP compound parsing are
//! out of scope.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Largest datagram the relay will accept or build
pub const RTP_MAX_PACKET_SIZE: usize = 8192;

/// Payload types with framing the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Pcmu,
    Gsm,
    G723,
    Pcma,
    Cn,
    G729,
}

impl PayloadType {
    /// Map a wire payload-type number to a known codec
    pub fn from_wire(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(PayloadType::Pcmu),
            3 => Some(PayloadType::Gsm),
            4 => Some(PayloadType::G723),
            8 => Some(PayloadType::Pcma),
            13 => Some(PayloadType::Cn),
            18 => Some(PayloadType::G729),
            _ => None,
        }
    }

    /// Wire payload-type number
    pub fn to_wire(self) -> u8 {
        match self {
            PayloadType::Pcmu => 0,
            PayloadType::Gsm => 3,
            PayloadType::G723 => 4,
            PayloadType::Pcma => 8,
            PayloadType::Cn => 13,
            PayloadType::G729 => 18,
        }
    }

    /// Codec frame geometry: (bytes per frame, samples per frame).
    ///
    /// G.711 is byte-per-sample and reframes freely; the frame reported
    /// here is the 10 ms granule the player and resizer schedule on.
    pub fn frame(self) -> Option<(usize, u32)> {
        match self {
            PayloadType::Pcmu | PayloadType::Pcma => Some((80, 80)),
            PayloadType::Gsm => Some((33, 160)),
            PayloadType::G723 => Some((24, 240)),
            PayloadType::G729 => Some((10, 80)),
            PayloadType::Cn => None,
        }
    }

    /// Number of samples carried by `len` payload bytes, if the length
    /// fits the codec framing.
    pub fn samples(self, len: usize) -> Option<u32> {
        match self {
            PayloadType::Pcmu | PayloadType::Pcma => Some(len as u32),
            PayloadType::Cn => None,
            _ => {
                let (fbytes, fsamples) = self.frame()?;
                if len > 0 && len % fbytes == 0 {
                    Some((len / fbytes) as u32 * fsamples)
                } else {
                    None
                }
            }
        }
    }

    /// Whether payloads of this type may be cut at arbitrary sample
    /// boundaries (true only for G.711).
    pub fn splittable(self) -> bool {
        matches!(self, PayloadType::Pcmu | PayloadType::Pcma)
    }
}

/// RTP fixed header plus CSRC list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: RtpSequenceNumber,
    /// Timestamp
    pub timestamp: RtpTimestamp,
    /// Synchronization source identifier
    pub ssrc: RtpSsrc,
    /// Contributing source identifiers
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    /// Create a new header with default flags
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    /// Serialized size of the header in bytes
    pub fn size(&self) -> usize {
        RTP_MIN_HEADER_SIZE + self.csrc.len() * 4
    }

    /// Parse a header from the front of `data`, returning the header and
    /// the offset of the payload (past CSRCs and any extension block).
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::PacketTooShort { size: data.len() });
        }

        let mut buf = data;
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        let padding = (b0 & 0x20) != 0;
        let extension = (b0 & 0x10) != 0;
        let cc = (b0 & 0x0F) as usize;

        let b1 = buf.get_u8();
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut needed = RTP_MIN_HEADER_SIZE + cc * 4;
        if data.len() < needed {
            return Err(Error::TruncatedHeader {
                needed,
                available: data.len(),
            });
        }
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(buf.get_u32());
        }

        if extension {
            needed += 4;
            if data.len() < needed {
                return Err(Error::TruncatedHeader {
                    needed,
                    available: data.len(),
                });
            }
            let _profile = buf.get_u16();
            let ext_words = buf.get_u16() as usize;
            needed += ext_words * 4;
            if data.len() < needed {
                return Err(Error::TruncatedHeader {
                    needed,
                    available: data.len(),
                });
            }
            buf.advance(ext_words * 4);
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
            },
            needed,
        ))
    }

    /// Serialize the header into `buf`. Extension data is never emitted;
    /// relayed packets keep their original bytes, and generated packets
    /// carry no extensions.
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut b0 = (RTP_VERSION << 6) | (self.csrc.len() as u8 & 0x0F);
        if self.padding {
            b0 |= 0x20;
        }
        buf.put_u8(b0);

        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
    }
}

/// An RTP packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data, padding already stripped
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new RTP packet with the standard header fields and payload
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self {
            header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc),
            payload,
        }
    }

    /// Parse a full RTP packet. Padding bytes flagged in the header are
    /// removed from the payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (mut header, offset) = RtpHeader::parse(data)?;
        let mut payload_end = data.len();
        if header.padding {
            let pad = *data.last().unwrap_or(&0) as usize;
            if pad == 0 || offset + pad > payload_end {
                return Err(Error::TruncatedHeader {
                    needed: offset + pad,
                    available: data.len(),
                });
            }
            payload_end -= pad;
            header.padding = false;
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[offset..payload_end]),
        })
    }

    /// Total serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Serialize the packet to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Samples carried by this packet, if the payload type is countable
    pub fn nsamples(&self) -> Option<u32> {
        PayloadType::from_wire(self.header.payload_type)?.samples(self.payload.len())
    }
}

/// A datagram as it came off a media socket, before any RTP
/// interpretation. The forwarder relays these verbatim; only the
/// resizer parses them.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    /// Raw datagram bytes
    pub data: Bytes,
    /// Source address of the datagram
    pub src: SocketAddr,
    /// Receive time, seconds on the relay's monotonic clock
    pub rtime: f64,
}

impl ReceivedPacket {
    /// Datagram size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let pkt = RtpPacket::new_with_payload(
            0,
            1000,
            160,
            0xdecafbad,
            Bytes::from_static(&[0x55; 160]),
        );
        pkt.serialize().to_vec()
    }

    #[test]
    fn parse_roundtrip() {
        let wire = sample_packet();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.payload_type, 0);
        assert_eq!(parsed.header.sequence_number, 1000);
        assert_eq!(parsed.header.timestamp, 160);
        assert_eq!(parsed.header.ssrc, 0xdecafbad);
        assert_eq!(parsed.payload.len(), 160);
        assert_eq!(parsed.serialize().to_vec(), wire);
    }

    #[test]
    fn rejects_short_and_bad_version() {
        assert!(matches!(
            RtpPacket::parse(&[0x80, 0x00, 0x01]),
            Err(Error::PacketTooShort { .. })
        ));
        let mut wire = sample_packet();
        wire[0] = 0x40; // version 1
        assert!(matches!(
            RtpPacket::parse(&wire),
            Err(Error::UnsupportedVersion { version: 1 })
        ));
    }

    #[test]
    fn strips_padding() {
        let mut wire = sample_packet();
        wire[0] |= 0x20;
        wire.extend_from_slice(&[0, 0, 3]);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.payload.len(), 160);
        assert!(!parsed.header.padding);
    }

    #[test]
    fn skips_csrc_and_extension() {
        let mut wire = vec![
            0x92, 0xe0, 0x12, 0x34, // v2, ext, cc=2; marker, pt=96
            0x00, 0x00, 0x00, 0x50, // ts
            0x11, 0x22, 0x33, 0x44, // ssrc
            0xaa, 0xaa, 0xaa, 0xaa, // csrc 1
            0xbb, 0xbb, 0xbb, 0xbb, // csrc 2
            0xbe, 0xde, 0x00, 0x01, // ext header, 1 word
            0x01, 0x02, 0x03, 0x04, // ext data
        ];
        wire.extend_from_slice(b"payload");
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.csrc.len(), 2);
        assert!(parsed.header.marker);
        assert_eq!(parsed.header.payload_type, 96);
        assert_eq!(&parsed.payload[..], b"payload");
    }

    #[test]
    fn sample_accounting() {
        assert_eq!(PayloadType::from_wire(0).unwrap().samples(160), Some(160));
        assert_eq!(PayloadType::from_wire(8).unwrap().samples(80), Some(80));
        assert_eq!(PayloadType::from_wire(3).unwrap().samples(66), Some(320));
        assert_eq!(PayloadType::from_wire(3).unwrap().samples(40), None);
        assert_eq!(PayloadType::from_wire(18).unwrap().samples(20), Some(160));
        assert_eq!(PayloadType::from_wire(13).unwrap().samples(4), None);
        assert!(PayloadType::from_wire(96).is_none());
    }
}
