//! RTP repacketizer
//!
//! Reframes a media stream so every outbound packet carries a target
//! number of samples. G.711 payloads are cut and merged freely; framed
//! codecs (GSM, G.723, G.729) merge only on whole-frame boundaries.
//! Packets the resizer cannot account for pass through unchanged.

use bytes::BytesMut;
use std::collections::VecDeque;
use tracing::debug;

use crate::packet::{PayloadType, RtpPacket};
use crate::RTP_SRATE;

struct QueuedChunk {
    payload: bytes::Bytes,
    nsamples: u32,
    marker: bool,
    rtime: f64,
}

/// Repacketizer state for one flow direction
pub struct RtpResizer {
    output_nsamples: u32,
    queue: VecDeque<QueuedChunk>,
    queued_samples: u32,
    /// Stream identity of the queued data
    payload_type: Option<PayloadType>,
    ssrc: u32,
    /// Timestamp of the first queued sample
    base_ts: u32,
    /// Next expected input sequence number
    next_in_seq: u16,
    /// Output sequence counter, seeded from the first queued packet
    out_seq: u16,
    seeded: bool,
}

impl RtpResizer {
    pub fn new() -> Self {
        Self {
            output_nsamples: 0,
            queue: VecDeque::new(),
            queued_samples: 0,
            payload_type: None,
            ssrc: 0,
            base_ts: 0,
            next_in_seq: 0,
            out_seq: 0,
            seeded: false,
        }
    }

    /// Target packet size in samples; 0 disables resizing
    pub fn output_nsamples(&self) -> u32 {
        self.output_nsamples
    }

    /// Change the target size. Disabling drops any queued audio.
    pub fn set_output_nsamples(&mut self, nsamples: u32) {
        self.output_nsamples = nsamples;
        if nsamples == 0 {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.queued_samples = 0;
        self.payload_type = None;
        self.seeded = false;
    }

    /// Offer a packet to the resizer. Returns the packet back when it
    /// cannot be reframed (unknown payload framing, sequence or
    /// timestamp discontinuity, stream change); `None` means the packet
    /// was queued and its audio will come back out of [`get`].
    ///
    /// [`get`]: RtpResizer::get
    pub fn enqueue(&mut self, packet: RtpPacket, rtime: f64) -> Option<RtpPacket> {
        let pt = match PayloadType::from_wire(packet.header.payload_type) {
            Some(pt) => pt,
            None => return Some(packet),
        };
        let nsamples = match pt.samples(packet.payload.len()) {
            Some(n) if n > 0 => n,
            _ => return Some(packet),
        };

        if !self.queue.is_empty() {
            let continuous = self.payload_type == Some(pt)
                && self.ssrc == packet.header.ssrc
                && packet.header.sequence_number == self.next_in_seq
                && packet.header.timestamp
                    == self.base_ts.wrapping_add(self.queued_samples);
            if !continuous {
                debug!(
                    seq = packet.header.sequence_number,
                    expected = self.next_in_seq,
                    "resizer discontinuity, passing packet through"
                );
                return Some(packet);
            }
        } else {
            self.payload_type = Some(pt);
            self.ssrc = packet.header.ssrc;
            self.base_ts = packet.header.timestamp;
            if !self.seeded {
                self.out_seq = packet.header.sequence_number;
                self.seeded = true;
            }
        }

        self.next_in_seq = packet.header.sequence_number.wrapping_add(1);
        self.queued_samples += nsamples;
        self.queue.push_back(QueuedChunk {
            payload: packet.payload,
            nsamples,
            marker: packet.header.marker,
            rtime,
        });
        None
    }

    /// Pull the next reframed packet, if one is due at `now`. Due means
    /// enough samples are queued for a full output packet, or the oldest
    /// queued audio has waited longer than one output duration.
    pub fn get(&mut self, now: f64) -> Option<RtpPacket> {
        let oldest = self.queue.front()?;
        let horizon = f64::from(self.output_nsamples) / f64::from(RTP_SRATE);
        if self.queued_samples < self.output_nsamples && now - oldest.rtime < horizon {
            return None;
        }

        let pt = self.payload_type?;
        let mut payload = BytesMut::new();
        let mut taken: u32 = 0;
        let mut marker = false;

        while taken < self.output_nsamples {
            let Some(chunk) = self.queue.front_mut() else {
                break;
            };
            let want = self.output_nsamples - taken;
            if chunk.nsamples <= want {
                marker |= chunk.marker;
                taken += chunk.nsamples;
                payload.extend_from_slice(&chunk.payload);
                self.queue.pop_front();
            } else if pt.splittable() {
                // G.711: one byte per sample, cut the front off
                marker |= chunk.marker;
                chunk.marker = false;
                payload.extend_from_slice(&chunk.payload.split_to(want as usize));
                chunk.nsamples -= want;
                taken += want;
            } else {
                // Next frame does not fit; ship what we have
                break;
            }
        }

        if taken == 0 {
            return None;
        }

        let mut out = RtpPacket::new_with_payload(
            pt.to_wire(),
            self.out_seq,
            self.base_ts,
            self.ssrc,
            payload.freeze(),
        );
        out.header.marker = marker;
        self.out_seq = self.out_seq.wrapping_add(1);
        self.base_ts = self.base_ts.wrapping_add(taken);
        self.queued_samples -= taken;
        Some(out)
    }
}

impl Default for RtpResizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pcmu(seq: u16, ts: u32, len: usize) -> RtpPacket {
        RtpPacket::new_with_payload(0, seq, ts, 0x1234, Bytes::from(vec![0x7fu8; len]))
    }

    #[test]
    fn merges_small_packets() {
        let mut rz = RtpResizer::new();
        rz.set_output_nsamples(160);
        assert!(rz.enqueue(pcmu(10, 0, 80), 0.0).is_none());
        assert!(rz.get(0.0).is_none());
        assert!(rz.enqueue(pcmu(11, 80, 80), 0.01).is_none());
        let out = rz.get(0.01).expect("one full packet");
        assert_eq!(out.payload.len(), 160);
        assert_eq!(out.header.sequence_number, 10);
        assert_eq!(out.header.timestamp, 0);
        assert!(rz.get(0.01).is_none());
    }

    #[test]
    fn splits_large_packets() {
        let mut rz = RtpResizer::new();
        rz.set_output_nsamples(160);
        assert!(rz.enqueue(pcmu(5, 1000, 400), 0.0).is_none());
        let a = rz.get(0.0).unwrap();
        let b = rz.get(0.0).unwrap();
        assert_eq!(a.payload.len(), 160);
        assert_eq!(b.payload.len(), 160);
        assert_eq!(a.header.sequence_number + 1, b.header.sequence_number);
        assert_eq!(b.header.timestamp, 1160);
        // 80 trailing samples only flush once they age past the horizon
        assert!(rz.get(0.0).is_none());
        let c = rz.get(0.05).unwrap();
        assert_eq!(c.payload.len(), 80);
    }

    #[test]
    fn passthrough_on_unknown_payload() {
        let mut rz = RtpResizer::new();
        rz.set_output_nsamples(160);
        let dyn_pt =
            RtpPacket::new_with_payload(96, 1, 0, 0x1, Bytes::from_static(&[0u8; 20]));
        assert!(rz.enqueue(dyn_pt, 0.0).is_some());
    }

    #[test]
    fn passthrough_on_discontinuity() {
        let mut rz = RtpResizer::new();
        rz.set_output_nsamples(160);
        assert!(rz.enqueue(pcmu(10, 0, 80), 0.0).is_none());
        // Sequence gap
        assert!(rz.enqueue(pcmu(14, 320, 80), 0.0).is_some());
        // Queue intact, drains on the age horizon
        let out = rz.get(1.0).unwrap();
        assert_eq!(out.payload.len(), 80);
    }

    #[test]
    fn whole_frames_only_for_gsm() {
        let mut rz = RtpResizer::new();
        rz.set_output_nsamples(160);
        let gsm = RtpPacket::new_with_payload(3, 1, 0, 0x1, Bytes::from(vec![0u8; 33]));
        assert!(rz.enqueue(gsm, 0.0).is_none());
        let out = rz.get(0.0).unwrap();
        assert_eq!(out.payload.len(), 33);
        assert_eq!(out.nsamples(), Some(160));
    }
}
