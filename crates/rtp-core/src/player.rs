//! Synthetic RTP source for prompt playback
//!
//! Plays a pre-encoded prompt file toward a peer at wall-clock pacing.
//! A prompt is stored per codec as `<name>.<payload type>` containing the
//! raw encoded audio; the relay picks the first codec from the
//! controller's list for which such a file exists.

use bytes::Bytes;
use rand::Rng;
use std::fs;
use tracing::debug;

use crate::packet::{PayloadType, RtpPacket};
use crate::{Error, Result, RTP_SRATE};

/// What the player has for the scheduler at a given instant
#[derive(Debug)]
pub enum PlayerTick {
    /// Nothing due yet; ask again later
    Later,
    /// Playback completed; detach the player
    Eof,
    /// A datagram to send now
    Packet(RtpPacket),
}

/// Wall-clock paced synthetic RTP stream over a prompt file
pub struct RtpPlayer {
    codec: PayloadType,
    /// Frame geometry, fixed per codec
    frame_bytes: usize,
    frame_samples: u32,
    data: Vec<u8>,
    pos: usize,
    /// Repeats remaining; negative plays forever
    loops_left: i32,
    /// Time the first frame was handed out
    started: Option<f64>,
    frames_sent: u64,
    ssrc: u32,
    seq: u16,
    ts: u32,
    first: bool,
}

impl RtpPlayer {
    /// Open `<name>.<codec>` for playback, repeating `ntimes` times
    /// (negative for endless play).
    pub fn new(name: &str, codec_wire: u8, ntimes: i32) -> Result<Self> {
        let codec = PayloadType::from_wire(codec_wire).ok_or(Error::UnknownPayloadType {
            payload_type: codec_wire,
        })?;
        let (frame_bytes, frame_samples) = codec.frame().ok_or(Error::UnknownPayloadType {
            payload_type: codec_wire,
        })?;
        let path = format!("{}.{}", name, codec_wire);
        let data = fs::read(&path).map_err(|source| Error::PromptUnavailable {
            path: path.clone(),
            source,
        })?;
        if data.is_empty() {
            return Err(Error::PromptUnavailable {
                path,
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty prompt"),
            });
        }
        debug!(path, codec = codec_wire, ntimes, "prompt loaded");

        let mut rng = rand::thread_rng();
        Ok(Self {
            codec,
            frame_bytes,
            frame_samples,
            data,
            pos: 0,
            loops_left: ntimes,
            started: None,
            frames_sent: 0,
            ssrc: rng.gen(),
            seq: rng.gen(),
            ts: rng.gen(),
            first: true,
        })
    }

    /// Payload type this player emits
    pub fn payload_type(&self) -> u8 {
        self.codec.to_wire()
    }

    /// Produce the next event for the scheduler. Frames are due at
    /// `start + n * frame_duration`; the scheduler calls repeatedly
    /// until it sees [`PlayerTick::Later`] or [`PlayerTick::Eof`].
    pub fn get(&mut self, now: f64) -> PlayerTick {
        let (fbytes, fsamples) = (self.frame_bytes, self.frame_samples);
        let started = *self.started.get_or_insert(now);
        let frame_dur = f64::from(fsamples) / f64::from(RTP_SRATE);
        let due = started + self.frames_sent as f64 * frame_dur;
        if now < due {
            return PlayerTick::Later;
        }

        if self.pos >= self.data.len() {
            if self.loops_left > 0 {
                self.loops_left -= 1;
            }
            if self.loops_left == 0 {
                return PlayerTick::Eof;
            }
            self.pos = 0;
        }

        let end = usize::min(self.pos + fbytes, self.data.len());
        let payload = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;

        let mut packet =
            RtpPacket::new_with_payload(self.codec.to_wire(), self.seq, self.ts, self.ssrc, payload);
        packet.header.marker = self.first;
        self.first = false;
        self.seq = self.seq.wrapping_add(1);
        self.ts = self.ts.wrapping_add(fsamples);
        self.frames_sent += 1;
        PlayerTick::Packet(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_prompt(name: &str, codec: u8, len: usize) -> String {
        let mut path = PathBuf::from(std::env::temp_dir());
        path.push(format!("rtpanchor-player-{}-{}", std::process::id(), name));
        let base = path.to_str().unwrap().to_string();
        fs::write(format!("{}.{}", base, codec), vec![0x55u8; len]).unwrap();
        base
    }

    #[test]
    fn missing_prompt_fails_construction() {
        assert!(matches!(
            RtpPlayer::new("/nonexistent/prompt", 0, 1),
            Err(Error::PromptUnavailable { .. })
        ));
    }

    #[test]
    fn unknown_codec_fails_construction() {
        assert!(matches!(
            RtpPlayer::new("whatever", 96, 1),
            Err(Error::UnknownPayloadType { payload_type: 96 })
        ));
    }

    #[test]
    fn paces_frames_and_ends() {
        let base = write_prompt("pace", 0, 240);
        let mut player = RtpPlayer::new(&base, 0, 1).unwrap();

        let first = match player.get(100.0) {
            PlayerTick::Packet(p) => p,
            other => panic!("expected packet, got {:?}", other),
        };
        assert!(first.header.marker);
        assert_eq!(first.payload.len(), 80);

        // Second frame is not due for another 10 ms
        assert!(matches!(player.get(100.005), PlayerTick::Later));
        let second = match player.get(100.011) {
            PlayerTick::Packet(p) => p,
            other => panic!("expected packet, got {:?}", other),
        };
        assert!(!second.header.marker);
        assert_eq!(
            second.header.sequence_number,
            first.header.sequence_number.wrapping_add(1)
        );
        assert_eq!(
            second.header.timestamp,
            first.header.timestamp.wrapping_add(80)
        );

        assert!(matches!(player.get(100.021), PlayerTick::Packet(_)));
        assert!(matches!(player.get(100.031), PlayerTick::Eof));
    }

    #[test]
    fn repeats_prompt() {
        let base = write_prompt("loop", 0, 80);
        let mut player = RtpPlayer::new(&base, 0, 2).unwrap();
        assert!(matches!(player.get(0.0), PlayerTick::Packet(_)));
        assert!(matches!(player.get(0.011), PlayerTick::Packet(_)));
        assert!(matches!(player.get(0.021), PlayerTick::Eof));
    }
}
