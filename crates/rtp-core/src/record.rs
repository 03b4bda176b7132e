//! Packet capture sink for the record command
//!
//! One capture file per call leg and track. Each datagram is preceded by
//! a fixed preamble: receive time split into seconds and microseconds
//! (u32 each), address family (u8, 4 or 6), source port (u16), the raw
//! source address (4 or 16 bytes), and the datagram length (u16). All
//! integers are big-endian.

use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::packet::ReceivedPacket;
use crate::Result;

/// Which track a capture file records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Rtp,
    Rtcp,
}

impl RecordKind {
    fn suffix(self) -> &'static str {
        match self {
            RecordKind::Rtp => "rtp",
            RecordKind::Rtcp => "rtcp",
        }
    }
}

/// Append-only capture file for one direction of one track
pub struct Recorder {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
}

impl Recorder {
    /// Create the capture file
    /// `<rdir>[/<sdir>]/<call_id>=<tag>.<o|a>.<rtp|rtcp>`; direction 0
    /// (callee side) is `o`, direction 1 (caller side) is `a`.
    pub fn open(
        rdir: &Path,
        sdir: Option<&str>,
        call_id: &str,
        tag: &str,
        direction: usize,
        kind: RecordKind,
    ) -> Result<Self> {
        let mut dir = rdir.to_path_buf();
        if let Some(sdir) = sdir {
            dir.push(sdir);
        }
        let leg = if direction == 0 { 'o' } else { 'a' };
        let path = dir.join(format!("{}={}.{}.{}", call_id, tag, leg, kind.suffix()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!(path = %path.display(), "recording started");
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
        })
    }

    /// Append one datagram. A failed write disables the sink for the
    /// rest of the session; the media path is never affected.
    pub fn write(&mut self, packet: &ReceivedPacket) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let mut preamble = BytesMut::with_capacity(32);
        let secs = packet.rtime.trunc() as u32;
        let usecs = ((packet.rtime - packet.rtime.trunc()) * 1_000_000.0) as u32;
        preamble.put_u32(secs);
        preamble.put_u32(usecs);
        match packet.src.ip() {
            IpAddr::V4(ip) => {
                preamble.put_u8(4);
                preamble.put_u16(packet.src.port());
                preamble.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                preamble.put_u8(6);
                preamble.put_u16(packet.src.port());
                preamble.put_slice(&ip.octets());
            }
        }
        preamble.put_u16(packet.data.len() as u16);

        let result = writer
            .write_all(&preamble)
            .and_then(|_| writer.write_all(&packet.data));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "capture write failed, disabling recorder");
            self.writer = None;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}
