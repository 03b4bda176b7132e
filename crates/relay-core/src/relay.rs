//! Packet forwarding and NAT address learning
//!
//! One sweep over the poll table per loop iteration: dead rows are
//! compacted in place, readable sockets are drained up to `DRAIN_MAX`
//! datagrams, and due resizer output is flushed. Media sends are fire
//! and forget: UDP is lossy by design, so send errors (including
//! would-block and partial sends) are deliberately ignored and only the
//! per-session counters account for the flow.

use bytes::Bytes;
use tracing::info;

use rtpanchor_rtp_core::packet::{ReceivedPacket, RtpPacket, RTP_MAX_PACKET_SIZE};

use crate::config::Config;
use crate::registry::Registry;
use crate::resolver::is_host_eq;
use crate::session::{Session, SessionRef, TrackKind};
use crate::{DRAIN_MAX, LBR_THRS};

/// Counter slots: input is the direction index, 2 relays, 3 drops
const PCOUNT_RELAYED: usize = 2;
const PCOUNT_DROPPED: usize = 3;

/// Relay sweep: compact holes left by removed sessions, drain readable
/// descriptors, and flush due resizer output.
pub fn process_media(cfg: &Config, reg: &mut Registry, now: f64) {
    let mut skipfd = 0;
    let nsessions = reg.nsessions();

    for readyfd in 1..nsessions {
        if reg.poll_fd(readyfd) == -1 {
            // Deleted session, count and move on
            skipfd += 1;
            continue;
        }
        if skipfd > 0 {
            reg.shift_row(readyfd, readyfd - skipfd);
        }
        let row = readyfd - skipfd;
        let Some(slot) = reg.slot(row) else {
            continue;
        };
        let sp = slot.session.clone();
        let track = slot.track;
        let ridx = slot.dir;

        if !sp.borrow().complete {
            continue;
        }
        if reg.revents(row) & libc::POLLIN != 0 {
            drain_socket(cfg, &sp, track, ridx, now);
        }
        if track == TrackKind::Rtp {
            let mut session = sp.borrow_mut();
            if session.resizers[ridx].output_nsamples() > 0 {
                while let Some(resized) = session.resizers[ridx].get(now) {
                    let src = session.rtp.remote[ridx];
                    let pkt = ReceivedPacket {
                        data: resized.serialize(),
                        src: src.unwrap_or_else(|| {
                            std::net::SocketAddr::from(([0, 0, 0, 0], 0))
                        }),
                        rtime: now,
                    };
                    send_packet(cfg, &mut session, track, ridx, &pkt);
                }
            }
        }
    }

    reg.truncate_rows(skipfd);
}

/// Drain up to `DRAIN_MAX` datagrams from one descriptor, authenticate
/// each against the learned remote, learn addresses where permitted, and
/// relay.
fn drain_socket(cfg: &Config, sp: &SessionRef, track: TrackKind, ridx: usize, now: f64) {
    let mut session = sp.borrow_mut();
    let mut buf = [0u8; RTP_MAX_PACKET_SIZE];

    for _ in 0..DRAIN_MAX {
        let received = {
            let t = session.track(track);
            let Some(socket) = t.sockets[ridx].as_ref() else {
                return;
            };
            socket.recv_from(&mut buf)
        };
        let (len, src) = match received {
            Ok(ok) => ok,
            Err(_) => break,
        };
        let packet = ReceivedPacket {
            data: Bytes::copy_from_slice(&buf[..len]),
            src,
            rtime: now,
        };

        // Authenticity check; unauthentic packets are dropped silently
        // because good ones may still be queued behind them.
        let mut update = false;
        {
            let t = session.track_mut(track);
            match t.remote[ridx] {
                Some(remote) => {
                    if t.asymmetric[ridx] {
                        if !is_host_eq(remote, src) {
                            continue;
                        }
                    } else if remote != src {
                        if !t.can_update[ridx] {
                            continue;
                        }
                        update = true;
                    }
                    t.pcount[ridx] += 1;
                }
                None => {
                    t.pcount[ridx] += 1;
                    update = true;
                }
            }
        }

        if update {
            learn_address(&mut session, track, ridx, src);
        }

        if track == TrackKind::Rtp && session.resizers[ridx].output_nsamples() > 0 {
            match RtpPacket::parse(&packet.data) {
                Ok(parsed) => {
                    if session.resizers[ridx].enqueue(parsed, now).is_some() {
                        // Not resizable; relay the original bytes
                        send_packet(cfg, &mut session, track, ridx, &packet);
                    }
                }
                // Unparsable datagrams bypass the resizer entirely
                Err(_) => send_packet(cfg, &mut session, track, ridx, &packet),
            }
        } else {
            send_packet(cfg, &mut session, track, ridx, &packet);
        }
    }
}

/// Record a freshly observed remote and latch it. Learning on the RTP
/// track also guesses the RTCP twin's remote as the same host one port
/// up, which serves non-NAT'd clients and many NAT'd ones.
fn learn_address(session: &mut Session, track: TrackKind, ridx: usize, src: std::net::SocketAddr) {
    {
        let t = session.track_mut(track);
        t.remote[ridx] = Some(src);
        t.can_update[ridx] = false;
    }
    info!(
        call_id = %session.call_id,
        "{}'s address filled in: {} ({})",
        if ridx == 0 { "callee" } else { "caller" },
        src,
        match track {
            TrackKind::Rtp => "RTP",
            TrackKind::Rtcp => "RTCP",
        }
    );

    if track != TrackKind::Rtp {
        return;
    }
    let twin = &mut session.rtcp;
    let stale = match twin.remote[ridx] {
        None => true,
        Some(current) => !is_host_eq(current, src),
    };
    if stale {
        let guessed = std::net::SocketAddr::new(src.ip(), src.port().wrapping_add(1));
        twin.remote[ridx] = Some(guessed);
        // The guess is authoritative for asymmetric peers
        twin.can_update[ridx] = !twin.asymmetric[ridx];
        info!(
            call_id = %session.call_id,
            "guessing RTCP port for {} to be {}",
            if ridx == 0 { "callee" } else { "caller" },
            guessed.port()
        );
    }
}

/// Send one packet out the opposite direction, applying the playback
/// suppression, double-send, and recording policies.
pub(crate) fn send_packet(
    cfg: &Config,
    session: &mut Session,
    track: TrackKind,
    ridx: usize,
    packet: &ReceivedPacket,
) {
    session.ttl = cfg.max_ttl;

    let sidx = 1 - ridx;
    // An active player owns the outbound direction of both tracks
    let suppressed = session.players[sidx].is_some();
    let recording = session.players[ridx].is_none();

    {
        let t = session.track_mut(track);
        match t.remote[sidx] {
            Some(remote) if !suppressed => {
                t.pcount[PCOUNT_RELAYED] += 1;
                let times = if cfg.dmode && packet.size() < LBR_THRS { 2 } else { 1 };
                if let Some(socket) = t.sockets[sidx].as_ref() {
                    for _ in 0..times {
                        let _ = socket.send_to(&packet.data, remote);
                    }
                }
            }
            _ => {
                t.pcount[PCOUNT_DROPPED] += 1;
            }
        }
    }

    if recording {
        if let Some(recorder) = session.track_mut(track).recorders[ridx].as_mut() {
            recorder.write(packet);
        }
    }
}
