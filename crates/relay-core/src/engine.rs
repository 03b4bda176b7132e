//! The event loop
//!
//! Single-threaded and cooperative: one `poll` over every media socket
//! plus the control channel, a self-imposed pacing sleep that caps the
//! poll rate, the player scheduler, the forwarding sweep, the command
//! pump, and the 1 Hz TTL reaper. The only suspension points are the
//! poll itself and the pacing sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

use rtpanchor_rtp_core::player::PlayerTick;

use crate::config::Config;
use crate::control::ControlTransport;
use crate::registry::Registry;
use crate::relay::process_media;
use crate::session::TrackKind;
use crate::{LBR_THRS, POLL_LIMIT, RTPS_TICKS_MIN, TIMETICK};

/// Run the relay until `shutdown` is raised by a signal
pub fn run(cfg: &Config, reg: &mut Registry, control: &ControlTransport, shutdown: &AtomicBool) {
    let clock = Instant::now();
    let mut sptime = 0.0f64;
    let mut last_tick = 0.0f64;
    let min_interval = 1.0 / POLL_LIMIT as f64;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let timeout = if reg.nplayers() > 0 || reg.nsessions() > 1 {
            RTPS_TICKS_MIN
        } else {
            (TIMETICK * 1000) as i32
        };

        // Cap the poll rate; a busy relay would otherwise spin
        let eptime = clock.elapsed().as_secs_f64();
        let delay = eptime - sptime;
        if delay < min_interval {
            std::thread::sleep(Duration::from_secs_f64(min_interval - delay));
            sptime = clock.elapsed().as_secs_f64();
        } else {
            sptime = eptime;
        }

        let nready = match reg.poll(timeout) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("poll failed: {}", e);
                break;
            }
        };

        let eptime = clock.elapsed().as_secs_f64();
        if reg.nplayers() > 0 {
            process_players(cfg, reg, eptime);
        }
        process_media(cfg, reg, eptime);
        if nready > 0 && reg.revents(0) & libc::POLLIN != 0 {
            control.process(cfg, reg);
        }
        if eptime > last_tick + TIMETICK as f64 {
            reap_sessions(reg);
            last_tick = eptime;
        }
    }
}

/// Walk the player table, compacting holes, and pump every active
/// player: send each due datagram, detach players that reached end of
/// stream, and drop idle sessions from the table.
pub fn process_players(cfg: &Config, reg: &mut Registry, now: f64) {
    let mut skipfd = 0;
    let nplayers = reg.nplayers();

    for j in 0..nplayers {
        let Some(sp) = reg.player(j).cloned() else {
            skipfd += 1;
            continue;
        };
        if skipfd > 0 {
            reg.shift_player(j, j - skipfd);
        }

        let mut session = sp.borrow_mut();
        for sidx in 0..2 {
            let Some(remote) = session.rtp.remote[sidx] else {
                continue;
            };
            loop {
                let tick = match session.players[sidx].as_mut() {
                    Some(player) => player.get(now),
                    None => break,
                };
                match tick {
                    PlayerTick::Later => break,
                    PlayerTick::Eof => {
                        session.players[sidx] = None;
                        break;
                    }
                    PlayerTick::Packet(packet) => {
                        let data = packet.serialize();
                        if let Some(socket) = session.rtp.sockets[sidx].as_ref() {
                            let times = if cfg.dmode && data.len() < LBR_THRS { 2 } else { 1 };
                            for _ in 0..times {
                                let _ = socket.send_to(&data, remote);
                            }
                        }
                    }
                }
            }
        }
        let playing = session.playing();
        drop(session);
        if !playing {
            reg.clear_player(&sp);
        }
    }
    reg.truncate_players(skipfd);
}

/// The 1 Hz tick: expire sessions whose TTL ran out and age the rest.
/// Only canonical primary entries carry a TTL; twins are reaped through
/// their primary.
pub fn reap_sessions(reg: &mut Registry) {
    let mut expired = Vec::new();
    for i in 1..reg.nsessions() {
        let Some(slot) = reg.slot(i) else { continue };
        if slot.track != TrackKind::Rtp || slot.dir != 0 {
            continue;
        }
        let sp = slot.session.clone();
        let ttl = sp.borrow().ttl;
        if ttl == 0 {
            expired.push(sp);
        } else {
            sp.borrow_mut().ttl -= 1;
        }
    }
    for sp in expired {
        reg.expire_session(&sp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::handle_command;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn setup(port_min: u16, port_max: u16) -> (Config, Registry, UdpSocket) {
        let mut cfg = Config::default();
        cfg.bind_addr[0] = Some("127.0.0.1".parse().unwrap());
        cfg.port_min = port_min;
        cfg.port_max = port_max;
        // A dummy descriptor stands in for the control socket
        let control = UdpSocket::bind("127.0.0.1:0").unwrap();
        let reg = Registry::new(
            cfg.table_capacity(),
            std::os::fd::AsRawFd::as_raw_fd(&control),
            cfg.port_min,
        );
        (cfg, reg, control)
    }

    #[test]
    fn reaper_expires_sessions() {
        let (cfg, mut reg, _control) = setup(38300, 38400);
        handle_command(&cfg, &mut reg, b"c1 U call1 10.0.0.2 5000 tagA", true);
        let sp = reg.slot(1).unwrap().session.clone();
        assert_eq!(sp.borrow().ttl, cfg.max_ttl);

        sp.borrow_mut().ttl = 1;
        reap_sessions(&mut reg);
        assert_eq!(sp.borrow().ttl, 0);
        assert_eq!(reg.active_sessions(), 1);

        reap_sessions(&mut reg);
        // Holes remain until a sweep compacts them
        process_media(&cfg, &mut reg, 0.0);
        assert_eq!(reg.active_sessions(), 0);
    }

    #[test]
    fn player_scheduler_sends_toward_remote() {
        let (cfg, mut reg, _control) = setup(38400, 38500);
        handle_command(&cfg, &mut reg, b"c1 U call1 10.0.0.2 5000 tagA", true);
        handle_command(&cfg, &mut reg, b"c2 L call1 10.0.0.3 5002 tagA tagB", true);
        let sp = reg.slot(1).unwrap().session.clone();

        // Point the caller side at a local peer we can read
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        sp.borrow_mut().rtp.remote[1] = Some(peer.local_addr().unwrap());

        let prompt = std::env::temp_dir().join(format!("rtpanchor-eng-{}", std::process::id()));
        std::fs::write(format!("{}.0", prompt.display()), [0x55u8; 160]).unwrap();
        let line = format!("c3 P1 call1 {} 0 tagA", prompt.display());
        let reply = handle_command(&cfg, &mut reg, line.as_bytes(), true);
        assert_eq!(&reply[0][..], b"c3 0\n");
        assert_eq!(reg.nplayers(), 1);

        process_players(&cfg, &mut reg, 10.0);
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        // 12-byte RTP header plus one 80-sample PCMU frame
        assert_eq!(n, 92);

        // Both frames played out, the player detaches on its own
        process_players(&cfg, &mut reg, 10.011);
        process_players(&cfg, &mut reg, 10.022);
        assert!(!sp.borrow().playing());
        process_players(&cfg, &mut reg, 10.033);
        assert_eq!(reg.nplayers(), 0);
    }

    #[test]
    fn relay_suppressed_while_playing() {
        let (cfg, mut reg, _control) = setup(38500, 38600);
        handle_command(&cfg, &mut reg, b"c1 U call1 10.0.0.2 5000 tagA", true);
        handle_command(&cfg, &mut reg, b"c2 L call1 10.0.0.3 5002 tagA tagB", true);
        let sp = reg.slot(1).unwrap().session.clone();

        let prompt = std::env::temp_dir().join(format!("rtpanchor-sup-{}", std::process::id()));
        std::fs::write(format!("{}.0", prompt.display()), [0x55u8; 160]).unwrap();
        let line = format!("c3 P1 call1 {} 0 tagA", prompt.display());
        handle_command(&cfg, &mut reg, line.as_bytes(), true);

        // Media arriving for the playing side is counted as dropped
        let pkt = rtpanchor_rtp_core::packet::ReceivedPacket {
            data: bytes::Bytes::from_static(b"\x80\x00media"),
            src: "10.0.0.3:5002".parse().unwrap(),
            rtime: 0.0,
        };
        let mut s = sp.borrow_mut();
        crate::relay::send_packet(&cfg, &mut s, TrackKind::Rtp, 0, &pkt);
        assert_eq!(s.rtp.pcount[3], 1);
        assert_eq!(s.rtp.pcount[2], 0);
    }
}
