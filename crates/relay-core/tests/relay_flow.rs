//! End-to-end relay scenarios over real loopback sockets: session
//! creation through the control protocol, address learning from live
//! media, and forwarding between the two legs.

use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::time::Duration;

use rtpanchor_relay_core::command::handle_command;
use rtpanchor_relay_core::config::Config;
use rtpanchor_relay_core::registry::Registry;
use rtpanchor_relay_core::relay::process_media;

struct Relay {
    cfg: Config,
    reg: Registry,
    // Keeps the dummy control descriptor alive for the registry
    _control: UdpSocket,
}

fn relay(port_min: u16, port_max: u16) -> Relay {
    let mut cfg = Config::default();
    cfg.bind_addr[0] = Some("127.0.0.1".parse().unwrap());
    cfg.port_min = port_min;
    cfg.port_max = port_max;
    let control = UdpSocket::bind("127.0.0.1:0").unwrap();
    let reg = Registry::new(cfg.table_capacity(), control.as_raw_fd(), cfg.port_min);
    Relay {
        cfg,
        reg,
        _control: control,
    }
}

fn command(relay: &mut Relay, line: &str) -> String {
    let chunks = handle_command(&relay.cfg, &mut relay.reg, line.as_bytes(), true);
    chunks
        .iter()
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect()
}

fn reply_port(reply: &str) -> u16 {
    reply
        .split_whitespace()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .expect("port in reply")
}

fn pump(relay: &mut Relay) {
    // One loop iteration's worth of I/O: poll then sweep
    let _ = relay.reg.poll(200).unwrap();
    process_media(&relay.cfg, &mut relay.reg, 0.0);
}

fn recv_timeout(socket: &UdpSocket) -> Option<Vec<u8>> {
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 2048];
    match socket.recv_from(&mut buf) {
        Ok((n, _)) => Some(buf[..n].to_vec()),
        Err(_) => None,
    }
}

#[test]
fn create_learn_and_relay_both_ways() {
    let mut rl = relay(39000, 39100);
    let callee = UdpSocket::bind("127.0.0.1:0").unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
    let caller_addr = caller.local_addr().unwrap();
    let callee_addr = callee.local_addr().unwrap();

    // Controller allocates the callee-facing port, pre-filling the
    // caller's endpoint from the offer SDP
    let reply = command(
        &mut rl,
        &format!("c1 U call1 127.0.0.1 {} tagA", caller_addr.port()),
    );
    let callee_facing = reply_port(&reply);
    assert_eq!(callee_facing % 2, 0);

    // The answer binds the caller-facing port with the callee's endpoint
    let reply = command(
        &mut rl,
        &format!("c2 L call1 127.0.0.1 {} tagA tagB", callee_addr.port()),
    );
    let caller_facing = reply_port(&reply);
    assert_eq!(caller_facing % 2, 0);
    assert_ne!(caller_facing, callee_facing);

    // Callee to caller
    callee
        .send_to(b"\x80\x00from-callee", ("127.0.0.1", callee_facing))
        .unwrap();
    pump(&mut rl);
    assert_eq!(recv_timeout(&caller).unwrap(), b"\x80\x00from-callee");

    // Caller to callee
    caller
        .send_to(b"\x80\x00from-caller", ("127.0.0.1", caller_facing))
        .unwrap();
    pump(&mut rl);
    assert_eq!(recv_timeout(&callee).unwrap(), b"\x80\x00from-caller");
}

#[test]
fn nat_relearn_then_latch() {
    let mut rl = relay(39100, 39200);
    let callee = UdpSocket::bind("127.0.0.1:0").unwrap();
    let nat_peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let imposter = UdpSocket::bind("127.0.0.1:0").unwrap();

    // The controller believes the caller sits at a port that the NAT
    // has since rewritten
    let reply = command(&mut rl, "c1 U call1 127.0.0.1 5000 tagA");
    let callee_facing = reply_port(&reply);
    let reply = command(
        &mut rl,
        &format!(
            "c2 L call1 127.0.0.1 {} tagA tagB",
            callee.local_addr().unwrap().port()
        ),
    );
    let caller_facing = reply_port(&reply);

    // First packet from the real (rewritten) source re-learns the
    // address and is relayed
    nat_peer
        .send_to(b"\x80\x00real", ("127.0.0.1", caller_facing))
        .unwrap();
    pump(&mut rl);
    assert_eq!(recv_timeout(&callee).unwrap(), b"\x80\x00real");

    // The binding is now latched: a different source is dropped
    imposter
        .send_to(b"\x80\x00fake", ("127.0.0.1", caller_facing))
        .unwrap();
    pump(&mut rl);
    assert!(recv_timeout(&callee).is_none());

    // And media from the latched peer keeps flowing
    nat_peer
        .send_to(b"\x80\x00more", ("127.0.0.1", caller_facing))
        .unwrap();
    pump(&mut rl);
    assert_eq!(recv_timeout(&callee).unwrap(), b"\x80\x00more");
}

#[test]
fn sessions_never_share_ports() {
    let mut rl = relay(39200, 39300);
    let a = reply_port(&command(&mut rl, "c1 U call1 127.0.0.1 5000 tagA"));
    let b = reply_port(&command(&mut rl, "c2 U call2 127.0.0.1 5000 tagB"));
    let c = reply_port(&command(&mut rl, "c3 U call3 127.0.0.1 5000 tagC"));
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
    for port in [a, b, c] {
        assert_eq!(port % 2, 0);
        assert!((39200..=39300).contains(&port));
    }
}

#[test]
fn resized_stream_reframes_on_the_wire() {
    let mut rl = relay(39300, 39400);
    let callee = UdpSocket::bind("127.0.0.1:0").unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").unwrap();

    // Callee leg asks for 20 ms packets out of 10 ms input
    let reply = command(
        &mut rl,
        &format!(
            "c1 Uz20 call1 127.0.0.1 {} tagA",
            caller.local_addr().unwrap().port()
        ),
    );
    let callee_facing = reply_port(&reply);
    let reply = command(
        &mut rl,
        &format!(
            "c2 Lz20 call1 127.0.0.1 {} tagA tagB",
            callee.local_addr().unwrap().port()
        ),
    );
    let caller_facing = reply_port(&reply);
    let _ = caller_facing;

    // Two 80-sample PCMU packets in a row
    let mut pkt1 = vec![0x80u8, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x42];
    pkt1.extend_from_slice(&[0x55; 80]);
    let mut pkt2 = vec![0x80u8, 0x00, 0x00, 0x02, 0, 0, 0, 80, 0, 0, 0, 0x42];
    pkt2.extend_from_slice(&[0x66; 80]);

    callee
        .send_to(&pkt1, ("127.0.0.1", callee_facing))
        .unwrap();
    callee
        .send_to(&pkt2, ("127.0.0.1", callee_facing))
        .unwrap();
    pump(&mut rl);

    // One merged 160-sample packet comes out
    let merged = recv_timeout(&caller).unwrap();
    assert_eq!(merged.len(), 12 + 160);
    assert_eq!(&merged[12..92], &[0x55u8; 80][..]);
    assert_eq!(&merged[92..], &[0x66u8; 80][..]);
    assert!(recv_timeout(&caller).is_none());
}
