//! Control-protocol dispatcher
//!
//! One command per line (stream mode) or datagram (UDP mode, where the
//! first token is a cookie echoed back in the reply). The verb is the
//! first character of the first real token; trailing characters are
//! modifiers (or the repeat count for `P`). Errors are reported as
//! `E<code>` with stable numeric codes and never terminate the loop.

use bytes::Bytes;
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

use rtpanchor_rtp_core::player::RtpPlayer;
use rtpanchor_rtp_core::record::{RecordKind, Recorder};

use crate::config::Config;
use crate::error::CommandError;
use crate::listener::create_listener;
use crate::registry::Registry;
use crate::resolver::{format_reply_host, is_host_null, parse_remote, Family};
use crate::session::{compare_session_tags, Session, SessionRef, TagMatch, TrackKind};
use crate::{CPROTOVER, MAX_ARGS, PROTO_CAPS};

/// Reply buffer high-water mark before the info dump flushes a chunk
const REPLY_CHUNK: usize = 1024 * 8 - 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Update,
    Lookup,
    Delete,
    Play,
    Record,
    Noplay,
}

impl Verb {
    /// Direction selected by a from-tag match. The to-tag selects the
    /// opposite one.
    fn from_tag_dir(self) -> usize {
        match self {
            // Only a request's from-tag names the callee-facing side
            // whose local port we hand out; every other verb resolves
            // the from-tag to the caller side.
            Verb::Update => 0,
            _ => 1,
        }
    }
}

/// Modifier state accumulated from the verb token's tail
struct Modifiers {
    asymmetric: bool,
    family: Family,
    weak: bool,
    requested_nsamples: Option<u32>,
    /// Local address selection, one per direction
    lia: [IpAddr; 2],
}

/// Process one command and produce the reply chunks to send. Multiple
/// chunks only occur for large info dumps.
pub fn handle_command(cfg: &Config, reg: &mut Registry, line: &[u8], umode: bool) -> Vec<Bytes> {
    let text = String::from_utf8_lossy(line);
    debug!("received command \"{}\"", text.trim_end());

    let argv: Vec<&str> = text
        .split(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
        .filter(|t| !t.is_empty())
        .take(MAX_ARGS)
        .collect();
    if argv.is_empty() || (umode && argv.len() < 2) {
        error!("command syntax error");
        return vec![error_reply(None, &CommandError::Empty)];
    }

    // Stream communication mode doesn't use a cookie
    let (cookie, argv): (Option<&str>, &[&str]) = if umode {
        (Some(argv[0]), &argv[1..])
    } else {
        (None, &argv[..])
    };

    let replies = match dispatch(cfg, reg, cookie, argv) {
        Ok(replies) => replies,
        Err(e) => {
            error!("{}", e);
            vec![error_reply(cookie, &e)]
        }
    };
    for chunk in &replies {
        debug!(
            "sending reply \"{}\"",
            String::from_utf8_lossy(chunk).trim_end()
        );
    }
    replies
}

fn dispatch(
    cfg: &Config,
    reg: &mut Registry,
    cookie: Option<&str>,
    argv: &[&str],
) -> Result<Vec<Bytes>, CommandError> {
    let arg0 = argv[0];
    let verb_char = arg0.chars().next().unwrap_or('\0').to_ascii_lowercase();
    let mods_str = &arg0[arg0.char_indices().nth(1).map(|(i, _)| i).unwrap_or(arg0.len())..];

    let verb = match verb_char {
        'u' => Verb::Update,
        'l' => Verb::Lookup,
        'd' => Verb::Delete,
        'p' => Verb::Play,
        'r' => Verb::Record,
        's' => Verb::Noplay,
        'v' => return cmd_version(cookie, argv),
        'i' => return Ok(cmd_info(reg, cookie)),
        _ => return Err(CommandError::UnknownVerb),
    };

    // Arity and argument layout per verb class
    let (call_id, from_tag, to_tag, addr, port, pname, codecs, play_count);
    match verb {
        Verb::Update | Verb::Lookup | Verb::Play => {
            if argv.len() < 5 || argv.len() > 6 {
                return Err(CommandError::RequestArity);
            }
            call_id = argv[1];
            from_tag = argv[4];
            to_tag = argv.get(5).copied();
            if verb == Verb::Play {
                pname = argv[2];
                codecs = argv[3];
                addr = None;
                port = None;
                play_count = if mods_str.is_empty() { 1 } else { atoi(mods_str) };
            } else {
                addr = Some(argv[2]);
                port = Some(argv[3]);
                pname = "";
                codecs = "";
                play_count = 0;
            }
        }
        Verb::Delete | Verb::Record | Verb::Noplay => {
            if argv.len() < 3 || argv.len() > 4 {
                return Err(CommandError::Syntax);
            }
            call_id = argv[1];
            from_tag = argv[2];
            to_tag = argv.get(3).copied();
            addr = None;
            port = None;
            pname = "";
            codecs = "";
            play_count = 0;
        }
    }

    // Modifier rules: U/L take the full set, D only the weak flag,
    // R and S none at all.
    let mods = match verb {
        Verb::Update | Verb::Lookup => parse_modifiers(cfg, mods_str)?,
        Verb::Delete => {
            if !mods_str.chars().all(|c| c.eq_ignore_ascii_case(&'w')) {
                return Err(CommandError::Syntax);
            }
            let mut mods = default_modifiers(cfg);
            mods.weak = !mods_str.is_empty();
            mods
        }
        Verb::Record | Verb::Noplay => {
            if !mods_str.is_empty() {
                return Err(CommandError::Syntax);
            }
            default_modifiers(cfg)
        }
        Verb::Play => default_modifiers(cfg),
    };

    // Remote endpoint supplied with U/L; unusable addresses are skipped
    // without failing the command.
    let remote = match (addr, port) {
        (Some(a), Some(p)) => parse_remote(a, p, mods.family),
        _ => None,
    };

    // Scan for sessions of this call and tag set
    let mut ndeleted = 0usize;
    let mut found: Option<(SessionRef, usize, TagMatch)> = None;
    let mut i = 1;
    while i < reg.nsessions() {
        let entry = match reg.slot(i) {
            Some(slot) if slot.track == TrackKind::Rtp && slot.dir == 0 => slot.session.clone(),
            _ => {
                i += 1;
                continue;
            }
        };
        let matched = {
            let s = entry.borrow();
            if s.call_id != call_id {
                None
            } else if let Some(m) = compare_session_tags(&s.tag, from_tag) {
                Some((verb.from_tag_dir(), m))
            } else {
                to_tag
                    .and_then(|t| compare_session_tags(&s.tag, t))
                    .map(|m| (1 - verb.from_tag_dir(), m))
            }
        };
        let Some((dir, cmpr)) = matched else {
            i += 1;
            continue;
        };

        if verb == Verb::Delete {
            let medianum = match cmpr {
                TagMatch::Prefix { medianum } => medianum,
                TagMatch::Exact => 0,
            };
            let mut s = entry.borrow_mut();
            if mods.weak {
                s.weak[dir] = false;
            } else {
                s.strong = false;
            }
            if s.held() {
                // This is stable over reiteration; the only cost is a
                // less efficient scan.
                info!(
                    call_id = %s.call_id,
                    "delete: medianum={}: removing {} flag, seeing flags to continue session (strong={}, weak={}/{})",
                    medianum,
                    if mods.weak { if dir == 1 { "weak[1]" } else { "weak[0]" } } else { "strong" },
                    s.strong, s.weak[0], s.weak[1]
                );
                ndeleted += 1;
                i += 1;
                continue;
            }
            info!(
                call_id = %s.call_id,
                "forcefully deleting session {} on ports {}/{}",
                medianum, s.rtp.ports[0], s.rtp.ports[1]
            );
            drop(s);
            reg.remove_session(&entry);
            if matches!(cmpr, TagMatch::Prefix { .. }) {
                ndeleted += 1;
                i += 1;
                continue;
            }
            return Ok(vec![ok_reply(cookie)]);
        }

        found = Some((entry, dir, cmpr));
        break;
    }

    if verb == Verb::Delete {
        // Multiple stream deleting stops here because the full list had
        // to be iterated.
        return if ndeleted != 0 {
            Ok(vec![ok_reply(cookie)])
        } else {
            log_not_found(verb, call_id, from_tag, to_tag);
            Err(CommandError::NotFound)
        };
    }

    match found {
        Some((sp, dir, _)) => match verb {
            Verb::Play | Verb::Noplay => {
                cmd_play(reg, cookie, &sp, dir, verb, pname, codecs, play_count)
            }
            Verb::Record => Ok(cmd_record(cfg, cookie, &sp, dir)),
            Verb::Update | Verb::Lookup => {
                cmd_update_existing(cfg, reg, cookie, &sp, dir, verb, &mods, remote)
            }
            Verb::Delete => unreachable!("handled in the scan"),
        },
        None => {
            match verb {
                Verb::Update => cmd_create(cfg, reg, cookie, call_id, from_tag, &mods, remote),
                Verb::Lookup => {
                    log_not_found(verb, call_id, from_tag, to_tag);
                    // A failed lookup reports "no binding" rather than
                    // an error
                    Ok(vec![port_reply(cookie, 0, Some(mods.lia[0]))])
                }
                _ => {
                    log_not_found(verb, call_id, from_tag, to_tag);
                    Err(CommandError::NotFound)
                }
            }
        }
    }
}

fn default_modifiers(cfg: &Config) -> Modifiers {
    let bind0 = cfg.bind_addr[0].unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    Modifiers {
        // In bridge mode all clients are assumed to be asymmetric
        asymmetric: cfg.bmode,
        family: Family::V4,
        weak: false,
        requested_nsamples: None,
        lia: [bind0, bind0],
    }
}

fn parse_modifiers(cfg: &Config, mods_str: &str) -> Result<Modifiers, CommandError> {
    let mut mods = default_modifiers(cfg);
    let mut lidx: i32 = 1;
    let mut chars = mods_str.chars().peekable();
    while let Some(c) = chars.next() {
        match c.to_ascii_lowercase() {
            'a' => mods.asymmetric = true,
            's' => mods.asymmetric = false,
            '6' => mods.family = Family::V6,
            'w' => mods.weak = true,
            'e' => {
                if lidx < 0 {
                    return Err(CommandError::Syntax);
                }
                if let Some(addr) = cfg.bind_addr[1] {
                    mods.lia[lidx as usize] = addr;
                }
                lidx -= 1;
            }
            'i' => {
                if lidx < 0 {
                    return Err(CommandError::Syntax);
                }
                if let Some(addr) = cfg.bind_addr[0] {
                    mods.lia[lidx as usize] = addr;
                }
                lidx -= 1;
            }
            'z' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() || (*d == '-' && digits.is_empty()) {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ms: i64 = digits.parse().unwrap_or(0);
                let nsamples = (ms / 10) * 80;
                if nsamples <= 0 {
                    return Err(CommandError::Syntax);
                }
                mods.requested_nsamples = Some(nsamples as u32);
            }
            other => {
                error!("unknown command modifier `{}'", other);
            }
        }
    }
    Ok(mods)
}

fn cmd_version(cookie: Option<&str>, argv: &[&str]) -> Result<Vec<Bytes>, CommandError> {
    let arg0 = argv[0];
    if arg0.as_bytes().get(1).is_some_and(|b| b.eq_ignore_ascii_case(&b'f')) {
        // Protocol version date-stamp query
        if argv.len() != 2 && argv.len() != 3 {
            return Err(CommandError::VersionArity);
        }
        let known = PROTO_CAPS.iter().any(|(id, _)| *id == argv[1]);
        return Ok(vec![text_reply(cookie, &format!("{}", known as u8))]);
    }
    if argv.len() != 1 && argv.len() != 2 {
        return Err(CommandError::VersionArity);
    }
    Ok(vec![text_reply(cookie, &CPROTOVER.to_string())])
}

fn cmd_info(reg: &Registry, cookie: Option<&str>) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    if let Some(cookie) = cookie {
        buf.push_str(cookie);
        buf.push(' ');
    }
    buf.push_str(&format!(
        "sessions created: {}\nactive sessions: {}\n",
        reg.sessions_created,
        reg.active_sessions()
    ));

    for i in 1..reg.nsessions() {
        let Some(slot) = reg.slot(i) else { continue };
        if slot.track != TrackKind::Rtp || slot.dir != 0 {
            continue;
        }
        let s = slot.session.borrow();
        for (prefix, track) in [("\t", &s.rtp), ("\tC ", &s.rtcp)] {
            buf.push_str(&format!(
                "{}{}/{}: caller = {}:{}/{}, callee = {}:{}/{}, stats = {}/{}/{}/{}, ttl = {}\n",
                prefix,
                s.call_id,
                s.tag,
                track.laddr[1],
                track.ports[1],
                track.remote[1]
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "NONE".to_string()),
                track.laddr[0],
                track.ports[0],
                track.remote[0]
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "NONE".to_string()),
                track.pcount[0],
                track.pcount[1],
                track.pcount[2],
                track.pcount[3],
                s.ttl
            ));
        }
        if buf.len() > REPLY_CHUNK {
            chunks.push(Bytes::from(std::mem::take(&mut buf)));
        }
    }
    if !buf.is_empty() {
        chunks.push(Bytes::from(buf));
    }
    chunks
}

#[allow(clippy::too_many_arguments)]
fn cmd_play(
    reg: &mut Registry,
    cookie: Option<&str>,
    sp: &SessionRef,
    dir: usize,
    verb: Verb,
    pname: &str,
    codecs: &str,
    play_count: i32,
) -> Result<Vec<Bytes>, CommandError> {
    {
        let mut s = sp.borrow_mut();
        if s.players[dir].take().is_some() {
            info!(
                call_id = %s.call_id,
                "stopping player at port {}", s.rtp.ports[dir]
            );
        }
        let playing = s.playing();
        drop(s);
        if !playing {
            reg.clear_player(sp);
        }
    }
    if verb == Verb::Noplay || play_count == 0 {
        return Ok(vec![ok_reply(cookie)]);
    }

    for codec in codecs.split(',') {
        let Ok(codec) = codec.trim().parse::<u8>() else {
            continue;
        };
        match RtpPlayer::new(pname, codec, play_count) {
            Ok(player) => {
                let mut s = sp.borrow_mut();
                info!(
                    call_id = %s.call_id,
                    "{} times playing prompt {} codec {}", play_count, pname, codec
                );
                s.players[dir] = Some(player);
                drop(s);
                reg.append_player(sp);
                return Ok(vec![ok_reply(cookie)]);
            }
            Err(e) => {
                debug!("prompt {} codec {}: {}", pname, codec, e);
            }
        }
    }
    Err(CommandError::PlayerCreate)
}

fn cmd_record(cfg: &Config, cookie: Option<&str>, sp: &SessionRef, dir: usize) -> Vec<Bytes> {
    if let Some(rdir) = cfg.rdir.as_deref() {
        let mut s = sp.borrow_mut();
        let call_id = s.call_id.clone();
        let tag = s.tag.clone();
        if s.rtp.recorders[dir].is_none() {
            match Recorder::open(rdir, cfg.sdir.as_deref(), &call_id, &tag, dir, RecordKind::Rtp) {
                Ok(rec) => {
                    info!(
                        call_id = %call_id,
                        "starting recording RTP session on port {}", s.rtp.ports[dir]
                    );
                    s.rtp.recorders[dir] = Some(rec);
                }
                Err(e) => warn!(call_id = %call_id, "can't start recording: {}", e),
            }
        }
        if s.rtcp.recorders[dir].is_none() && cfg.rrtcp {
            match Recorder::open(rdir, cfg.sdir.as_deref(), &call_id, &tag, dir, RecordKind::Rtcp) {
                Ok(rec) => {
                    info!(
                        call_id = %call_id,
                        "starting recording RTCP session on port {}", s.rtcp.ports[dir]
                    );
                    s.rtcp.recorders[dir] = Some(rec);
                }
                Err(e) => warn!(call_id = %call_id, "can't start recording: {}", e),
            }
        }
    }
    vec![ok_reply(cookie)]
}

fn cmd_update_existing(
    cfg: &Config,
    reg: &mut Registry,
    cookie: Option<&str>,
    sp: &SessionRef,
    dir: usize,
    verb: Verb,
    mods: &Modifiers,
    remote: Option<std::net::SocketAddr>,
) -> Result<Vec<Bytes>, CommandError> {
    if sp.borrow().rtp.sockets[dir].is_none() {
        // First command for this side: bind its local port pair
        let laddr = sp.borrow().rtp.laddr[dir];
        let j = cfg.cursor_for(laddr);
        let twin = create_listener(cfg, laddr, reg.next_port[j]).map_err(|e| {
            error!("{}", e);
            CommandError::ListenerExisting
        })?;
        reg.next_port[j] = twin.port.wrapping_add(2);
        {
            let mut s = sp.borrow_mut();
            s.rtp.ports[dir] = twin.port;
            s.rtcp.ports[dir] = twin.port + 1;
            s.rtp.sockets[dir] = Some(twin.rtp);
            s.rtcp.sockets[dir] = Some(twin.rtcp);
            s.complete = true;
        }
        reg.append(sp, TrackKind::Rtp, dir);
        reg.append(sp, TrackKind::Rtcp, dir);
    }

    let (lport, lia0) = {
        let mut s = sp.borrow_mut();
        if mods.weak {
            s.weak[dir] = true;
        } else if verb == Verb::Update {
            s.strong = true;
        }
        s.ttl = cfg.max_ttl;
        if verb == Verb::Update {
            info!(
                call_id = %s.call_id,
                "adding {} flag to existing session, new={}/{}/{}",
                if mods.weak { if dir == 1 { "weak[1]" } else { "weak[0]" } } else { "strong" },
                s.strong, s.weak[0], s.weak[1]
            );
        }
        info!(
            call_id = %s.call_id,
            "lookup on ports {}/{}, session timer restarted", s.rtp.ports[0], s.rtp.ports[1]
        );
        (s.rtp.ports[dir], s.rtp.laddr[dir])
    };

    let pidx = 1 - dir;
    apply_peer_binding(sp, pidx, mods, remote, true);
    Ok(vec![port_reply(cookie, lport, Some(lia0))])
}

fn cmd_create(
    cfg: &Config,
    reg: &mut Registry,
    cookie: Option<&str>,
    call_id: &str,
    from_tag: &str,
    mods: &Modifiers,
    remote: Option<std::net::SocketAddr>,
) -> Result<Vec<Bytes>, CommandError> {
    info!(
        "new session {}, tag {} requested, type {}",
        call_id,
        from_tag,
        if mods.weak { "weak" } else { "strong" }
    );

    let j = cfg.cursor_for(mods.lia[0]);
    let bind = cfg.bind_addr[j].unwrap_or(mods.lia[0]);
    let twin = create_listener(cfg, bind, reg.next_port[j]).map_err(|e| {
        error!("{}", e);
        CommandError::ListenerCreate
    })?;
    reg.next_port[j] = twin.port.wrapping_add(2);

    let mut session = Session::new(call_id, from_tag, mods.lia, cfg.max_ttl);
    if mods.weak {
        session.weak[0] = true;
    } else {
        session.strong = true;
    }
    session.rtp.ports[0] = twin.port;
    session.rtcp.ports[0] = twin.port + 1;
    session.rtp.sockets[0] = Some(twin.rtp);
    session.rtcp.sockets[0] = Some(twin.rtcp);
    let lport = twin.port;

    let sp: SessionRef = std::rc::Rc::new(std::cell::RefCell::new(session));
    reg.append(&sp, TrackKind::Rtp, 0);
    reg.append(&sp, TrackKind::Rtp, 1);
    reg.append(&sp, TrackKind::Rtcp, 0);
    reg.append(&sp, TrackKind::Rtcp, 1);
    reg.sessions_created += 1;

    info!(
        call_id = %call_id,
        "new session on a port {} created, tag {}", lport, from_tag
    );

    apply_peer_binding(&sp, 1, mods, remote, true);
    Ok(vec![port_reply(cookie, lport, Some(mods.lia[0]))])
}

/// Pre-fill the peer's remote address (when supplied and different from
/// what is stored), re-arm the authenticity mode, and configure
/// repacketization for the side `pidx`.
fn apply_peer_binding(
    sp: &SessionRef,
    pidx: usize,
    mods: &Modifiers,
    remote: Option<std::net::SocketAddr>,
    set_resizer: bool,
) {
    let mut s = sp.borrow_mut();
    if let Some(addr) = remote {
        if s.rtp.remote[pidx] != Some(addr) {
            info!(
                call_id = %s.call_id,
                "pre-filling {}'s address with {}",
                if pidx == 0 { "callee" } else { "caller" },
                addr
            );
            s.rtp.remote[pidx] = Some(addr);
        }
        let rtcp_addr = std::net::SocketAddr::new(addr.ip(), addr.port().wrapping_add(1));
        if s.rtcp.remote[pidx] != Some(rtcp_addr) {
            s.rtcp.remote[pidx] = Some(rtcp_addr);
        }
    }
    s.rtp.asymmetric[pidx] = mods.asymmetric;
    s.rtcp.asymmetric[pidx] = mods.asymmetric;
    s.rtp.can_update[pidx] = !mods.asymmetric;
    s.rtcp.can_update[pidx] = !mods.asymmetric;

    if set_resizer {
        match mods.requested_nsamples {
            Some(nsamples) => {
                info!(
                    call_id = %s.call_id,
                    "RTP packets from {} will be resized to {} milliseconds",
                    if pidx == 0 { "callee" } else { "caller" },
                    nsamples / 8
                );
                s.resizers[pidx].set_output_nsamples(nsamples);
            }
            None => {
                if s.resizers[pidx].output_nsamples() > 0 {
                    info!(
                        call_id = %s.call_id,
                        "Resizing of RTP packets from {} has been disabled",
                        if pidx == 0 { "callee" } else { "caller" }
                    );
                }
                s.resizers[pidx].set_output_nsamples(0);
            }
        }
    }
}

fn log_not_found(verb: Verb, call_id: &str, from_tag: &str, to_tag: Option<&str>) {
    let rname = match verb {
        Verb::Delete => "delete",
        Verb::Play => "play",
        Verb::Noplay => "noplay",
        Verb::Record => "record",
        Verb::Lookup => "lookup",
        Verb::Update => "update",
    };
    info!(
        "{} request failed: session {}, tags {}/{} not found",
        rname,
        call_id,
        from_tag,
        to_tag.unwrap_or("NONE")
    );
}

/// C-style integer prefix parse: optional sign, leading digits, junk 0
fn atoi(s: &str) -> i32 {
    let mut out: i64 = 0;
    let mut neg = false;
    let mut seen = false;
    for (i, c) in s.chars().enumerate() {
        match c {
            '-' if i == 0 => neg = true,
            '+' if i == 0 => {}
            d if d.is_ascii_digit() => {
                seen = true;
                out = out.saturating_mul(10).saturating_add((d as u8 - b'0') as i64);
            }
            _ => break,
        }
    }
    if !seen {
        return 0;
    }
    let out = if neg { -out } else { out };
    out.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn prefix(cookie: Option<&str>) -> String {
    match cookie {
        Some(c) => format!("{} ", c),
        None => String::new(),
    }
}

fn ok_reply(cookie: Option<&str>) -> Bytes {
    Bytes::from(format!("{}0\n", prefix(cookie)))
}

fn text_reply(cookie: Option<&str>, body: &str) -> Bytes {
    Bytes::from(format!("{}{}\n", prefix(cookie), body))
}

fn error_reply(cookie: Option<&str>, err: &CommandError) -> Bytes {
    Bytes::from(format!("{}E{}\n", prefix(cookie), err.code()))
}

fn port_reply(cookie: Option<&str>, lport: u16, lia0: Option<IpAddr>) -> Bytes {
    match lia0 {
        Some(ip) if !is_host_null(ip) => Bytes::from(format!(
            "{}{} {}\n",
            prefix(cookie),
            lport,
            format_reply_host(ip)
        )),
        _ => Bytes::from(format!("{}{}\n", prefix(cookie), lport)),
    }
}
