//! Control channel transport
//!
//! The controller speaks over a UNIX stream socket (one command per
//! accepted connection, no cookie) or a UDP[6] datagram socket (cookie
//! echoed per datagram). The descriptor occupies row 0 of the poll table
//! and is never closed while the daemon runs.

use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;
use tracing::{error, warn};

use crate::command::handle_command;
use crate::config::{Config, ControlMode};
use crate::registry::Registry;
use crate::resolver::{resolve_bind_host, Family};
use crate::{Result, CPORT};

/// Largest control command accepted
const CTRL_BUF_SIZE: usize = 1024 * 8;

/// Reads a slow stream client for at most this long
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The bound control channel
pub enum ControlTransport {
    Stream(UnixListener),
    Datagram(UdpSocket),
}

impl ControlTransport {
    /// Bind the control channel per configuration. Fatal on failure;
    /// there is no relay without a controller.
    pub fn bind(cfg: &Config) -> Result<Self> {
        match cfg.umode {
            ControlMode::Unix => {
                let _ = std::fs::remove_file(&cfg.cmd_sock);
                let listener = UnixListener::bind(&cfg.cmd_sock)?;
                listener.set_nonblocking(true)?;
                Ok(ControlTransport::Stream(listener))
            }
            ControlMode::Udp | ControlMode::Udp6 => {
                let family = if cfg.umode == ControlMode::Udp6 {
                    Family::V6
                } else {
                    Family::V4
                };
                let (host, port) = match cfg.cmd_sock.rsplit_once(':') {
                    Some((h, p)) if !p.is_empty() && !h.is_empty() => (h, p),
                    _ => (cfg.cmd_sock.as_str(), CPORT),
                };
                let ip = resolve_bind_host(host, family)?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| crate::Error::Config(format!("bad control port: {}", port)))?;
                let socket = UdpSocket::bind(SocketAddr::new(ip, port))?;
                socket.set_nonblocking(true)?;
                Ok(ControlTransport::Datagram(socket))
            }
        }
    }

    /// Descriptor for poll row 0
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            ControlTransport::Stream(listener) => listener.as_raw_fd(),
            ControlTransport::Datagram(socket) => socket.as_raw_fd(),
        }
    }

    /// Drain and answer every pending command. Called once per loop
    /// iteration when row 0 polls readable.
    pub fn process(&self, cfg: &Config, reg: &mut Registry) {
        match self {
            ControlTransport::Stream(listener) => loop {
                match listener.accept() {
                    Ok((stream, _)) => handle_stream_client(cfg, reg, stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("can't accept connection on control socket: {}", e);
                        break;
                    }
                }
            },
            ControlTransport::Datagram(socket) => {
                let mut buf = [0u8; CTRL_BUF_SIZE];
                loop {
                    let (len, peer) = match socket.recv_from(&mut buf) {
                        Ok(ok) => ok,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!("can't read from control socket: {}", e);
                            break;
                        }
                    };
                    for chunk in handle_command(cfg, reg, &buf[..len], true) {
                        send_datagram_reply(socket, &chunk, peer);
                    }
                }
            }
        }
    }

    /// Remove the socket path at shutdown (UNIX mode only)
    pub fn cleanup(&self, cfg: &Config) {
        if matches!(self, ControlTransport::Stream(_)) {
            let _ = std::fs::remove_file(Path::new(&cfg.cmd_sock));
        }
    }
}

fn handle_stream_client(cfg: &Config, reg: &mut Registry, mut stream: std::os::unix::net::UnixStream) {
    // One command per connection; a stalled client is abandoned after
    // the read timeout rather than wedging the loop.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(STREAM_READ_TIMEOUT));

    let mut buf = [0u8; CTRL_BUF_SIZE];
    let len = loop {
        match stream.read(&mut buf) {
            Ok(len) => break len,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                std::thread::yield_now();
            }
            Err(e) => {
                warn!("can't read from control connection: {}", e);
                return;
            }
        }
    };
    if len == 0 {
        return;
    }
    for chunk in handle_command(cfg, reg, &buf[..len], false) {
        if let Err(e) = stream.write_all(&chunk) {
            warn!("can't write control reply: {}", e);
            return;
        }
    }
}

/// Datagram replies retry on ENOBUFS only; other errors are dropped
/// like any other UDP loss.
fn send_datagram_reply(socket: &UdpSocket, chunk: &[u8], peer: SocketAddr) {
    loop {
        match socket.send_to(chunk, peer) {
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => continue,
            _ => break,
        }
    }
}
