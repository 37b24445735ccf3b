use std::collections::VecDeque;
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::RawFd;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, trace};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::select::Socket;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

#[derive(Debug)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Error,
    Closed,
    None,
    ConnectingTcp,
    ConnectedTcp,
    WaitingForUpgrade,
    ConnectedWebSocket,
}

/// A client-side WebSocket connection driven by the reactor. All I/O is
/// non-blocking; decoded messages queue in an inbox the owning session
/// drains between reactor passes.
pub struct WebSocket {
    url: String,
    host_header: String,
    fd: RawFd,
    state: State,
    error: Option<String>,
    client_key: String,
    send_buffer: Vec<u8>,
    recv_buffer: Vec<u8>,
    upgrade_request: Vec<u8>,
    response_headers: Vec<(String, String)>,
    inbox: VecDeque<Message>,
    fragment_opcode: u8,
    fragment: Vec<u8>,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(())
}

fn accept_key_for(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

impl WebSocket {
    /// Parses the `ws://` URL, resolves the host, and starts a
    /// non-blocking connect. The handshake proceeds inside the reactor.
    pub fn connect(url: &str, headers: &[(String, String)]) -> crate::Result<WebSocket> {
        let parsed = url::Url::parse(url)
            .map_err(|e| crate::Error::from(format!("bad url {url}: {e}")))?;
        if parsed.scheme() != "ws" {
            return Err(crate::Error::from(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| crate::Error::from(format!("no host in {url}")))?
            .to_string();
        let port = parsed.port().unwrap_or(80);
        let path = if parsed.path().is_empty() {
            "/"
        } else {
            parsed.path()
        };

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| crate::Error::from(format!("can't resolve {host}: {e}")))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| crate::Error::from(format!("no address for {host}")))?;

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(crate::Error::Io(io::Error::last_os_error()));
        }
        set_nonblocking(fd)?;

        let mut key_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let client_key = BASE64.encode(key_bytes);

        let host_header = format!("{host}:{port}");
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {client_key}\r\n"
        );
        for (name, value) in headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        let mut ws = WebSocket {
            url: url.to_string(),
            host_header,
            fd,
            state: State::ConnectingTcp,
            error: None,
            client_key,
            send_buffer: Vec::new(),
            recv_buffer: Vec::new(),
            upgrade_request: request.into_bytes(),
            response_headers: Vec::new(),
            inbox: VecDeque::new(),
            fragment_opcode: 0,
            fragment: Vec::new(),
        };

        let std::net::SocketAddr::V4(v4) = addr else {
            unreachable!();
        };
        let sockaddr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            ws.state = State::ConnectedTcp;
            ws.request_upgrade();
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                ws.fail(format!("connect to {} failed: {err}", ws.host_header));
                return Err(crate::Error::from(ws.error.clone().unwrap()));
            }
        }
        debug!("Connecting to {url}");
        Ok(ws)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    pub fn handshake_response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Enqueues one text or binary frame; the reactor drains the buffer.
    pub fn send(&mut self, kind: MessageType, payload: &[u8]) {
        let opcode = match kind {
            MessageType::Text => OP_TEXT,
            MessageType::Binary => OP_BINARY,
        };
        encode_frame(&mut self.send_buffer, opcode, payload, true);
    }

    pub fn close(&mut self, reason: &str) {
        if self.state == State::ConnectedWebSocket {
            let mut payload = Vec::with_capacity(2 + reason.len());
            payload.extend_from_slice(&1000u16.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
            encode_frame(&mut self.send_buffer, OP_CLOSE, &payload, true);
            self.flush();
        }
        self.shutdown(State::Closed);
    }

    fn shutdown(&mut self, state: State) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
        self.state = state;
    }

    fn fail(&mut self, message: String) {
        error!("{message}");
        self.error = Some(message);
        self.shutdown(State::Error);
    }

    fn request_upgrade(&mut self) {
        let request = std::mem::take(&mut self.upgrade_request);
        self.send_buffer.extend_from_slice(&request);
        self.state = State::WaitingForUpgrade;
        self.flush();
    }

    fn flush(&mut self) {
        while !self.send_buffer.is_empty() && self.fd >= 0 {
            let n = unsafe {
                libc::write(
                    self.fd,
                    self.send_buffer.as_ptr().cast(),
                    self.send_buffer.len(),
                )
            };
            if n > 0 {
                self.send_buffer.drain(..n as usize);
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                _ => {
                    self.fail(format!("write to {} failed: {err}", self.url));
                    break;
                }
            }
        }
    }

    fn accept_upgrade(&mut self) {
        let Some(end) = self
            .recv_buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        else {
            return;
        };
        let head = self.recv_buffer.drain(..end + 4).collect::<Vec<u8>>();
        let head = String::from_utf8_lossy(&head).into_owned();
        let mut lines = head.split("\r\n");
        let status = lines.next().unwrap_or("");
        if !status.starts_with("HTTP/1.1 101") && !status.starts_with("HTTP/1.0 101") {
            self.fail(format!("upgrade refused by {}: {status}", self.url));
            return;
        }
        self.response_headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let expected = accept_key_for(&self.client_key);
        match self.handshake_response_header("sec-websocket-accept") {
            Some(accept) if accept == expected => {
                debug!("Upgraded {}", self.url);
                self.state = State::ConnectedWebSocket;
                // leftover bytes after the upgrade head may already hold frames
                self.decode_frames();
            }
            other => {
                let got = other.unwrap_or("<missing>").to_string();
                self.fail(format!("bad Sec-WebSocket-Accept from {}: {got}", self.url));
            }
        }
    }

    fn decode_frames(&mut self) {
        loop {
            let Some((frame, consumed)) = decode_frame(&self.recv_buffer) else {
                return;
            };
            self.recv_buffer.drain(..consumed);
            let Frame {
                fin,
                opcode,
                payload,
            } = frame;
            match opcode {
                OP_PING => {
                    encode_frame(&mut self.send_buffer, OP_PONG, &payload, true);
                }
                OP_PONG => {}
                OP_CLOSE => {
                    debug!("Close frame from {}", self.url);
                    self.shutdown(State::Closed);
                    return;
                }
                OP_TEXT | OP_BINARY | OP_CONTINUATION => {
                    if opcode != OP_CONTINUATION {
                        self.fragment_opcode = opcode;
                        self.fragment.clear();
                    }
                    self.fragment.extend_from_slice(&payload);
                    if fin {
                        let kind = if self.fragment_opcode == OP_TEXT {
                            MessageType::Text
                        } else {
                            MessageType::Binary
                        };
                        let payload = std::mem::take(&mut self.fragment);
                        trace!("Message of {} bytes from {}", payload.len(), self.url);
                        self.inbox.push_back(Message { kind, payload });
                    }
                }
                other => {
                    self.fail(format!("unsupported opcode {other:#x} from {}", self.url));
                    return;
                }
            }
        }
    }
}

impl Socket for WebSocket {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn mode(&self) -> (bool, bool) {
        match self.state {
            State::ConnectingTcp | State::ConnectedTcp => (false, true),
            State::WaitingForUpgrade | State::ConnectedWebSocket => {
                (true, !self.send_buffer.is_empty())
            }
            State::None | State::Closed | State::Error => (false, false),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn on_read(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                self.recv_buffer.extend_from_slice(&buf[..n as usize]);
                continue;
            }
            if n == 0 {
                debug!("Peer closed {}", self.url);
                self.shutdown(State::Closed);
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                _ => {
                    self.fail(format!("read from {} failed: {err}", self.url));
                    return;
                }
            }
        }
        match self.state {
            State::WaitingForUpgrade => self.accept_upgrade(),
            State::ConnectedWebSocket => self.decode_frames(),
            _ => {}
        }
    }

    fn on_write(&mut self) {
        match self.state {
            State::ConnectingTcp => {
                let mut so_error: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let ret = unsafe {
                    libc::getsockopt(
                        self.fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        (&mut so_error as *mut libc::c_int).cast(),
                        &mut len,
                    )
                };
                if ret != 0 {
                    self.fail(format!(
                        "getsockopt failed: {}",
                        io::Error::last_os_error()
                    ));
                } else if so_error == 0 {
                    debug!("TCP connected to {}", self.host_header);
                    self.state = State::ConnectedTcp;
                    self.request_upgrade();
                } else if so_error != libc::EINPROGRESS {
                    self.fail(format!(
                        "connect to {} failed: {}",
                        self.host_header,
                        io::Error::from_raw_os_error(so_error)
                    ));
                }
            }
            State::ConnectedTcp => self.request_upgrade(),
            _ => self.flush(),
        }
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

fn encode_frame(out: &mut Vec<u8>, opcode: u8, payload: &[u8], mask: bool) {
    out.push(0x80 | opcode);
    let mask_bit = if mask { 0x80 } else { 0 };
    if payload.len() < 126 {
        out.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.push(mask_bit | 126);
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, payload.len() as u16);
        out.extend_from_slice(&len);
    } else {
        out.push(mask_bit | 127);
        let mut len = [0u8; 8];
        BigEndian::write_u64(&mut len, payload.len() as u64);
        out.extend_from_slice(&len);
    }
    if mask {
        let mut key = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut key);
        out.extend_from_slice(&key);
        let start = out.len();
        out.extend_from_slice(payload);
        for (i, byte) in out[start..].iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    } else {
        out.extend_from_slice(payload);
    }
}

/// Decodes one frame from `data`, returning it and the number of bytes
/// consumed, or `None` if the buffer does not yet hold a complete frame.
fn decode_frame(data: &[u8]) -> Option<(Frame, usize)> {
    if data.len() < 2 {
        return None;
    }
    let fin = data[0] & 0x80 != 0;
    let opcode = data[0] & 0x0f;
    let masked = data[1] & 0x80 != 0;
    let mut len = (data[1] & 0x7f) as usize;
    let mut offset = 2;
    if len == 126 {
        if data.len() < offset + 2 {
            return None;
        }
        len = BigEndian::read_u16(&data[offset..]) as usize;
        offset += 2;
    } else if len == 127 {
        if data.len() < offset + 8 {
            return None;
        }
        len = BigEndian::read_u64(&data[offset..]) as usize;
        offset += 8;
    }
    let mask_key = if masked {
        if data.len() < offset + 4 {
            return None;
        }
        let key = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };
    if data.len() < offset + len {
        return None;
    }
    let mut payload = data[offset..offset + len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        offset + len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_6455_example() {
        assert_eq!(
            accept_key_for("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masked_frame_round_trips() {
        let payload = b"hello from the client".to_vec();
        let mut wire = Vec::new();
        encode_frame(&mut wire, OP_TEXT, &payload, true);
        let (frame, consumed) = decode_frame(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_TEXT);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn extended_lengths() {
        for size in [125usize, 126, 65535, 65536, 200_000] {
            let payload = vec![0xabu8; size];
            let mut wire = Vec::new();
            encode_frame(&mut wire, OP_BINARY, &payload, false);
            let (frame, consumed) = decode_frame(&wire).unwrap();
            assert_eq!(consumed, wire.len());
            assert_eq!(frame.payload.len(), size);
        }
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let mut wire = Vec::new();
        encode_frame(&mut wire, OP_BINARY, &[1, 2, 3, 4], false);
        for cut in 0..wire.len() {
            assert!(decode_frame(&wire[..cut]).is_none());
        }
    }

    #[test]
    fn frames_survive_concatenation() {
        let mut wire = Vec::new();
        encode_frame(&mut wire, OP_TEXT, b"first", true);
        encode_frame(&mut wire, OP_BINARY, b"second", true);
        let (one, used) = decode_frame(&wire).unwrap();
        assert_eq!(one.payload, b"first");
        let (two, _) = decode_frame(&wire[used..]).unwrap();
        assert_eq!(two.payload, b"second");
        assert_eq!(two.opcode, OP_BINARY);
    }
}
