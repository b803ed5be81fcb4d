//! WebSocket upgrade handshake and frame codec (RFC 6455 framing).

use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{deliver, Event, EventHandler};
use crate::http::HttpMessage;

pub const OP_CONTINUATION: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// One WebSocket frame, fragments already joined for data frames.
/// Valid only during its dispatch.
pub struct WsFrame<'a> {
    pub payload: &'a [u8],
    /// First header byte: FIN, RSV bits and opcode.
    pub flags: u8,
}

impl<'a> WsFrame<'a> {
    pub fn fin(&self) -> bool {
        self.flags & 0x80 != 0
    }

    pub fn opcode(&self) -> u8 {
        self.flags & 0x0f
    }

    pub fn is_control(&self) -> bool {
        self.opcode() >= OP_CLOSE
    }

    pub fn text(&self) -> Option<&'a str> {
        std::str::from_utf8(self.payload).ok()
    }
}

/// `Sec-WebSocket-Accept` for a client key: SHA-1 over the key joined
/// with the magic GUID, base64-encoded.
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

struct FrameHeader {
    flags: u8,
    header_len: usize,
    payload_len: usize,
    mask: Option<[u8; 4]>,
}

/// Decodes the frame header at the start of `buf`. `Ok(None)` means
/// the header is not complete yet; payload sizes past `max_frame` are
/// a parse error.
fn parse_frame_header(buf: &[u8], max_frame: usize) -> Result<Option<FrameHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let flags = buf[0];
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7f) as usize;

    let (payload_len, mut header_len) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            let len = usize::try_from(len)
                .map_err(|_| Error::Parse("websocket frame too large".into()))?;
            (len, 10)
        }
        n => (n, 2),
    };
    if payload_len > max_frame {
        return Err(Error::Parse(format!(
            "websocket frame of {} bytes exceeds cap {}",
            payload_len, max_frame
        )));
    }

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        flags,
        header_len,
        payload_len,
        mask,
    }))
}

/// Consumes complete frames from the recv buffer, joining fragments
/// and dispatching WS_MSG/WS_CTL. PING is answered with a PONG
/// carrying the same payload; CLOSE is echoed and drains the
/// connection.
pub(crate) fn drive(
    conn: &mut Connection,
    fallback: Option<&Rc<dyn EventHandler>>,
    max_frame: usize,
) {
    loop {
        if conn.closing || conn.draining {
            return;
        }
        let header = match parse_frame_header(conn.recv.as_slice(), max_frame) {
            Ok(Some(h)) => h,
            Ok(None) => return,
            Err(e) => {
                conn.protocol_error("websocket", e);
                return;
            }
        };
        let total = header.header_len + header.payload_len;
        if conn.recv.len() < total {
            return;
        }

        let mut frame = conn.recv.take(total);
        if let Some(mask) = header.mask {
            for (i, byte) in frame[header.header_len..].iter_mut().enumerate() {
                *byte ^= mask[i & 3];
            }
        }
        let payload = &frame[header.header_len..];
        let fin = header.flags & 0x80 != 0;
        let opcode = header.flags & 0x0f;

        if opcode >= OP_CLOSE {
            let view = WsFrame {
                payload,
                flags: header.flags,
            };
            deliver(conn, fallback, Event::WsCtl(&view));
            match opcode {
                OP_PING => {
                    let echo = payload.to_vec();
                    if let Err(e) = conn.ws_send(&echo, OP_PONG) {
                        log::warn!("connection {}: pong failed: {}", conn.id(), e);
                    }
                }
                OP_CLOSE => {
                    let _ = conn.ws_send(b"", OP_CLOSE);
                    conn.draining = true;
                }
                _ => {}
            }
            continue;
        }

        if !fin {
            if opcode != OP_CONTINUATION {
                conn.ws_frag_op = opcode;
                conn.ws_frag.clear();
            }
            conn.ws_frag.extend_from_slice(payload);
            continue;
        }

        if opcode == OP_CONTINUATION {
            // Final fragment: join and present as one message.
            conn.ws_frag.extend_from_slice(payload);
            let joined = std::mem::take(&mut conn.ws_frag);
            let view = WsFrame {
                payload: &joined,
                flags: 0x80 | conn.ws_frag_op,
            };
            deliver(conn, fallback, Event::WsMsg(&view));
        } else {
            let view = WsFrame {
                payload,
                flags: header.flags,
            };
            deliver(conn, fallback, Event::WsMsg(&view));
        }
    }
}

/// Encodes one frame header. Server frames are unmasked; client frames
/// carry the given masking key.
fn encode_header(opcode: u8, len: usize, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);
    header.push(0x80 | (opcode & 0x0f));
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        header.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    if let Some(key) = mask {
        header.extend_from_slice(&key);
    }
    header
}

impl Connection {
    /// Sends one WebSocket frame with FIN set. The connection's role
    /// picks the masking discipline: client frames are masked, server
    /// frames are not.
    pub fn ws_send(&mut self, data: &[u8], opcode: u8) -> Result<()> {
        if !self.websocket {
            return Err(Error::Usage("ws_send on a non-websocket connection"));
        }
        if self.client {
            let key: [u8; 4] = rand::random();
            self.send(&encode_header(opcode, data.len(), Some(key)))?;
            let masked: Vec<u8> = data
                .iter()
                .enumerate()
                .map(|(i, &b)| b ^ key[i & 3])
                .collect();
            self.send(&masked)
        } else {
            self.send(&encode_header(opcode, data.len(), None))?;
            self.send(data)
        }
    }

    /// Completes the server side of the upgrade while handling the
    /// request's HTTP_MSG: writes the 101 response (extra headers
    /// inserted verbatim), clears HTTP parsing state and flips the
    /// connection to WebSocket framing. WS_OPEN follows once the
    /// handler returns.
    pub fn ws_upgrade(
        &mut self,
        msg: &HttpMessage<'_>,
        extra_headers: &[(&str, &str)],
    ) -> Result<()> {
        let key = msg
            .header("Sec-WebSocket-Key")
            .ok_or_else(|| Error::Parse("upgrade request without Sec-WebSocket-Key".into()))?;
        let accept = accept_key(key.trim());

        let mut head = String::from("HTTP/1.1 101 Switching Protocols\r\n");
        head.push_str("Upgrade: websocket\r\n");
        head.push_str("Connection: Upgrade\r\n");
        head.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
        for (name, value) in extra_headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.send(head.as_bytes())?;

        self.websocket = true;
        self.http_hdrs_fired = false;
        self.resp = false;
        Ok(())
    }
}

/// Client half of the handshake: composes the upgrade request and
/// remembers the nonce for response validation.
pub(crate) fn send_client_upgrade(conn: &mut Connection, host: &str, uri: &str) -> Result<()> {
    let nonce: [u8; 16] = rand::random();
    let key = BASE64.encode(nonce);
    let head = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        uri, host, key
    );
    conn.send(head.as_bytes())?;
    conn.ws_client_key = Some(key);
    Ok(())
}

/// Validates the server's 101 against the stored nonce and switches
/// the connection to WebSocket framing.
pub(crate) fn check_upgrade_response(conn: &mut Connection, msg: &HttpMessage<'_>) -> Result<()> {
    let key = conn
        .ws_client_key
        .take()
        .ok_or(Error::Usage("no upgrade in flight"))?;
    if msg.status() != Some(101) {
        return Err(Error::Parse(format!(
            "upgrade refused with status {:?}",
            msg.status()
        )));
    }
    let expected = accept_key(&key);
    match msg.header("Sec-WebSocket-Accept").map(str::trim) {
        Some(got) if got == expected => {
            conn.websocket = true;
            Ok(())
        }
        other => Err(Error::Parse(format!(
            "bad Sec-WebSocket-Accept {:?}",
            other
        ))),
    }
}
