//! HTTP/1.1 over the connection recv buffer.
//!
//! The parser runs after every READ. Once the request line and header
//! block are complete it emits `HttpHdrs`; once the full body is
//! buffered (Content-Length, chunked, or at EOF for unframed
//! responses) it emits `HttpMsg` and consumes the message. Views are
//! built over bytes staged for the dispatch and die with the callback.

mod serve;

pub use serve::{parse_multipart, MultipartPart, ServeOpts};

use std::ops::Range;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{deliver, Event, EventHandler};
use crate::url;
use crate::ws;

/// Fixed header table size; headers past this many are dropped.
pub const MAX_HEADERS: usize = 30;

/// Extracted query-variable values are truncated to this many bytes.
pub const MAX_QUERY_VAR: usize = 256;

/// Borrowed view of one HTTP message, valid for a single dispatch.
///
/// For responses the request-line fields are repurposed the way the
/// status line reads: `method` holds the protocol, `uri` the status
/// digits and `proto` the reason phrase; use [`status`](Self::status).
pub struct HttpMessage<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub query: &'a str,
    pub proto: &'a str,
    headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
    /// Request line plus header block, terminator included.
    pub head: &'a [u8],
    /// The entire framed message.
    pub message: &'a [u8],
}

impl<'a> HttpMessage<'a> {
    /// First header whose name matches case-insensitively.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }

    /// All headers in wire order, names case-preserved. Duplicates
    /// appear as sent.
    pub fn headers(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.headers.iter().copied()
    }

    /// Percent-decoded query variable, truncated to
    /// [`MAX_QUERY_VAR`] bytes.
    pub fn query_var(&self, name: &str) -> Option<String> {
        for pair in self.query.split('&') {
            let (k, v) = match pair.split_once('=') {
                Some(kv) => kv,
                None => (pair, ""),
            };
            if k == name {
                let mut decoded = url::decode(v)?;
                decoded.truncate(MAX_QUERY_VAR);
                return Some(String::from_utf8_lossy(&decoded).into_owned());
            }
        }
        None
    }

    /// Status code of a response: the three ASCII digits after the
    /// first space of the status line.
    pub fn status(&self) -> Option<u16> {
        let sp = self.head.iter().position(|&b| b == b' ')?;
        let digits = self.head.get(sp + 1..sp + 4)?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }

    pub fn body_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.body).ok()
    }
}

/// Body framing determined from the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Fixed byte count (zero for unframed requests).
    Length(usize),
    Chunked,
    /// Response without a length: body runs until the peer closes.
    UntilClose,
}

/// Byte ranges into the raw message; survives copying the bytes, so
/// views can be rebuilt over staged snapshots.
pub(crate) struct HeadInfo {
    pub head_len: usize,
    pub is_response: bool,
    pub framing: Framing,
    method: Range<usize>,
    uri: Range<usize>,
    query: Range<usize>,
    proto: Range<usize>,
    headers: Vec<(Range<usize>, Range<usize>)>,
}

impl HeadInfo {
    /// Rebuilds a view over `bytes` (the same bytes that were parsed,
    /// possibly relocated) with the given body region.
    pub fn view<'a>(&self, bytes: &'a [u8], body: &'a [u8], message: &'a [u8]) -> HttpMessage<'a> {
        let text = |r: &Range<usize>| {
            std::str::from_utf8(&bytes[r.clone()]).unwrap_or_default()
        };
        HttpMessage {
            method: text(&self.method),
            uri: text(&self.uri),
            query: text(&self.query),
            proto: text(&self.proto),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (text(k), text(v)))
                .collect(),
            body,
            head: &bytes[..self.head_len],
            message,
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

fn trim_range(buf: &[u8], mut range: Range<usize>) -> Range<usize> {
    while range.start < range.end && (buf[range.start] == b' ' || buf[range.start] == b'\t') {
        range.start += 1;
    }
    while range.end > range.start
        && matches!(buf[range.end - 1], b' ' | b'\t' | b'\r')
    {
        range.end -= 1;
    }
    range
}

/// Parses the request/status line and header block. `Ok(None)` means
/// the head is not complete yet.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<HeadInfo>> {
    let head_len = match find_head_end(buf) {
        Some(n) => n,
        None => return Ok(None),
    };
    let head = &buf[..head_len];

    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| Error::Parse("missing request line".into()))?;
    let line = &head[..line_end];

    let sp1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| Error::Parse("malformed start line".into()))?;
    let sp2 = line[sp1 + 1..]
        .iter()
        .position(|&b| b == b' ')
        .map(|p| p + sp1 + 1)
        .ok_or_else(|| Error::Parse("malformed start line".into()))?;
    if sp1 == 0 || sp2 == sp1 + 1 {
        return Err(Error::Parse("malformed start line".into()));
    }

    let is_response = line.starts_with(b"HTTP/");
    let (method, target, proto) = (0..sp1, sp1 + 1..sp2, sp2 + 1..line_end);

    // Split the request target into path and query.
    let (uri, query) = if is_response {
        (target.clone(), target.end..target.end)
    } else {
        match buf[target.clone()].iter().position(|&b| b == b'?') {
            Some(q) => (
                target.start..target.start + q,
                target.start + q + 1..target.end,
            ),
            None => (target.clone(), target.end..target.end),
        }
    };

    let mut headers = Vec::new();
    let mut pos = line_end + 2;
    while pos + 2 <= head_len - 2 {
        let rel_end = head[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::Parse("malformed header block".into()))?;
        if rel_end == 0 {
            break;
        }
        let line_range = pos..pos + rel_end;
        let colon = buf[line_range.clone()]
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::Parse("header line without colon".into()))?;
        if colon == 0 {
            return Err(Error::Parse("empty header name".into()));
        }
        if headers.len() < MAX_HEADERS {
            let name = line_range.start..line_range.start + colon;
            let value = trim_range(buf, line_range.start + colon + 1..line_range.end);
            headers.push((name, value));
        }
        pos = line_range.end + 2;
    }

    // Framing from the headers just collected. 1xx, 204 and 304
    // responses never carry a body.
    let mut framing = if is_response {
        let status: u16 = std::str::from_utf8(&buf[sp1 + 1..sp2])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if status < 200 || status == 204 || status == 304 {
            Framing::Length(0)
        } else {
            Framing::UntilClose
        }
    } else {
        Framing::Length(0)
    };
    for (k, v) in &headers {
        let name = &buf[k.clone()];
        let value = &buf[v.clone()];
        if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if value
                .windows(7)
                .any(|w| w.eq_ignore_ascii_case(b"chunked"))
            {
                framing = Framing::Chunked;
                break;
            }
        } else if name.eq_ignore_ascii_case(b"content-length") {
            let n = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or_else(|| Error::Parse("bad content-length".into()))?;
            framing = Framing::Length(n);
        }
    }

    Ok(Some(HeadInfo {
        head_len,
        is_response,
        framing,
        method,
        uri,
        query,
        proto,
        headers,
    }))
}

pub(crate) enum ChunkScan {
    NeedMore,
    Done {
        /// Encoded bytes consumed, terminator included.
        consumed: usize,
        body: Vec<u8>,
    },
}

/// Decodes chunked transfer encoding from `buf` (positioned just past
/// the head) until the zero-length terminator chunk.
pub(crate) fn decode_chunks(buf: &[u8]) -> Result<ChunkScan> {
    let mut pos = 0;
    let mut body = Vec::new();
    loop {
        let line_end = match buf[pos..].windows(2).position(|w| w == b"\r\n") {
            Some(n) => pos + n,
            None => return Ok(ChunkScan::NeedMore),
        };
        let size_text = &buf[pos..line_end];
        let hex = size_text
            .split(|&b| b == b';')
            .next()
            .unwrap_or_default();
        let hex = std::str::from_utf8(hex)
            .map_err(|_| Error::Parse("bad chunk size".into()))?
            .trim();
        let size = usize::from_str_radix(hex, 16)
            .map_err(|_| Error::Parse("bad chunk size".into()))?;

        let data_start = line_end + 2;
        if size == 0 {
            // Terminator; trailer lines are skipped up to the blank
            // line that ends the message.
            let mut t = data_start;
            loop {
                match buf[t..].windows(2).position(|w| w == b"\r\n") {
                    Some(0) => {
                        return Ok(ChunkScan::Done {
                            consumed: t + 2,
                            body,
                        })
                    }
                    Some(n) => t += n + 2,
                    None => return Ok(ChunkScan::NeedMore),
                }
            }
        }

        if buf.len() < data_start + size + 2 {
            return Ok(ChunkScan::NeedMore);
        }
        body.extend_from_slice(&buf[data_start..data_start + size]);
        if &buf[data_start + size..data_start + size + 2] != b"\r\n" {
            return Err(Error::Parse("chunk not terminated by CRLF".into()));
        }
        pos = data_start + size + 2;
    }
}

/// Consumes as many complete HTTP messages as the recv buffer holds,
/// dispatching HDRS/MSG (and WS_OPEN around upgrades) as it goes.
pub(crate) fn drive(
    conn: &mut Connection,
    fallback: Option<&Rc<dyn EventHandler>>,
    max_ws_frame: usize,
) {
    loop {
        if conn.websocket {
            ws::drive(conn, fallback, max_ws_frame);
            return;
        }
        if conn.recv.is_empty() || conn.closing || conn.draining {
            return;
        }

        let info = match parse_head(conn.recv.as_slice()) {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                conn.protocol_error("http", e);
                return;
            }
        };

        let avail = conn.recv.len();
        let mut chunk_body = None;
        let complete_len = match info.framing {
            Framing::Length(n) => {
                if avail >= info.head_len + n {
                    Some(info.head_len + n)
                } else {
                    None
                }
            }
            Framing::Chunked => match decode_chunks(&conn.recv.as_slice()[info.head_len..]) {
                Ok(ChunkScan::Done { consumed, body }) => {
                    chunk_body = Some(body);
                    Some(info.head_len + consumed)
                }
                Ok(ChunkScan::NeedMore) => None,
                Err(e) => {
                    conn.protocol_error("http chunked", e);
                    return;
                }
            },
            // Completes only at EOF; see drive_eof.
            Framing::UntilClose => None,
        };

        let Some(total) = complete_len else {
            // Head is complete; body still arriving. HDRS fires once
            // per message, body view showing what is buffered so far
            // (raw chunks for chunked framing).
            if !conn.http_hdrs_fired {
                let snapshot = conn.recv.as_slice().to_vec();
                let body = &snapshot[info.head_len..];
                let msg = info.view(&snapshot, body, &snapshot[..]);
                deliver(conn, fallback, Event::HttpHdrs(&msg));
                conn.http_hdrs_fired = true;
            }
            return;
        };

        let raw = conn.recv.take(total);
        // For chunked framing the staged message is rewritten as head
        // plus the decoded body, so the body view is contiguous.
        let staged: Vec<u8> = match chunk_body {
            Some(body) => {
                let mut buf = raw[..info.head_len].to_vec();
                buf.extend_from_slice(&body);
                buf
            }
            None => raw,
        };
        let msg = info.view(&staged, &staged[info.head_len..], &staged[..]);

        if !conn.http_hdrs_fired {
            deliver(conn, fallback, Event::HttpHdrs(&msg));
        }
        conn.http_hdrs_fired = false;

        // Client-side WebSocket upgrade response.
        if conn.ws_client_key.is_some() && info.is_response {
            match ws::check_upgrade_response(conn, &msg) {
                Ok(()) => deliver(conn, fallback, Event::WsOpen(&msg)),
                Err(e) => {
                    conn.protocol_error("websocket upgrade", e);
                    return;
                }
            }
            continue;
        }

        if !info.is_response {
            conn.resp = true;
        }
        let was_ws = conn.websocket;
        deliver(conn, fallback, Event::HttpMsg(&msg));
        if conn.websocket && !was_ws {
            // ws_upgrade ran inside the handler; hand it the request.
            deliver(conn, fallback, Event::WsOpen(&msg));
        }
    }
}

/// EOF handling for responses framed by connection close.
pub(crate) fn drive_eof(conn: &mut Connection, fallback: Option<&Rc<dyn EventHandler>>) {
    if conn.recv.is_empty() {
        return;
    }
    let info = match parse_head(conn.recv.as_slice()) {
        Ok(Some(info)) if info.framing == Framing::UntilClose => info,
        _ => return,
    };
    let total = conn.recv.len();
    let staged = conn.recv.take(total);
    let msg = info.view(&staged, &staged[info.head_len..], &staged[..]);
    if !conn.http_hdrs_fired {
        deliver(conn, fallback, Event::HttpHdrs(&msg));
    }
    conn.http_hdrs_fired = false;
    deliver(conn, fallback, Event::HttpMsg(&msg));
}

/// Reason phrase for the common status codes; numeric fallback keeps
/// unusual codes legal on the wire.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Response",
    }
}

impl Connection {
    /// Writes a complete response. `Content-Length` is derived from the
    /// body; `Content-Type: text/plain` is added when the caller
    /// supplies none. Nothing here closes the connection; call
    /// [`drain`](Connection::drain) afterwards for one-shot replies.
    pub fn reply(&mut self, status: u16, body: impl AsRef<[u8]>, headers: &[(&str, &str)]) -> Result<()> {
        let body = body.as_ref();
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
        let mut have_type = false;
        for (name, value) in headers {
            have_type |= name.eq_ignore_ascii_case("content-type");
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !have_type {
            head.push_str("Content-Type: text/plain\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        self.send(head.as_bytes())?;
        self.send(body)?;
        self.resp = false;
        Ok(())
    }

    /// Writes one transfer-encoding chunk; an empty chunk terminates
    /// the body. The caller owns the `Transfer-Encoding: chunked`
    /// response head.
    pub fn http_chunk(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        self.send(format!("{:x}\r\n", data.len()).as_bytes())?;
        self.send(data)?;
        self.send(b"\r\n")?;
        if data.is_empty() {
            self.resp = false;
        }
        Ok(())
    }

    /// Writes one server-sent event block.
    pub fn http_sse(&mut self, event: &str, data: &str) -> Result<()> {
        let mut block = format!("event: {}\n", event);
        for line in data.split('\n') {
            block.push_str("data: ");
            block.push_str(line);
            block.push('\n');
        }
        block.push('\n');
        self.send(block.as_bytes())
    }

    /// Composes a full client request into the send buffer.
    pub fn http_request(
        &mut self,
        method: &str,
        uri: &str,
        host: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<()> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, uri, host);
        for (name, value) in headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if let Some(body) = body {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");
        self.send(head.as_bytes())?;
        if let Some(body) = body {
            self.send(body)?;
        }
        Ok(())
    }

    /// Appends a basic-auth header to an outbound request head under
    /// composition (call before the blank line goes out).
    pub fn http_basic_auth(&mut self, user: &str, pass: &str) -> Result<()> {
        let credentials = BASE64.encode(format!("{}:{}", user, pass));
        self.send(format!("Authorization: Basic {}\r\n", credentials).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(buf: &[u8]) -> HeadInfo {
        parse_head(buf).unwrap().expect("head should be complete")
    }

    #[test]
    fn test_parse_request_line_and_query() {
        let raw = b"GET /hello?id=42 HTTP/1.1\r\nHost: x\r\n\r\n";
        let info = head_of(raw);
        let msg = info.view(raw, b"", raw);
        assert_eq!(msg.method, "GET");
        assert_eq!(msg.uri, "/hello");
        assert_eq!(msg.query, "id=42");
        assert_eq!(msg.proto, "HTTP/1.1");
        assert_eq!(msg.header("host"), Some("x"));
        assert_eq!(msg.query_var("id").as_deref(), Some("42"));
        assert_eq!(msg.query_var("missing"), None);
    }

    #[test]
    fn test_incomplete_head_needs_more() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(parse_head(b"GE").unwrap().is_none());
    }

    #[test]
    fn test_malformed_start_line_is_parse_error() {
        assert!(parse_head(b"GARBAGE\r\n\r\n").is_err());
        assert!(parse_head(b"GET /\r\n\r\n").is_err());
    }

    #[test]
    fn test_header_case_and_duplicates() {
        let raw = b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n";
        let info = head_of(raw);
        let msg = info.view(raw, b"", raw);
        // Lookup is case-insensitive and returns the first match.
        assert_eq!(msg.header("X-TAG"), Some("one"));
        // Iteration preserves case and order.
        let all: Vec<_> = msg.headers().collect();
        assert_eq!(all, vec![("X-Tag", "one"), ("x-tag", "two")]);
    }

    #[test]
    fn test_headers_past_thirty_are_dropped() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..35 {
            raw.extend_from_slice(format!("H{}: v{}\r\n", i, i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let info = head_of(&raw);
        let msg = info.view(&raw, b"", &raw);
        assert_eq!(msg.headers().count(), MAX_HEADERS);
        assert_eq!(msg.header("H29"), Some("v29"));
        assert_eq!(msg.header("H30"), None);
    }

    #[test]
    fn test_content_length_framing() {
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let info = head_of(raw);
        assert_eq!(info.framing, Framing::Length(5));
        let msg = info.view(raw, &raw[info.head_len..], raw);
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.message, &raw[..]);
    }

    #[test]
    fn test_bad_content_length_is_parse_error() {
        assert!(parse_head(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n").is_err());
    }

    #[test]
    fn test_chunked_decode_joins_chunks() {
        let encoded = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        match decode_chunks(encoded).unwrap() {
            ChunkScan::Done { consumed, body } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(body, b"hello world");
            }
            ChunkScan::NeedMore => panic!("expected complete decode"),
        }
    }

    #[test]
    fn test_chunked_decode_waits_for_terminator() {
        assert!(matches!(
            decode_chunks(b"5\r\nhello\r\n").unwrap(),
            ChunkScan::NeedMore
        ));
        assert!(matches!(
            decode_chunks(b"5\r\nhel").unwrap(),
            ChunkScan::NeedMore
        ));
    }

    #[test]
    fn test_chunked_decode_rejects_bad_size() {
        assert!(decode_chunks(b"zz\r\ndata\r\n").is_err());
    }

    #[test]
    fn test_response_status_extraction() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let info = head_of(raw);
        assert!(info.is_response);
        assert_eq!(info.framing, Framing::Length(0));
        let msg = info.view(raw, b"", raw);
        assert_eq!(msg.status(), Some(404));
    }

    #[test]
    fn test_response_without_length_reads_until_close() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\npartial";
        let info = head_of(raw);
        assert_eq!(info.framing, Framing::UntilClose);
    }

    #[test]
    fn test_bodyless_response_statuses_complete_without_length() {
        for raw in [
            &b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\n\r\n"[..],
            &b"HTTP/1.1 204 No Content\r\n\r\n"[..],
        ] {
            let info = head_of(raw);
            assert_eq!(info.framing, Framing::Length(0));
        }
    }

    #[test]
    fn test_query_var_truncated_at_limit() {
        let long = "v".repeat(400);
        let raw = format!("GET /p?big={} HTTP/1.1\r\n\r\n", long).into_bytes();
        let info = head_of(&raw);
        let msg = info.view(&raw, b"", &raw);
        let got = msg.query_var("big").unwrap();
        assert_eq!(got.len(), MAX_QUERY_VAR);
        assert!(got.chars().all(|c| c == 'v'));
    }

    #[test]
    fn test_query_var_percent_decoding() {
        let raw = b"GET /p?msg=hello%20world&flag HTTP/1.1\r\n\r\n";
        let info = head_of(raw);
        let msg = info.view(raw, b"", raw);
        assert_eq!(msg.query_var("msg").as_deref(), Some("hello world"));
        assert_eq!(msg.query_var("flag").as_deref(), Some(""));
    }

    #[test]
    fn test_reply_wire_format() {
        let mut conn = Connection::virtual_conn(1);
        conn.reply(200, "ok", &[]).unwrap();
        let wire = conn.send.as_slice();
        let text = std::str::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_reply_round_trips_through_parser() {
        let mut conn = Connection::virtual_conn(1);
        conn.reply(201, b"abc".as_slice(), &[("X-Extra", "1"), ("Content-Type", "application/json")])
            .unwrap();
        let wire = conn.send.as_slice().to_vec();
        let info = head_of(&wire);
        let msg = info.view(&wire, &wire[info.head_len..], &wire);
        assert_eq!(msg.status(), Some(201));
        assert_eq!(msg.header("x-extra"), Some("1"));
        assert_eq!(msg.header("content-type"), Some("application/json"));
        assert_eq!(&wire[info.head_len..], b"abc");
    }

    #[test]
    fn test_http_chunk_framing() {
        let mut conn = Connection::virtual_conn(1);
        conn.http_chunk("hello").unwrap();
        conn.http_chunk(" world").unwrap();
        conn.http_chunk("").unwrap();
        assert_eq!(
            conn.send.as_slice(),
            b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
        );
        // And the parser reassembles it.
        match decode_chunks(conn.send.as_slice()).unwrap() {
            ChunkScan::Done { body, .. } => assert_eq!(body, b"hello world"),
            _ => panic!("terminated chunk stream should decode"),
        }
    }

    #[test]
    fn test_sse_block_format() {
        let mut conn = Connection::virtual_conn(1);
        conn.http_sse("update", "line1\nline2").unwrap();
        assert_eq!(
            conn.send.as_slice(),
            b"event: update\ndata: line1\ndata: line2\n\n"
        );
    }

    #[test]
    fn test_http_request_composition() {
        let mut conn = Connection::virtual_conn(1);
        conn.http_request("POST", "/api", "example.com", &[("Accept", "*/*")], Some(b"hi"))
            .unwrap();
        let text = String::from_utf8(conn.send.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("POST /api HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn test_basic_auth_header_encoding() {
        let mut conn = Connection::virtual_conn(1);
        conn.http_basic_auth("user", "pass").unwrap();
        assert_eq!(
            conn.send.as_slice(),
            b"Authorization: Basic dXNlcjpwYXNz\r\n"
        );
    }

    #[test]
    fn test_reason_phrase_fallback() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(416), "Range Not Satisfiable");
        assert_eq!(reason_phrase(299), "Response");
    }
}
