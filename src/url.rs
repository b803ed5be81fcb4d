use crate::error::{Error, Result};

/// Parsed endpoint URL of the form `scheme://host:port[/uri]`.
///
/// Accepted schemes: `http`, `https`, `ws`, `wss`, `mqtt`, `mqtts`,
/// `tcp`, `udp`. Schemes with a well-known port may omit `:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub uri: String,
}

impl Url {
    /// Whether the scheme engages the TLS hook points.
    pub fn is_tls(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss" | "mqtts")
    }

    pub fn is_udp(&self) -> bool {
        self.scheme == "udp"
    }

    /// `host:port`, suitable for address resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "mqtt" => Some(1883),
        "mqtts" => Some(8883),
        _ => None,
    }
}

pub fn parse(url: &str) -> Result<Url> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::Url(format!("missing scheme in {:?}", url)))?;
    match scheme {
        "http" | "https" | "ws" | "wss" | "mqtt" | "mqtts" | "tcp" | "udp" => {}
        other => return Err(Error::Url(format!("unsupported scheme {:?}", other))),
    }

    let (authority, uri) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(Error::Url(format!("missing host in {:?}", url)));
    }

    // IPv6 hosts are bracketed: [::1]:8080
    let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::Url(format!("unterminated ipv6 host in {:?}", url)))?;
        let host = &stripped[..close];
        let after = &stripped[close + 1..];
        let port = after.strip_prefix(':');
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };

    let port = match port_str {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::Url(format!("bad port {:?} in {:?}", p, url)))?,
        None => default_port(scheme)
            .ok_or_else(|| Error::Url(format!("scheme {:?} requires an explicit port", scheme)))?,
    };

    Ok(Url {
        scheme: scheme.to_string(),
        host: host.to_string(),
        port,
        uri: uri.to_string(),
    })
}

/// Percent-encodes everything outside the unreserved set.
pub fn encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

/// Percent-decodes `%XX` escapes; `+` becomes a space (form encoding).
/// Returns `None` on truncated or non-hex escapes.
pub fn decode(input: &str) -> Option<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
