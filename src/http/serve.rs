//! Static serving and multipart decoding on top of the file provider.

use std::path::{Component, Path, PathBuf};

use crate::connection::Connection;
use crate::error::Result;
use crate::fs::{FileProvider, FileStat};
use crate::http::{reason_phrase, HttpMessage};
use crate::url;

/// Options for `serve_dir`/`serve_file`.
pub struct ServeOpts<'a> {
    pub root: &'a Path,
    /// Appended verbatim to every response head.
    pub extra_headers: &'a [(&'a str, &'a str)],
    /// Extension → MIME overrides, consulted before the built-in table.
    pub mime_types: &'a [(&'a str, &'a str)],
    /// File served as the 404 body (plain text otherwise).
    pub page404: Option<&'a Path>,
}

impl<'a> ServeOpts<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            extra_headers: &[],
            mime_types: &[],
            page404: None,
        }
    }
}

const BUILTIN_MIME: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("txt", "text/plain; charset=utf-8"),
    ("md", "text/plain; charset=utf-8"),
    ("csv", "text/csv"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("webp", "image/webp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("wasm", "application/wasm"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

fn mime_for<'a>(path: &Path, overrides: &[(&'a str, &'a str)]) -> &'a str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    for (candidate, mime) in overrides {
        if candidate.eq_ignore_ascii_case(ext) {
            return mime;
        }
    }
    for (candidate, mime) in BUILTIN_MIME {
        if candidate.eq_ignore_ascii_case(ext) {
            return mime;
        }
    }
    "application/octet-stream"
}

/// `bytes=a-b` → byte window clamped to `size`. `None` means the
/// header is absent or unusable as a satisfiable range.
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?.trim();
    let (start_s, end_s) = spec.split_once('-')?;
    if start_s.is_empty() {
        // Suffix form: last N bytes.
        let n: u64 = end_s.trim().parse().ok()?;
        if n == 0 || size == 0 {
            return None;
        }
        let n = n.min(size);
        return Some((size - n, size - 1));
    }
    let start: u64 = start_s.trim().parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end_s.is_empty() {
        size - 1
    } else {
        end_s.trim().parse::<u64>().ok()?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn write_head(
    conn: &mut Connection,
    status: u16,
    headers: &[(&str, &str)],
    extra: &[(&str, &str)],
) -> Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in headers.iter().chain(extra) {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    conn.send(head.as_bytes())
}

fn serve_not_found(
    conn: &mut Connection,
    provider: &dyn FileProvider,
    opts: &ServeOpts<'_>,
) -> Result<()> {
    if let Some(page) = opts.page404 {
        if let Some(stat) = provider.stat(page) {
            if !stat.is_dir {
                let body = provider.read(page, 0, stat.size as usize)?;
                let mime = mime_for(page, opts.mime_types);
                return conn.reply(404, body, &[("Content-Type", mime)]);
            }
        }
    }
    conn.reply(404, "Not found\n", &[])
}

fn serve_stat(
    conn: &mut Connection,
    msg: &HttpMessage<'_>,
    provider: &dyn FileProvider,
    path: &Path,
    stat: FileStat,
    opts: &ServeOpts<'_>,
) -> Result<()> {
    let mime = mime_for(path, opts.mime_types);
    let etag = format!("\"{}.{}\"", stat.size, stat.mtime);

    if msg.header("If-None-Match") == Some(etag.as_str()) {
        write_head(
            conn,
            304,
            &[("Etag", &etag), ("Content-Length", "0")],
            opts.extra_headers,
        )?;
        conn.resp = false;
        return Ok(());
    }

    let (status, start, end) = match msg.header("Range") {
        Some(spec) => match parse_range(spec, stat.size) {
            Some((start, end)) => (206, start, end),
            None => {
                let content_range = format!("bytes */{}", stat.size);
                write_head(
                    conn,
                    416,
                    &[("Content-Range", &content_range), ("Content-Length", "0")],
                    opts.extra_headers,
                )?;
                conn.resp = false;
                return Ok(());
            }
        },
        None => (200, 0, stat.size.saturating_sub(1)),
    };

    let length = if stat.size == 0 { 0 } else { end - start + 1 };
    let mut headers: Vec<(String, String)> = vec![
        ("Content-Type".into(), mime.to_string()),
        ("Etag".into(), etag),
        ("Content-Length".into(), length.to_string()),
    ];
    if status == 206 {
        headers.push((
            "Content-Range".into(),
            format!("bytes {}-{}/{}", start, end, stat.size),
        ));
    }
    let borrowed: Vec<(&str, &str)> = headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    write_head(conn, status, &borrowed, opts.extra_headers)?;

    let body = provider.read(path, start, length as usize)?;
    conn.send(&body)?;
    conn.resp = false;
    Ok(())
}

impl Connection {
    /// Serves `msg.uri` from under `opts.root`, answering 200/206/304/
    /// 404/416 as appropriate. Directories fall back to `index.html`.
    /// Path segments that climb out of the root are treated as missing.
    pub fn serve_dir(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &dyn FileProvider,
        opts: &ServeOpts<'_>,
    ) -> Result<()> {
        let decoded = match url::decode(msg.uri) {
            Some(bytes) => bytes,
            None => return serve_not_found(self, provider, opts),
        };
        let uri = String::from_utf8_lossy(&decoded).into_owned();

        let mut path: PathBuf = opts.root.to_path_buf();
        for component in Path::new(uri.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir | Component::RootDir => {}
                _ => return serve_not_found(self, provider, opts),
            }
        }

        let stat = match provider.stat(&path) {
            Some(stat) if stat.is_dir => {
                path.push("index.html");
                provider.stat(&path)
            }
            other => other,
        };
        match stat {
            Some(stat) if !stat.is_dir => serve_stat(self, msg, provider, &path, stat, opts),
            _ => serve_not_found(self, provider, opts),
        }
    }

    /// Serves one explicit path with the same status policies as
    /// [`serve_dir`](Self::serve_dir).
    pub fn serve_file(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &dyn FileProvider,
        path: &Path,
        opts: &ServeOpts<'_>,
    ) -> Result<()> {
        match provider.stat(path) {
            Some(stat) if !stat.is_dir => serve_stat(self, msg, provider, path, stat, opts),
            _ => serve_not_found(self, provider, opts),
        }
    }
}

/// One decoded part of a `multipart/form-data` body.
#[derive(Debug, PartialEq, Eq)]
pub struct MultipartPart<'a> {
    pub name: &'a str,
    pub filename: &'a str,
    pub body: &'a [u8],
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pulls a `key="value"` attribute out of a part's header block,
/// requiring the key to start an attribute (so `name=` does not match
/// inside `filename=`).
fn disposition_attr<'a>(headers: &'a [u8], key: &str) -> &'a str {
    let pattern = format!("{}=\"", key);
    let pattern = pattern.as_bytes();
    let mut at = 0;
    while let Some(rel) = find_subslice(&headers[at..], pattern) {
        let idx = at + rel;
        let boundary_ok = idx == 0
            || matches!(headers[idx - 1], b' ' | b';' | b'\t');
        if boundary_ok {
            let value_start = idx + pattern.len();
            if let Some(close) = headers[value_start..].iter().position(|&b| b == b'"') {
                return std::str::from_utf8(&headers[value_start..value_start + close])
                    .unwrap_or_default();
            }
        }
        at = idx + pattern.len();
    }
    ""
}

/// Iterates `multipart/form-data` parts: call with `offset = 0`, then
/// with each returned offset until `None`.
pub fn parse_multipart(body: &[u8], mut offset: usize) -> Option<(usize, MultipartPart<'_>)> {
    if offset >= body.len() {
        return None;
    }
    if body[offset..].starts_with(b"\r\n") {
        offset += 2;
    }
    if !body[offset..].starts_with(b"--") {
        return None;
    }
    let line_len = find_subslice(&body[offset..], b"\r\n")?;
    let boundary = &body[offset..offset + line_len];
    if boundary.ends_with(b"--") {
        // Closing delimiter.
        return None;
    }

    let headers_start = offset + line_len + 2;
    let headers_len = find_subslice(&body[headers_start..], b"\r\n\r\n")?;
    let headers = &body[headers_start..headers_start + headers_len];

    let data_start = headers_start + headers_len + 4;
    let mut delimiter = Vec::with_capacity(boundary.len() + 2);
    delimiter.extend_from_slice(b"\r\n");
    delimiter.extend_from_slice(boundary);
    let data_len = find_subslice(&body[data_start..], &delimiter)?;

    Some((
        data_start + data_len + 2,
        MultipartPart {
            name: disposition_attr(headers, "name"),
            filename: disposition_attr(headers, "filename"),
            body: &body[data_start..data_start + data_len],
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFs;
    use crate::http::parse_head;

    fn request(raw: &[u8]) -> (Vec<u8>, crate::http::HeadInfo) {
        let info = parse_head(raw).unwrap().unwrap();
        (raw.to_vec(), info)
    }

    fn web_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("millrace-serve-{}", std::process::id()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("index.html"), b"<h1>home</h1>").unwrap();
        std::fs::write(root.join("data.txt"), b"0123456789").unwrap();
        std::fs::write(root.join("sub/page.html"), b"<p>sub</p>").unwrap();
        root
    }

    fn sent(conn: &Connection) -> String {
        String::from_utf8_lossy(conn.send.as_slice()).into_owned()
    }

    #[test]
    fn test_serve_dir_resolves_index() {
        let root = web_root();
        let (raw, info) = request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        let out = sent(&conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(out.ends_with("<h1>home</h1>"));
    }

    #[test]
    fn test_serve_dir_full_file_with_length() {
        let root = web_root();
        let (raw, info) = request(b"GET /data.txt HTTP/1.1\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        let out = sent(&conn);
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.ends_with("0123456789"));
    }

    #[test]
    fn test_serve_dir_range_request() {
        let root = web_root();
        let (raw, info) = request(b"GET /data.txt HTTP/1.1\r\nRange: bytes=2-5\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        let out = sent(&conn);
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(out.contains("Content-Range: bytes 2-5/10\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.ends_with("2345"));
    }

    #[test]
    fn test_serve_dir_unsatisfiable_range() {
        let root = web_root();
        let (raw, info) = request(b"GET /data.txt HTTP/1.1\r\nRange: bytes=50-60\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        let out = sent(&conn);
        assert!(out.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert!(out.contains("Content-Range: bytes */10\r\n"));
    }

    #[test]
    fn test_serve_dir_not_modified_via_etag() {
        let root = web_root();
        // First fetch captures the Etag.
        let (raw, info) = request(b"GET /data.txt HTTP/1.1\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        let out = sent(&conn);
        let etag_line = out
            .lines()
            .find(|l| l.starts_with("Etag: "))
            .unwrap()
            .to_string();
        let etag = etag_line.trim_start_matches("Etag: ");

        let conditional = format!("GET /data.txt HTTP/1.1\r\nIf-None-Match: {}\r\n\r\n", etag);
        let (raw, info) = request(conditional.as_bytes());
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(2);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        assert!(sent(&conn).starts_with("HTTP/1.1 304 Not Modified\r\n"));
    }

    #[test]
    fn test_serve_dir_missing_is_404() {
        let root = web_root();
        let (raw, info) = request(b"GET /nope.txt HTTP/1.1\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        assert!(sent(&conn).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_serve_dir_rejects_parent_escape() {
        let root = web_root();
        let (raw, info) = request(b"GET /../secret HTTP/1.1\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        conn.serve_dir(&msg, &StdFs, &ServeOpts::new(&root)).unwrap();
        assert!(sent(&conn).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_serve_file_mime_override() {
        let root = web_root();
        let (raw, info) = request(b"GET /data.txt HTTP/1.1\r\n\r\n");
        let msg = info.view(&raw, b"", &raw);
        let mut conn = Connection::virtual_conn(1);
        let overrides = [("txt", "text/custom")];
        let opts = ServeOpts {
            mime_types: &overrides,
            ..ServeOpts::new(&root)
        };
        conn.serve_file(&msg, &StdFs, &root.join("data.txt"), &opts)
            .unwrap();
        assert!(sent(&conn).contains("Content-Type: text/custom\r\n"));
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=4-2", 10), None);
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("chairs=0-1", 10), None);
    }

    #[test]
    fn test_multipart_iteration() {
        let body = b"--BOUND\r\n\
Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
value1\r\n\
--BOUND\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file contents\r\n\
--BOUND--\r\n";

        let (next, part) = parse_multipart(body, 0).unwrap();
        assert_eq!(part.name, "field1");
        assert_eq!(part.filename, "");
        assert_eq!(part.body, b"value1");

        let (next2, part) = parse_multipart(body, next).unwrap();
        assert_eq!(part.name, "file");
        assert_eq!(part.filename, "a.txt");
        assert_eq!(part.body, b"file contents");

        assert!(parse_multipart(body, next2).is_none());
    }

    #[test]
    fn test_multipart_rejects_garbage() {
        assert!(parse_multipart(b"not multipart", 0).is_none());
        assert!(parse_multipart(b"--B\r\nheaders-without-end", 0).is_none());
    }
}
