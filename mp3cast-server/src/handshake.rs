//! HTTP handshake: request parsing and response header construction

use std::fmt::Write as _;

use bytes::Bytes;

use crate::config::{StationInfo, StreamFormat};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// A validated streaming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Client sent `Icy-MetaData: 1`
    pub fn wants_metadata(&self) -> bool {
        self.header("icy-metadata")
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// Byte length of the request head (through the blank line), if complete
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a complete request head and check it targets `mount_point`.
///
/// `buf` must hold exactly one head as delimited by [`find_request_end`].
pub fn parse_request(buf: &[u8], mount_point: &str) -> Result<Request, ProtocolError> {
    let end = find_request_end(buf)
        .ok_or_else(|| ProtocolError::Malformed("missing blank line".to_string()))?;
    if end != buf.len() {
        return Err(ProtocolError::Malformed(
            "unexpected data after request head".to_string(),
        ));
    }

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProtocolError::Malformed("request is not valid UTF-8".to_string()))?;
    let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));

    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ProtocolError::Malformed("empty request line".to_string()))?;

    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(ProtocolError::Malformed(format!(
                "bad request line: {}",
                request_line
            )))
        }
    };

    let version = match version {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other if other.starts_with("HTTP/") => {
            return Err(ProtocolError::UnsupportedVersion(other.to_string()))
        }
        other => return Err(ProtocolError::Malformed(format!("bad version: {}", other))),
    };

    if method != "GET" {
        return Err(ProtocolError::UnsupportedMethod(method.to_string()));
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("bad header: {}", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(ProtocolError::Malformed(format!("bad header: {}", line)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let path = target.split('?').next().unwrap_or(target);
    if path != mount_point {
        return Err(ProtocolError::UnknownPath(path.to_string()));
    }

    Ok(Request {
        path: path.to_string(),
        version,
        headers,
    })
}

/// Header block sent before the unbounded body.
///
/// `metaint` is set when the client negotiated ICY metadata; the scheduler
/// then owes it a metadata block every `metaint` audio bytes.
pub fn build_response_header(
    request: &Request,
    format: &StreamFormat,
    station: &StationInfo,
    metaint: Option<usize>,
) -> Bytes {
    let mut head = String::with_capacity(512);
    let _ = write!(head, "{} 200 OK\r\n", request.version.as_str());
    let _ = write!(head, "Content-Type: {}\r\n", format.content_type());
    head.push_str("Connection: close\r\n");
    head.push_str("Cache-Control: no-cache, no-store\r\n");
    head.push_str("Pragma: no-cache\r\n");
    let _ = write!(head, "Server: mp3cast/{}\r\n", crate::VERSION);
    let _ = write!(head, "icy-name: {}\r\n", header_safe(&station.name));
    if !station.description.is_empty() {
        let _ = write!(head, "icy-description: {}\r\n", header_safe(&station.description));
    }
    if !station.genre.is_empty() {
        let _ = write!(head, "icy-genre: {}\r\n", header_safe(&station.genre));
    }
    if !station.url.is_empty() {
        let _ = write!(head, "icy-url: {}\r\n", header_safe(&station.url));
    }
    let _ = write!(head, "icy-pub: {}\r\n", u8::from(station.public));
    let _ = write!(head, "icy-br: {}\r\n", format.bitrate_kbps());
    let _ = write!(
        head,
        "ice-audio-info: ice-samplerate={};ice-bitrate={};ice-channels={}\r\n",
        format.sample_rate,
        format.bitrate_kbps(),
        format.channels
    );
    if let Some(interval) = metaint {
        let _ = write!(head, "icy-metaint: {}\r\n", interval);
    }
    head.push_str("\r\n");
    Bytes::from(head)
}

/// Short error response for a rejected request, if one is worth sending
pub fn build_error_response(err: &ProtocolError) -> Option<Bytes> {
    let status = match err {
        ProtocolError::Malformed(_) => "400 Bad Request",
        ProtocolError::UnsupportedMethod(_) => "405 Method Not Allowed",
        ProtocolError::UnknownPath(_) => "404 Not Found",
        ProtocolError::UnsupportedVersion(_) => "505 HTTP Version Not Supported",
        ProtocolError::TooLarge(_) => return None,
    };
    let mut head = format!(
        "HTTP/1.0 {}\r\nContent-Type: text/plain\r\nConnection: close\r\n",
        status
    );
    if matches!(err, ProtocolError::UnsupportedMethod(_)) {
        head.push_str("Allow: GET\r\n");
    }
    head.push_str("\r\n");
    Some(Bytes::from(head))
}

fn header_safe(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}
