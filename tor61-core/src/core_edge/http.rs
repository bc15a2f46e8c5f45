//! Just enough HTTP/1.x request-head handling for the entrance proxy
//!
//! The head is rewritten so the exit's connection is one request long:
//! the request line is downgraded to `HTTP/1.0` and keep-alive connection
//! headers become `close`. Everything after the head passes through as is.

use thiserror::Error;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Heads larger than this are refused.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request head has no Host header")]
    MissingHost,

    #[error("request head exceeds 64 KiB")]
    HeadTooLarge,
}

/// A complete, rewritten request head plus whatever followed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    /// `host:port` taken from the Host header
    pub host: String,
    /// Bytes to forward, starting with the rewritten head
    pub bytes: Vec<u8>,
}

/// Try to parse the request head buffered so far.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<ProxyRequest>, HttpError> {
    let Some(end) = buf.windows(HEAD_END.len()).position(|w| w == HEAD_END) else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
        return Ok(None);
    };

    let head = String::from_utf8_lossy(&buf[..end]);
    let mut host = None;
    let mut lines = Vec::new();

    for (i, line) in head.split("\r\n").enumerate() {
        if i == 0 {
            lines.push(downgrade_version(line));
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            lines.push(line.to_string());
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(with_default_port(value));
            lines.push(line.to_string());
        } else if (name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("proxy-connection"))
            && value.eq_ignore_ascii_case("keep-alive")
        {
            lines.push(format!("{}: close", name));
        } else {
            lines.push(line.to_string());
        }
    }

    let host = host.ok_or(HttpError::MissingHost)?;
    let mut bytes = lines.join("\r\n").into_bytes();
    bytes.extend_from_slice(HEAD_END);
    bytes.extend_from_slice(&buf[end + HEAD_END.len()..]);

    Ok(Some(ProxyRequest { host, bytes }))
}

fn downgrade_version(request_line: &str) -> String {
    match request_line.rsplit_once(' ') {
        Some((rest, version)) if version.starts_with("HTTP/") => format!("{} HTTP/1.0", rest),
        _ => request_line.to_string(),
    }
}

fn with_default_port(host: &str) -> String {
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{}:{}", host, DEFAULT_PORT),
    }
}

/// Split `host[:port]`, falling back to port 80 when the port is missing or
/// unparsable.
pub fn split_host(host: &str) -> (&str, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => (name, port.parse().unwrap_or(DEFAULT_PORT)),
        None => (host, DEFAULT_PORT),
    }
}
