//! Destination discovery from the first bytes of a request.
use crate::errors::{Error, Result};
use std::fmt;

/// Default port for plaintext interception.
pub const HTTP_PORT: u16 = 80;
/// Default port for TLS interception.
pub const HTTPS_PORT: u16 = 443;

/// The real destination of an intercepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  /// hostname or IP literal, without brackets
  pub hostname: String,
  /// destination port
  pub port: u16,
}

impl Target {
  /// Build a target.
  pub fn new(hostname: impl Into<String>, port: u16) -> Self {
    Self {
      hostname: hostname.into(),
      port,
    }
  }

  /// Parse a `Host:` header value or SNI name: `host`, `host:port`,
  /// `[v6]` or `[v6]:port`. `default_port` applies when no port is given.
  pub fn parse(value: &str, default_port: u16) -> Result<Self> {
    let value = value.trim();
    if value.is_empty() {
      return Err(Error::MissingHost("empty Host value".to_string()));
    }
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
      let (host, tail) = rest
        .split_once(']')
        .ok_or_else(|| Error::MissingHost(format!("unterminated IPv6 literal: {}", value)))?;
      match tail.strip_prefix(':') {
        Some(port) => (host, Some(port)),
        None if tail.is_empty() => (host, None),
        None => return Err(Error::MissingHost(format!("invalid Host value: {}", value))),
      }
    } else {
      match value.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (value, None),
      }
    };
    if host.is_empty() {
      return Err(Error::MissingHost(format!("invalid Host value: {}", value)));
    }
    let port = match port {
      None => default_port,
      Some(p) => p
        .parse::<u16>()
        .map_err(|_| Error::MissingHost(format!("invalid port in Host value: {}", value)))?,
    };
    Ok(Self::new(host, port))
  }

  /// `host:port`, bracketing IPv6 literals.
  pub fn authority(&self) -> String {
    if self.hostname.contains(':') {
      format!("[{}]:{}", self.hostname, self.port)
    } else {
      format!("{}:{}", self.hostname, self.port)
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.authority())
  }
}

/// Find the `Host:` header value in a buffered HTTP/1.x request head.
///
/// The first line is the request line and is skipped. Header names compare
/// case-insensitively. Only complete lines are considered, so a header cut
/// short by a partial read is not reported.
pub fn find_host_header(buf: &[u8]) -> Option<&str> {
  let mut lines = buf.split(|b| *b == b'\n');
  lines.next()?;
  // the last piece has no terminating '\n' and may still be growing
  let mut lines = lines.peekable();
  while let Some(line) = lines.next() {
    if lines.peek().is_none() {
      break;
    }
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
      break;
    }
    if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
      return std::str::from_utf8(&line[5..]).ok().map(str::trim);
    }
  }
  None
}

/// Whether the request head has been fully received (blank line seen).
pub fn head_complete(buf: &[u8]) -> bool {
  buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\n\n")
}

/// Extract the destination from a captured request head.
pub fn target_from_request(buf: &[u8], default_port: u16) -> Result<Target> {
  let host = find_host_header(buf)
    .ok_or_else(|| Error::MissingHost("client did not provide a Host header".to_string()))?;
  Target::parse(host, default_port)
}
