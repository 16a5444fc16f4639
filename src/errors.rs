//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `transock::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while loading configuration or handling a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// Certificate generation or loading failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Malformed configuration
  #[error("config line {line}: {msg}")]
  Config {
    /// 1-based line number, 0 when the error is not tied to a line
    line: usize,
    /// what is wrong
    msg: String,
  },
  /// SOCKS4/4A upstream answered with something other than "request granted"
  #[error("SOCKS4 request rejected, code {0:#04x}")]
  Socks4Rejected(u8),
  /// SOCKS5 upstream answered the connect request with a failure
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Upstream violated the SOCKS handshake
  #[error("SOCKS protocol error: {0}")]
  Socks(String),
  /// No usable `Host:` header in the first request
  #[error("no Host header: {0}")]
  MissingHost(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// SOCKS5 reply field values other than success.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  #[error("General failure")]
  /// 0x01
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  /// 0x02
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  /// 0x03
  NetworkUnreachable,
  #[error("Host unreachable")]
  /// 0x04
  HostUnreachable,
  #[error("Connection refused")]
  /// 0x05
  ConnectionRefused,
  #[error("TTL expired")]
  /// 0x06
  TtlExpired,
  #[error("Command not supported")]
  /// 0x07
  CommandNotSupported,
  #[error("Address type not supported")]
  /// 0x08
  AddressTypeNotSupported,
  /// any unassigned code
  #[error("Unassigned reply code {0:#04x}")]
  Other(u8),
}

impl From<u8> for ReplyError {
  /// Reply codes from RFC 1928 section 6. `0x00` is success and never reaches
  /// here; anything unassigned maps to [`ReplyError::Other`].
  fn from(value: u8) -> Self {
    match value {
      0x01 => ReplyError::GeneralFailure,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Other(other),
    }
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

impl Error {
  /// Whether this error is a refusal by the upstream SOCKS proxy, as opposed
  /// to a transport or protocol failure.
  pub fn is_rejection(&self) -> bool {
    matches!(self, Error::Socks4Rejected(_) | Error::ReplyError(_))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn config_error(line: usize, msg: impl Into<String>) -> Error {
  Error::Config {
    line,
    msg: msg.into(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reply_codes_map_to_named_variants() {
    assert_eq!(ReplyError::from(0x01), ReplyError::GeneralFailure);
    assert_eq!(ReplyError::from(0x05), ReplyError::ConnectionRefused);
    assert_eq!(ReplyError::from(0x08), ReplyError::AddressTypeNotSupported);
    assert_eq!(ReplyError::from(0x42), ReplyError::Other(0x42));
  }

  #[test]
  fn rejections_are_told_apart_from_protocol_errors() {
    assert!(Error::Socks4Rejected(0x5b).is_rejection());
    assert!(Error::from(ReplyError::HostUnreachable).is_rejection());
    assert!(!Error::Socks("short reply".to_string()).is_rejection());
  }
}
