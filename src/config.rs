//! Configuration file
//!
//! One directive per line, blank lines and `#` comments ignored:
//!
//! | directive                      | meaning                                   |
//! |--------------------------------|-------------------------------------------|
//! | `listen <port>`                | plaintext HTTP interception port          |
//! | `ssl <port>`                   | TLS interception port                     |
//! | `sslcert <path>`               | PEM root certificate used to sign leaves  |
//! | `sslkey <path>`                | PEM key of that root                      |
//! | `default <url>`                | rule used when no `map` matches           |
//! | `map <glob> <url>`             | route hostnames matching `<glob>`         |
//! | `sslverify <path>`             | verify origins against this PEM bundle    |
//! | `connect_timeout <secs>`       | outbound connect timeout, `0` disables    |
//!
//! `<url>` is `direct` or `<proto>://<host>[:<port>]` with `<proto>` one of
//! `socks4`, `socks4a`, `socks5`; the port defaults to 1080. Upstream hosts
//! are resolved while loading. Later directives override earlier ones,
//! except `map`, which appends.
use crate::errors::{config_error, Error, Result};
use crate::route::{ForwardingRule, ProxyKind, RouteTable, Upstream};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "transockproxy.conf";
/// Port used for a SOCKS upstream written without one.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;
/// Outbound connect timeout when the file does not set one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS interception listener and the root it signs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslConfig {
  /// listening port
  pub port: u16,
  /// root certificate, PEM
  pub cert: PathBuf,
  /// root private key, PEM
  pub key: PathBuf,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// plaintext listener port
  pub listen: Option<u16>,
  /// TLS listener
  pub ssl: Option<SslConfig>,
  /// routing rules plus default
  pub routes: RouteTable,
  /// PEM bundle for verifying origins; `None` trusts every origin
  pub ssl_verify: Option<PathBuf>,
  /// outbound TCP connect timeout; `None` waits for the OS
  pub connect_timeout: Option<Duration>,
}

impl Config {
  /// Read and parse a configuration file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| config_error(0, format!("cannot read {}: {}", path.display(), e)))?;
    text.parse()
  }
}

impl FromStr for Config {
  type Err = Error;

  fn from_str(text: &str) -> Result<Self> {
    let mut listen = None;
    let mut ssl_port = None;
    let mut cert = None;
    let mut key = None;
    let mut default = None;
    let mut rules = Vec::new();
    let mut ssl_verify = None;
    let mut connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);

    for (index, line) in text.lines().enumerate() {
      let number = index + 1;
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let mut words = line.split_whitespace();
      let directive = words.next().unwrap_or_default();
      let args: Vec<&str> = words.collect();
      match directive {
        "listen" => listen = Some(parse_port(number, one_arg(number, directive, &args)?)?),
        "ssl" => ssl_port = Some(parse_port(number, one_arg(number, directive, &args)?)?),
        "sslcert" => cert = Some(PathBuf::from(one_arg(number, directive, &args)?)),
        "sslkey" => key = Some(PathBuf::from(one_arg(number, directive, &args)?)),
        "sslverify" => ssl_verify = Some(PathBuf::from(one_arg(number, directive, &args)?)),
        "connect_timeout" => {
          let secs = one_arg(number, directive, &args)?;
          let secs: u64 = secs
            .parse()
            .map_err(|_| config_error(number, format!("invalid timeout '{}'", secs)))?;
          connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        "default" => {
          let upstream = parse_upstream(one_arg(number, directive, &args)?)
            .map_err(|msg| config_error(number, msg))?;
          tracing::debug!("default route: {}", upstream);
          default = Some(upstream);
        }
        "map" => {
          let &[pattern, url] = &args[..] else {
            return Err(config_error(number, "usage: map <pattern> <url>"));
          };
          let upstream = parse_upstream(url).map_err(|msg| config_error(number, msg))?;
          let rule = ForwardingRule::new(pattern, upstream)
            .map_err(|e| config_error(number, format!("invalid pattern '{}': {}", pattern, e)))?;
          tracing::debug!("mapping {} to {}", pattern, upstream);
          rules.push(rule);
        }
        other => return Err(config_error(number, format!("unknown directive '{}'", other))),
      }
    }

    let ssl = match ssl_port {
      None => None,
      Some(port) => match (cert, key) {
        (Some(cert), Some(key)) => Some(SslConfig { port, cert, key }),
        _ => {
          return Err(config_error(
            0,
            "'ssl' requested but 'sslcert' and/or 'sslkey' missing",
          ))
        }
      },
    };
    if listen.is_none() && ssl.is_none() {
      return Err(config_error(
        0,
        "not listening on any port, needs a 'listen' and/or 'ssl' line",
      ));
    }
    let default = default.ok_or_else(|| config_error(0, "no 'default' line found"))?;

    Ok(Config {
      listen,
      ssl,
      routes: RouteTable::new(rules, default),
      ssl_verify,
      connect_timeout,
    })
  }
}

fn one_arg<'a>(line: usize, directive: &str, args: &[&'a str]) -> Result<&'a str> {
  match args {
    [arg] => Ok(*arg),
    _ => Err(config_error(
      line,
      format!("'{}' takes exactly one argument", directive),
    )),
  }
}

fn parse_port(line: usize, value: &str) -> Result<u16> {
  match value.parse::<u16>() {
    Ok(port) if port != 0 => Ok(port),
    _ => Err(config_error(line, format!("invalid port '{}'", value))),
  }
}

/// Parse a rule URL and resolve the upstream host.
pub fn parse_upstream(url: &str) -> std::result::Result<Upstream, String> {
  if url == "direct" || url == "direct://" {
    return Ok(Upstream::Direct);
  }
  let uri: http::Uri = url
    .parse()
    .map_err(|e| format!("invalid proxy url '{}': {}", url, e))?;
  let kind = uri
    .scheme_str()
    .and_then(ProxyKind::from_scheme)
    .ok_or_else(|| {
      format!(
        "unrecognized protocol in '{}' (must be direct, socks4, socks4a, or socks5)",
        url
      )
    })?;
  if kind == ProxyKind::Direct {
    return Err(format!("direct takes no host: '{}'", url));
  }
  let host = uri
    .host()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| format!("no host in '{}'", url))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let port = uri.port_u16().unwrap_or(DEFAULT_SOCKS_PORT);
  let addr = resolve(host, port)?;
  Ok(Upstream::Socks { kind, addr })
}

fn resolve(host: &str, port: u16) -> std::result::Result<SocketAddr, String> {
  (host, port)
    .to_socket_addrs()
    .map_err(|e| format!("unknown host {}: {}", host, e))?
    .next()
    .ok_or_else(|| format!("unknown host {}", host))
}
