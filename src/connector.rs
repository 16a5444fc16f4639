use crate::errors::{new_io_error, Error, Result};
use crate::route::Upstream;
use crate::socks;
use crate::target::Target;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
    }
  }
}

impl ConnectorBuilder {
  /// Set a timeout for each TCP connect attempt.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Create a `Connector` from this configuration.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
    }
  }
}

/// Opens the outbound leg of a connection, directly or through a SOCKS
/// upstream. Every socket gets `TCP_NODELAY`.
#[derive(Clone, Debug)]
pub struct Connector {
  connect_timeout: Option<Duration>,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<TcpStream> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    socket.set_nodelay(true)?;
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| {
          new_io_error(
            std::io::ErrorKind::TimedOut,
            &format!("connect to {} timed out", addr),
          )
        })??,
    };
    Ok(stream)
  }

  /// Resolve `host` and try each address in turn until one accepts.
  pub async fn connect_with_host(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          tracing::debug!("connect to {} ({}) failed: {}", host, addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("could not resolve host {}", host),
      )
    }))
  }

  /// Reach `target` the way `upstream` says: a plain TCP connect for direct
  /// rules, otherwise a connect to the SOCKS proxy followed by one handshake.
  /// The returned stream relays to `target`.
  pub async fn connect(&self, target: &Target, upstream: &Upstream) -> Result<TcpStream> {
    match upstream {
      Upstream::Direct => self.connect_with_host(&target.hostname, target.port).await,
      Upstream::Socks { kind, addr } => {
        let mut stream = self.connect_with_addr(*addr).await.map_err(|e| match e {
          Error::IO(io) => Error::IO(std::io::Error::new(
            io.kind(),
            format!("upstream {} unreachable: {}", upstream, io),
          )),
          other => other,
        })?;
        socks::negotiate(&mut stream, *kind, target).await?;
        Ok(stream)
      }
    }
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}
