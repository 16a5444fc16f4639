//! Connection handlers
//!
//! Both paths find the real destination in the first request, route it,
//! open the outbound leg and hand both legs to [`relay`].
//!
//! The plaintext path only peeks, so the request is still unread when the
//! relay starts. The TLS path has to decrypt to see the request: it reads the
//! first record once, keeps the bytes, and replays them on the outbound
//! session before relaying.
use crate::ca::CertificateAuthority;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::relay::{relay, RelayStats, BUFFER_SIZE};
use crate::route::RouteTable;
use crate::server::ProxyState;
use crate::target::{
  find_host_header, head_complete, target_from_request, Target, HTTPS_PORT, HTTP_PORT,
};
use crate::tls;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// How many times the plaintext path looks for a `Host:` header.
pub const PEEK_ATTEMPTS: u32 = 1000;
/// Pause between two looks.
pub const PEEK_INTERVAL: Duration = Duration::from_millis(10);
/// Largest request head the plaintext path will look through.
pub const PEEK_BUFFER_SIZE: usize = 8192;

/// Both TLS roles used by interception.
struct Interception {
  acceptor: TlsAcceptor,
  connector: TlsConnector,
  verify: bool,
}

/// Routes and connects intercepted connections.
pub struct Handler {
  routes: RouteTable,
  connector: Connector,
  tls: Option<Interception>,
  state: Arc<ProxyState>,
  peek_attempts: u32,
  peek_interval: Duration,
}

impl std::fmt::Debug for Handler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Handler")
      .field("routes", &self.routes)
      .field("connector", &self.connector)
      .field("tls", &self.tls.as_ref().map(|t| t.verify))
      .field("state", &self.state)
      .field("peek_attempts", &self.peek_attempts)
      .field("peek_interval", &self.peek_interval)
      .finish()
  }
}

impl Handler {
  /// Plaintext-only handler with fresh [`ProxyState`].
  pub fn new(routes: RouteTable, connector: Connector) -> Self {
    Self {
      routes,
      connector,
      tls: None,
      state: ProxyState::new(),
      peek_attempts: PEEK_ATTEMPTS,
      peek_interval: PEEK_INTERVAL,
    }
  }

  /// How long the plaintext path waits for a `Host:` header: `attempts`
  /// looks, `interval` apart.
  pub fn with_peek_budget(mut self, attempts: u32, interval: Duration) -> Self {
    self.peek_attempts = attempts;
    self.peek_interval = interval;
    self
  }

  /// Enable TLS interception with certificates from `ca`. Origins are
  /// verified against the PEM bundle at `verify` if given, otherwise trusted
  /// blindly.
  pub fn with_tls(mut self, ca: Arc<CertificateAuthority>, verify: Option<&Path>) -> Result<Self> {
    if verify.is_none() {
      tracing::warn!("origin certificates will not be verified");
    }
    self.tls = Some(Interception {
      acceptor: tls::acceptor(ca)?,
      connector: tls::connector(verify)?,
      verify: verify.is_some(),
    });
    Ok(self)
  }

  /// Whether [`Handler::handle_tls`] can be used.
  pub fn intercepts_tls(&self) -> bool {
    self.tls.is_some()
  }

  /// State shared by every connection of this handler.
  pub fn state(&self) -> &Arc<ProxyState> {
    &self.state
  }

  async fn connect(&self, id: u64, target: &Target) -> Result<TcpStream> {
    let upstream = self.routes.lookup(&target.hostname);
    tracing::debug!("[{}] routing {} via {}", id, target, upstream);
    self.connector.connect(target, upstream).await
  }

  /// Plaintext HTTP: peek for the `Host:` header, connect, relay.
  pub async fn handle_plain(&self, id: u64, mut client: TcpStream) -> Result<RelayStats> {
    let target = peek_target(&client, self.peek_attempts, self.peek_interval).await?;
    let mut server = self.connect(id, &target).await?;
    let mut shutdown = self.state.subscribe();
    relay(&mut client, &mut server, &mut shutdown).await
  }

  /// TLS: terminate, read the first request, connect and re-encrypt, replay,
  /// relay. Both sessions are closed on every path once established.
  pub async fn handle_tls(&self, id: u64, client: TcpStream) -> Result<RelayStats> {
    let tls = self
      .tls
      .as_ref()
      .ok_or_else(|| Error::Other("TLS interception is not configured".to_string()))?;
    let mut client = tls.acceptor.accept(client).await?;
    let mut server = None;
    let result = self.intercept(id, tls, &mut client, &mut server).await;
    let _ = client.shutdown().await;
    if let Some(server) = server.as_mut() {
      let _ = server.shutdown().await;
    }
    result
  }

  async fn intercept(
    &self,
    id: u64,
    tls: &Interception,
    client: &mut ServerTlsStream<TcpStream>,
    server: &mut Option<ClientTlsStream<TcpStream>>,
  ) -> Result<RelayStats> {
    tracing::debug!(
      "[{}] client handshake done, SNI {:?}",
      id,
      client.get_ref().1.server_name()
    );
    let first = read_first_packet(client).await?;
    let target = target_from_request(&first, HTTPS_PORT)?;
    let stream = self.connect(id, &target).await?;
    let server = server.insert(
      tls
        .connector
        .connect(tls::server_name(&target.hostname)?, stream)
        .await?,
    );
    server.write_all(&first).await?;
    server.flush().await?;
    let mut shutdown = self.state.subscribe();
    let mut stats = relay(client, server, &mut shutdown).await?;
    stats.sent += first.len() as u64;
    Ok(stats)
  }
}

/// Peek at the request without consuming it until its `Host:` header shows
/// up. Gives up after `attempts` looks, when the head ends without one, or
/// when [`PEEK_BUFFER_SIZE`] bytes have arrived without one.
pub async fn peek_target(stream: &TcpStream, attempts: u32, interval: Duration) -> Result<Target> {
  let mut buf = vec![0u8; PEEK_BUFFER_SIZE];
  for _ in 0..attempts {
    let n = match tokio::time::timeout(interval, stream.peek(&mut buf)).await {
      Err(_) => continue,
      Ok(n) => n?,
    };
    if n == 0 {
      return Err(Error::MissingHost(
        "client closed before sending a request".to_string(),
      ));
    }
    let head = &buf[..n];
    if find_host_header(head).is_some() || head_complete(head) || n == buf.len() {
      return target_from_request(head, HTTP_PORT);
    }
    tokio::time::sleep(interval).await;
  }
  Err(Error::MissingHost(
    "gave up waiting for a Host header".to_string(),
  ))
}

/// One read from the decrypted client stream: the first request.
async fn read_first_packet(client: &mut ServerTlsStream<TcpStream>) -> Result<Bytes> {
  let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
  let n = client.read_buf(&mut buf).await?;
  if n == 0 {
    return Err(Error::MissingHost(
      "client closed before sending a request".to_string(),
    ));
  }
  Ok(buf.freeze())
}
