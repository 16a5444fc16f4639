//! Listeners and process-lifetime state
//!
//! Every accepted connection runs on its own task. [`ProxyState`] tracks how
//! many are alive and carries the shutdown signal; after shutdown the
//! listeners stop accepting and [`ProxyServer::run`] waits, polling, until the
//! last connection has finished.
use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::connector::ConnectorBuilder;
use crate::errors::{Error, Result};
use crate::handler::Handler;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Interval between live-connection checks while draining.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared counters and the shutdown signal.
#[derive(Debug)]
pub struct ProxyState {
  live: AtomicUsize,
  next_id: AtomicU64,
  shutdown: watch::Sender<bool>,
}

impl Default for ProxyState {
  fn default() -> Self {
    Self {
      live: AtomicUsize::new(0),
      next_id: AtomicU64::new(1),
      shutdown: watch::channel(false).0,
    }
  }
}

impl ProxyState {
  /// Fresh state, not shutting down, no connections.
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }
  /// Number of connections currently being handled.
  pub fn live(&self) -> usize {
    self.live.load(Ordering::SeqCst)
  }
  /// Process-unique id for a new connection.
  pub fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }
  /// Count a connection as live until the guard drops.
  pub fn track(self: &Arc<Self>) -> LiveGuard {
    self.live.fetch_add(1, Ordering::SeqCst);
    LiveGuard {
      state: self.clone(),
    }
  }
  /// Ask listeners and relays to stop.
  pub fn shutdown(&self) {
    self.shutdown.send_replace(true);
  }
  /// Whether shutdown has been requested.
  pub fn is_shutting_down(&self) -> bool {
    *self.shutdown.borrow()
  }
  /// A receiver that turns `true` on shutdown.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.shutdown.subscribe()
  }
  /// Wait until no connection is live, checking every `interval`. There is
  /// no upper bound on the wait.
  pub async fn drained(&self, interval: Duration) {
    loop {
      let live = self.live();
      if live == 0 {
        return;
      }
      tracing::info!("waiting for {} connection(s) to finish", live);
      tokio::time::sleep(interval).await;
    }
  }
}

/// Decrements the live counter on drop, whatever path the handler took.
#[derive(Debug)]
pub struct LiveGuard {
  state: Arc<ProxyState>,
}

impl Drop for LiveGuard {
  fn drop(&mut self) {
    self.state.live.fetch_sub(1, Ordering::SeqCst);
  }
}

/// What a listener intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// Plain HTTP, routed by the `Host:` header.
  Http,
  /// TLS, terminated with an issued certificate.
  Https,
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Protocol::Http => f.write_str("http"),
      Protocol::Https => f.write_str("https"),
    }
  }
}

/// The transparent proxy: one or two listeners feeding a [`Handler`].
#[derive(Debug, Clone)]
pub struct ProxyServer {
  handler: Arc<Handler>,
  listen: Option<u16>,
  ssl: Option<u16>,
}

impl ProxyServer {
  /// Build everything `config` asks for. Loading the CA is the last fallible
  /// step before any socket is opened.
  pub fn new(config: &Config) -> Result<Self> {
    let connector = ConnectorBuilder::default()
      .connect_timeout(config.connect_timeout)
      .build();
    for rule in config.routes.rules() {
      tracing::debug!("route {} via {}", rule.pattern(), rule.upstream());
    }
    tracing::debug!("default route via {}", config.routes.default_upstream());
    let mut handler = Handler::new(config.routes.clone(), connector);
    if let Some(ssl) = &config.ssl {
      let ca = CertificateAuthority::load(&ssl.cert, &ssl.key)?;
      handler = handler.with_tls(Arc::new(ca), config.ssl_verify.as_deref())?;
    }
    Ok(Self {
      handler: Arc::new(handler),
      listen: config.listen,
      ssl: config.ssl.as_ref().map(|ssl| ssl.port),
    })
  }

  /// A server around an already built handler, with no listener ports.
  /// Listeners are handed to [`ProxyServer::serve`] directly.
  pub fn from_handler(handler: Handler) -> Self {
    Self {
      handler: Arc::new(handler),
      listen: None,
      ssl: None,
    }
  }

  /// The state shared with every connection.
  pub fn state(&self) -> &Arc<ProxyState> {
    self.handler.state()
  }

  /// Bind the configured ports on all interfaces, serve until shutdown and
  /// drain.
  pub async fn run(&self) -> Result<()> {
    let plain = match self.listen {
      Some(port) => Some(bind(port).await?),
      None => None,
    };
    let tls = match self.ssl {
      Some(port) => Some(bind(port).await?),
      None => None,
    };
    let plain = async {
      match plain {
        Some(listener) => self.serve(listener, Protocol::Http).await,
        None => Ok(()),
      }
    };
    let tls = async {
      match tls {
        Some(listener) => self.serve(listener, Protocol::Https).await,
        None => Ok(()),
      }
    };
    tokio::try_join!(plain, tls)?;
    self.state().drained(DRAIN_INTERVAL).await;
    tracing::info!("all connections closed");
    Ok(())
  }

  /// Accept on `listener` until shutdown, spawning one task per connection.
  /// Returns without waiting for those tasks.
  pub async fn serve(&self, listener: TcpListener, protocol: Protocol) -> Result<()> {
    if protocol == Protocol::Https && !self.handler.intercepts_tls() {
      return Err(Error::Other(
        "TLS listener without a certificate authority".to_string(),
      ));
    }
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("listening for {} on {}", protocol, addr);
    }
    let state = self.state().clone();
    let mut shutdown = state.subscribe();
    loop {
      if state.is_shutting_down() {
        break;
      }
      tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let id = state.next_id();
            let guard = state.track();
            let handler = self.handler.clone();
            tokio::spawn(async move {
              let _guard = guard;
              tracing::info!("[{}] accepted {} connection from {}", id, protocol, peer_addr);
              let result = match protocol {
                Protocol::Http => handler.handle_plain(id, stream).await,
                Protocol::Https => handler.handle_tls(id, stream).await,
              };
              match result {
                Ok(stats) => tracing::info!(
                  "[{}] finished ({:?}): {} bytes sent, {} bytes received",
                  id,
                  stats.end,
                  stats.sent,
                  stats.received
                ),
                Err(e) => tracing::warn!("[{}] {}", id, e),
              }
            });
          }
          Err(e) => accept_failed(protocol, e).await,
        }
      }
    }
    tracing::info!("stopped accepting {} connections", protocol);
    Ok(())
  }
}

/// Log a failed `accept` and pause, so a persistent error such as EMFILE
/// does not spin the loop.
async fn accept_failed(protocol: Protocol, e: std::io::Error) {
  tracing::error!("failed to accept {} connection: {}", protocol, e);
  tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn bind(port: u16) -> Result<TcpListener> {
  let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
  TcpListener::bind(addr).await.map_err(|e| {
    Error::IO(std::io::Error::new(
      e.kind(),
      format!("could not listen on {}: {}", addr, e),
    ))
  })
}
