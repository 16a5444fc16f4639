//! Duplex relay
//!
//! Forwards bytes between two streams until either side closes, an I/O
//! error occurs or shutdown is signalled. Each read is written in full to the
//! other side before the next wait. Bytes are opaque: a TLS stream relays
//! plaintext records, a TCP stream raw bytes.
use crate::errors::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Large enough for one full TLS record.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
  /// The client side read end-of-stream.
  ClientClosed,
  /// The server side read end-of-stream.
  ServerClosed,
  /// Shutdown was signalled.
  Shutdown,
}

/// Totals for a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
  /// bytes copied client to server
  pub sent: u64,
  /// bytes copied server to client
  pub received: u64,
  /// what ended the relay
  pub end: RelayEnd,
}

/// Relay between `client` and `server` until one closes or `shutdown` turns
/// true. A dropped shutdown sender counts as shutdown.
pub async fn relay<C, S>(
  client: &mut C,
  server: &mut S,
  shutdown: &mut watch::Receiver<bool>,
) -> Result<RelayStats>
where
  C: AsyncRead + AsyncWrite + Unpin,
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut client_buf = vec![0u8; BUFFER_SIZE];
  let mut server_buf = vec![0u8; BUFFER_SIZE];
  let mut sent = 0u64;
  let mut received = 0u64;
  let end = loop {
    if *shutdown.borrow() {
      break RelayEnd::Shutdown;
    }
    tokio::select! {
      n = client.read(&mut client_buf) => {
        let n = n?;
        if n == 0 {
          break RelayEnd::ClientClosed;
        }
        server.write_all(&client_buf[..n]).await?;
        server.flush().await?;
        sent += n as u64;
      }
      n = server.read(&mut server_buf) => {
        let n = n?;
        if n == 0 {
          break RelayEnd::ServerClosed;
        }
        client.write_all(&server_buf[..n]).await?;
        client.flush().await?;
        received += n as u64;
      }
      changed = shutdown.changed() => {
        if changed.is_err() {
          break RelayEnd::Shutdown;
        }
      }
    }
  };
  Ok(RelayStats {
    sent,
    received,
    end,
  })
}
