//! SOCKS client handshakes
//!
//! Negotiates a relay through an upstream SOCKS proxy over an already
//! connected stream. Each negotiation is attempted once; any short read,
//! wrong version byte or failure code aborts it. When a negotiation returns
//! `Ok(())` the upstream reply has been consumed completely and the stream is
//! positioned at the first relayed byte.
use crate::errors::{new_io_error, Error, ReplyError, Result};
use crate::route::ProxyKind;
use crate::target::Target;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Run the handshake for `kind` so that `stream` ends up relaying to `target`.
///
/// [`ProxyKind::Direct`] needs no handshake and returns immediately.
pub async fn negotiate<S>(stream: &mut S, kind: ProxyKind, target: &Target) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match kind {
    ProxyKind::Direct => Ok(()),
    ProxyKind::Socks4 => {
      let ip = resolve_ipv4(&target.hostname, target.port).await?;
      socks4_connect(stream, ip, target.port).await
    }
    ProxyKind::Socks4a => socks4a_connect(stream, &target.hostname, target.port).await,
    ProxyKind::Socks5 => socks5_connect(stream, &target.hostname, target.port).await,
  }
}

/// SOCKS4 leaves name resolution to the client, and only speaks IPv4.
async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
  if let Ok(ip) = host.parse::<IpAddr>() {
    return match ip {
      IpAddr::V4(v4) => Ok(v4),
      IpAddr::V6(_) => Err(Error::Socks(format!(
        "SOCKS4 cannot address IPv6 destination {}",
        host
      ))),
    };
  }
  tokio::net::lookup_host((host, port))
    .await?
    .find_map(|addr| match addr.ip() {
      IpAddr::V4(v4) => Some(v4),
      IpAddr::V6(_) => None,
    })
    .ok_or_else(|| {
      new_io_error(
        ErrorKind::NotFound,
        &format!("could not resolve {} to an IPv4 address", host),
      )
    })
}

/// SOCKS4 CONNECT request:
///
/// | VN | CD | DSTPORT | DSTIP | USERID | NULL |
/// | --- | --- | --- | --- | --- | --- |
/// | 0x04 | 0x01 | 2 bytes, big endian | 4 bytes | empty | 0x00 |
pub fn socks4_request(ip: Ipv4Addr, port: u16) -> Vec<u8> {
  let mut packet = Vec::with_capacity(9);
  packet.extend_from_slice(&[consts::SOCKS4_VERSION, consts::SOCKS_CMD_CONNECT]);
  packet.extend_from_slice(&port.to_be_bytes());
  packet.extend_from_slice(&ip.octets());
  packet.push(0x00);
  packet
}

/// SOCKS4A CONNECT request: the SOCKS4 header with the placeholder address
/// `0.0.0.1`, followed by the NUL-terminated hostname for the upstream to
/// resolve.
pub fn socks4a_request(host: &str, port: u16) -> Result<Vec<u8>> {
  if host.as_bytes().contains(&0) {
    return Err(Error::Socks("hostname contains a NUL byte".to_string()));
  }
  let mut packet = socks4_request(consts::SOCKS4A_PLACEHOLDER, port);
  packet.extend_from_slice(host.as_bytes());
  packet.push(0x00);
  Ok(packet)
}

/// Reply to a SOCKS4/4A request:
///
/// | VN | CD | DSTPORT | DSTIP |
/// | --- | --- | --- | --- |
/// | 1 | 1 | 2 | 4 |
///
/// `CD` is `0x5A` when the request was granted. `0x5B`..`0x5D` are refusals.
async fn read_socks4_reply<S>(stream: &mut S) -> Result<()>
where
  S: AsyncRead + Unpin,
{
  let mut reply = [0u8; 8];
  stream.read_exact(&mut reply).await?;
  if reply[1] != consts::SOCKS4_REPLY_GRANTED {
    return Err(Error::Socks4Rejected(reply[1]));
  }
  Ok(())
}

async fn socks4_connect<S>(stream: &mut S, ip: Ipv4Addr, port: u16) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(&socks4_request(ip, port)).await?;
  stream.flush().await?;
  read_socks4_reply(stream).await
}

async fn socks4a_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(&socks4a_request(host, port)?).await?;
  stream.flush().await?;
  read_socks4_reply(stream).await
}

/// SOCKS5 CONNECT with domain-name addressing:
///
/// | VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT |
/// | --- | --- | --- | --- | --- | --- |
/// | 0x05 | 0x01 | 0x00 | 0x03 | length byte + name | 2 bytes, big endian |
pub fn socks5_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
  if host.is_empty() || host.len() > u8::MAX as usize {
    return Err(Error::Socks(format!(
      "hostname length {} does not fit a SOCKS5 request",
      host.len()
    )));
  }
  let mut packet = Vec::with_capacity(7 + host.len());
  packet.extend_from_slice(&[
    consts::SOCKS5_VERSION,
    consts::SOCKS_CMD_CONNECT,
    0x00,
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME,
    host.len() as u8,
  ]);
  packet.extend_from_slice(host.as_bytes());
  packet.extend_from_slice(&port.to_be_bytes());
  Ok(packet)
}

async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // build before talking so an unencodable host fails without traffic
  let request = socks5_connect_request(host, port)?;
  socks5_select_method(stream).await?;
  stream.write_all(&request).await?;
  stream.flush().await?;
  read_socks5_reply(stream).await
}

/// Offer "no authentication" only:
///
/// | VER | NMETHODS | METHODS |
/// | --- | --- | --- |
/// | 0x05 | 0x01 | 0x00 |
///
/// The server must answer `{0x05, 0x00}`. Any other method choice means the
/// upstream wants credentials, which is unsupported.
async fn socks5_select_method<S>(stream: &mut S) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream
    .write_all(&[
      consts::SOCKS5_VERSION,
      0x01,
      consts::SOCKS5_AUTH_METHOD_NONE,
    ])
    .await?;
  stream.flush().await?;
  let mut buf = [0u8; 2];
  stream.read_exact(&mut buf).await?;
  let [version, method] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::Socks(format!(
      "unexpected version {:#04x} in method selection",
      version
    )));
  }
  if method != consts::SOCKS5_AUTH_METHOD_NONE {
    return Err(Error::Socks(format!(
      "upstream requires authentication method {:#04x}, which is unsupported",
      method
    )));
  }
  Ok(())
}

/// Connect reply:
///
/// | VER | REP | RSV | ATYP | BND.ADDR | BND.PORT |
/// | --- | --- | --- | --- | --- | --- |
/// | 0x05 | 0x00 on success | 0x00 | 0x01, 0x03 or 0x04 | 4, 1 + N or 16 bytes | 2 |
///
/// The bound address is read and discarded so that no reply byte leaks into
/// the relayed stream.
async fn read_socks5_reply<S>(stream: &mut S) -> Result<()>
where
  S: AsyncRead + Unpin,
{
  let mut header = [0u8; 4];
  stream.read_exact(&mut header).await?;
  let [version, reply, _rsv, address_type] = header;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::Socks(format!(
      "unexpected version {:#04x} in connect reply",
      version
    )));
  }
  if reply != consts::SOCKS5_REPLY_SUCCEEDED {
    return Err(Error::ReplyError(ReplyError::from(reply)));
  }
  let address_len = match address_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => 4,
    consts::SOCKS5_ADDR_TYPE_IPV6 => 16,
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      len[0] as usize
    }
    other => {
      return Err(Error::Socks(format!(
        "unexpected address type {:#04x} in connect reply",
        other
      )))
    }
  };
  // address plus port
  let mut bound = vec![0u8; address_len + 2];
  stream.read_exact(&mut bound).await?;
  Ok(())
}

#[rustfmt::skip]
pub(crate) mod consts {
  use std::net::Ipv4Addr;

  pub const SOCKS4_VERSION: u8 = 0x04;
  pub const SOCKS4_REPLY_GRANTED: u8 = 0x5a;
  pub const SOCKS4A_PLACEHOLDER: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

  pub const SOCKS_CMD_CONNECT: u8 = 0x01;

  pub const SOCKS5_VERSION: u8 = 0x05;
  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{duplex, DuplexStream};
  use tokio::task::JoinHandle;

  #[test]
  fn socks4_request_layout() {
    let packet = socks4_request(Ipv4Addr::new(93, 184, 216, 34), 8443);
    assert_eq!(
      packet,
      vec![0x04, 0x01, 0x20, 0xFB, 93, 184, 216, 34, 0x00]
    );
  }

  #[test]
  fn socks4a_request_layout() {
    let packet = socks4a_request("example.com", 8443).unwrap();
    let mut expected = vec![0x04, 0x01, 0x20, 0xFB, 0, 0, 0, 1, 0x00];
    expected.extend_from_slice(b"example.com");
    expected.push(0x00);
    assert_eq!(packet, expected);
  }

  #[test]
  fn socks5_request_layout() {
    let packet = socks5_connect_request("a.io", 80).unwrap();
    assert_eq!(
      packet,
      vec![0x05, 0x01, 0x00, 0x03, 0x04, b'a', b'.', b'i', b'o', 0x00, 0x50]
    );
  }

  #[test]
  fn socks5_request_rejects_unencodable_hosts() {
    assert!(socks5_connect_request("", 80).is_err());
    assert!(socks5_connect_request(&"a".repeat(256), 80).is_err());
    assert!(socks5_connect_request(&"a".repeat(255), 80).is_ok());
  }

  #[tokio::test]
  async fn socks4_granted() {
    let (mut client, mut server) = duplex(1024);
    let target = Target::new("10.1.2.3", 8443);
    let upstream = tokio::spawn(async move {
      let mut req = [0u8; 9];
      server.read_exact(&mut req).await.unwrap();
      server
        .write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
      req
    });
    negotiate(&mut client, ProxyKind::Socks4, &target)
      .await
      .unwrap();
    assert_eq!(
      upstream.await.unwrap(),
      [0x04, 0x01, 0x20, 0xFB, 10, 1, 2, 3, 0x00]
    );
  }

  #[tokio::test]
  async fn socks4_refusal_is_a_rejection() {
    for code in [0x5b, 0x5c, 0x5d, 0x00, 0xff] {
      let (mut client, mut server) = duplex(1024);
      tokio::spawn(async move {
        let mut req = [0u8; 9];
        server.read_exact(&mut req).await.unwrap();
        server
          .write_all(&[0x00, code, 0, 0, 0, 0, 0, 0])
          .await
          .unwrap();
      });
      let err = negotiate(&mut client, ProxyKind::Socks4, &Target::new("10.0.0.1", 80))
        .await
        .unwrap_err();
      assert!(matches!(err, Error::Socks4Rejected(c) if c == code));
    }
  }

  #[tokio::test]
  async fn socks4a_sends_hostname_and_accepts_grant() {
    let (mut client, mut server) = duplex(1024);
    let upstream = tokio::spawn(async move {
      let mut req = vec![0u8; 9 + "example.com".len() + 1];
      server.read_exact(&mut req).await.unwrap();
      server
        .write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
      req
    });
    negotiate(
      &mut client,
      ProxyKind::Socks4a,
      &Target::new("example.com", 8443),
    )
    .await
    .unwrap();
    let req = upstream.await.unwrap();
    assert_eq!(&req[..9], &[0x04, 0x01, 0x20, 0xFB, 0, 0, 0, 1, 0x00]);
    assert_eq!(&req[9..20], b"example.com");
    assert_eq!(req[20], 0x00);
  }

  #[tokio::test]
  async fn socks4_short_reply_fails() {
    let (mut client, mut server) = duplex(1024);
    tokio::spawn(async move {
      let mut req = [0u8; 9];
      server.read_exact(&mut req).await.unwrap();
      server.write_all(&[0x00, 0x5a, 0]).await.unwrap();
      // dropping the server end closes the stream mid-reply
    });
    let err = negotiate(&mut client, ProxyKind::Socks4, &Target::new("10.0.0.1", 80))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::IO(_)));
  }

  /// Serves one SOCKS5 exchange with the given connect reply, then writes
  /// `after` so the test can check nothing of the reply leaked.
  async fn socks5_upstream(
    reply: Vec<u8>,
    after: &'static [u8],
  ) -> (DuplexStream, JoinHandle<Vec<u8>>) {
    let (client, mut server) = duplex(1024);
    let handle = tokio::spawn(async move {
      let mut greeting = [0u8; 3];
      server.read_exact(&mut greeting).await.unwrap();
      assert_eq!(greeting, [0x05, 0x01, 0x00]);
      server.write_all(&[0x05, 0x00]).await.unwrap();
      let mut head = [0u8; 5];
      server.read_exact(&mut head).await.unwrap();
      let mut rest = vec![0u8; head[4] as usize + 2];
      server.read_exact(&mut rest).await.unwrap();
      server.write_all(&reply).await.unwrap();
      server.write_all(after).await.unwrap();
      let mut request = head.to_vec();
      request.extend(rest);
      request
    });
    (client, handle)
  }

  #[tokio::test]
  async fn socks5_drains_every_address_type() {
    let replies = vec![
      vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90],
      {
        let mut r = vec![0x05, 0x00, 0x00, 0x03, 9];
        r.extend_from_slice(b"proxy.lan");
        r.extend_from_slice(&[0x04, 0x38]);
        r
      },
      {
        let mut r = vec![0x05, 0x00, 0x00, 0x04];
        r.extend_from_slice(&[0u8; 16]);
        r.extend_from_slice(&[0x00, 0x50]);
        r
      },
    ];
    for reply in replies {
      let (mut client, upstream) = socks5_upstream(reply, b"HTTP/1.1").await;
      negotiate(&mut client, ProxyKind::Socks5, &Target::new("a.io", 80))
        .await
        .unwrap();
      let mut first = [0u8; 8];
      client.read_exact(&mut first).await.unwrap();
      assert_eq!(&first, b"HTTP/1.1");
      assert_eq!(
        upstream.await.unwrap(),
        vec![0x05, 0x01, 0x00, 0x03, 0x04, b'a', b'.', b'i', b'o', 0x00, 0x50]
      );
    }
  }

  #[tokio::test]
  async fn socks5_failure_code_is_a_rejection() {
    let (mut client, _upstream) =
      socks5_upstream(vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0], b"").await;
    let err = negotiate(&mut client, ProxyKind::Socks5, &Target::new("a.io", 80))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ReplyError(ReplyError::GeneralFailure)));
    assert!(err.is_rejection());
  }

  #[tokio::test]
  async fn socks5_unknown_address_type_fails() {
    let (mut client, _upstream) = socks5_upstream(vec![0x05, 0x00, 0x00, 0x07], b"").await;
    let err = negotiate(&mut client, ProxyKind::Socks5, &Target::new("a.io", 80))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Socks(_)));
  }

  #[tokio::test]
  async fn socks5_authentication_demand_is_refused() {
    let (mut client, mut server) = duplex(1024);
    tokio::spawn(async move {
      let mut greeting = [0u8; 3];
      server.read_exact(&mut greeting).await.unwrap();
      server.write_all(&[0x05, 0xff]).await.unwrap();
    });
    let err = negotiate(&mut client, ProxyKind::Socks5, &Target::new("a.io", 80))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Socks(_)));
  }

  #[tokio::test]
  async fn direct_needs_no_handshake() {
    let (mut client, _server) = duplex(16);
    negotiate(&mut client, ProxyKind::Direct, &Target::new("a.io", 80))
      .await
      .unwrap();
  }
}
