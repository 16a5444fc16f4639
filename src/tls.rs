//! TLS configuration for both legs of an intercepted connection
//!
//! The inbound leg is terminated with a leaf certificate minted for the
//! client's SNI. The outbound leg is a fresh client session to the origin,
//! unverified unless a CA bundle is configured.
//!
//! Neither side advertises ALPN, so both sessions settle on HTTP/1.1 and the
//! relayed bytes stay meaningful to either peer.
use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<CryptoProvider> {
  Arc::new(ring::default_provider())
}

/// Picks the certificate for an inbound handshake: a fresh leaf for the
/// client's SNI, or the wildcard fallback without one.
pub struct LeafResolver {
  ca: Arc<CertificateAuthority>,
}

impl LeafResolver {
  /// Resolver issuing from `ca`.
  pub fn new(ca: Arc<CertificateAuthority>) -> Self {
    Self { ca }
  }
}

impl fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafResolver").field("ca", &self.ca).finish()
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let sni = client_hello.server_name();
    match self.ca.issue_leaf(sni) {
      Ok(key) => Some(key),
      Err(e) => {
        // no certificate aborts the handshake
        tracing::warn!("failed to issue certificate for {:?}: {}", sni, e);
        None
      }
    }
  }
}

/// Server side of the interception: certificates come from `ca`, client
/// certificates are never requested.
pub fn acceptor(ca: Arc<CertificateAuthority>) -> Result<TlsAcceptor> {
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(LeafResolver::new(ca)));
  Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side of the interception. With `verify` unset every origin
/// certificate is accepted; otherwise origins must chain to a certificate in
/// the PEM bundle at that path.
pub fn connector(verify: Option<&Path>) -> Result<TlsConnector> {
  let builder = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?;
  let config = match verify {
    None => builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth(),
    Some(bundle) => builder
      .with_root_certificates(load_roots(bundle)?)
      .with_no_client_auth(),
  };
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Read every certificate in a PEM bundle into a root store.
pub fn load_roots(bundle: &Path) -> Result<RootCertStore> {
  let file = std::fs::File::open(bundle).map_err(|e| {
    Error::Certificate(format!("Failed to open CA bundle {}: {}", bundle.display(), e))
  })?;
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
    let cert =
      cert.map_err(|e| Error::Certificate(format!("Invalid certificate in bundle: {}", e)))?;
    roots.add(cert)?;
  }
  if roots.is_empty() {
    return Err(Error::Certificate(format!(
      "No certificate found in {}",
      bundle.display()
    )));
  }
  Ok(roots)
}

/// The SNI value presented to the origin.
pub fn server_name(hostname: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(hostname.to_string())
    .map_err(|_| Error::Tls(TLSError::General(format!("invalid server name: {}", hostname))))
}

/// Accepts any origin certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    ring::default_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
