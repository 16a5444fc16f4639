//! Certificate Authority for TLS interception
//!
//! Holds the root certificate and key loaded at startup plus one RSA leaf
//! key shared by every issued certificate. Leaves are signed on demand, one per
//! intercepted connection, with a serial taken from an atomic counter so
//! concurrent handlers never reuse one. A wildcard leaf with common name `*`
//! is minted once at startup for clients that send no SNI.
//!
use crate::errors::{Error, Result};
use rcgen::{
  CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, KeyUsagePurpose, SanType,
  PKCS_RSA_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::sign::{CertifiedKey, SigningKey};

/// Common name of the fallback certificate.
pub const WILDCARD: &str = "*";
/// Validity of per-connection leaves on either side of the issuance time.
const LEAF_VALIDITY_DAYS: i64 = 1;
/// Validity of the startup wildcard leaf.
const WILDCARD_VALIDITY_DAYS: i64 = 3650;
/// First serial handed out. RFC 5280 wants serials positive.
const FIRST_SERIAL: u64 = 1;

/// Certificate Authority for minting interception certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format, appended to every chain
  root_der: CertificateDer<'static>,
  /// Key pair shared by every leaf
  leaf_key: KeyPair,
  /// rustls view of `leaf_key`
  signing_key: Arc<dyn SigningKey>,
  /// Next serial number
  next_serial: AtomicU64,
  /// Fallback leaf for handshakes without SNI
  wildcard: Arc<CertifiedKey>,
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("next_serial", &self.next_serial)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the root certificate and its private key from PEM files. The key
  /// may be PKCS#8, PKCS#1 (`RSA PRIVATE KEY`) or SEC1 (`EC PRIVATE KEY`).
  pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
      Error::Certificate(format!("Failed to read CA cert {}: {}", cert_path.display(), e))
    })?;
    let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
      Error::Certificate(format!("Failed to read CA key {}: {}", key_path.display(), e))
    })?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the authority from PEM text, generate the shared leaf key and
  /// mint the wildcard fallback.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = parse_key(key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("Failed to create issuer from CA cert: {}", e)))?;
    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::Certificate("No certificate found in PEM".to_string()))?
      .map_err(|e| Error::Certificate(format!("Failed to parse PEM: {}", e)))?;

    // key usage only allows encipherment, which an ECDSA key cannot honour
    let leaf_key = KeyPair::generate_for(&PKCS_RSA_SHA256)
      .map_err(|e| Error::Certificate(format!("Failed to generate key pair: {}", e)))?;
    let leaf_key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let signing_key = any_supported_type(&leaf_key_der)?;

    let next_serial = AtomicU64::new(FIRST_SERIAL);
    let wildcard = sign_leaf(
      &issuer,
      &leaf_key,
      next_serial.fetch_add(1, Ordering::Relaxed),
      WILDCARD,
      Duration::days(LEAF_VALIDITY_DAYS),
      Duration::days(WILDCARD_VALIDITY_DAYS),
    )?;
    let wildcard = Arc::new(CertifiedKey::new(
      vec![wildcard, root_der.clone()],
      signing_key.clone(),
    ));
    Ok(Self {
      issuer,
      root_der,
      leaf_key,
      signing_key,
      next_serial,
      wildcard,
    })
  }

  /// Issue a leaf for `hostname`, or hand back the wildcard fallback when
  /// there is none. Safe to call from many tasks at once.
  pub fn issue_leaf(&self, hostname: Option<&str>) -> Result<Arc<CertifiedKey>> {
    match hostname {
      None => Ok(self.wildcard.clone()),
      Some(hostname) => {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let leaf = sign_leaf(
          &self.issuer,
          &self.leaf_key,
          serial,
          hostname,
          Duration::days(LEAF_VALIDITY_DAYS),
          Duration::days(LEAF_VALIDITY_DAYS),
        )?;
        Ok(Arc::new(CertifiedKey::new(
          vec![leaf, self.root_der.clone()],
          self.signing_key.clone(),
        )))
      }
    }
  }

  /// The root certificate in DER format.
  pub fn root_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }
}

fn parse_key(key_pem: &str) -> Result<KeyPair> {
  let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
    .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {}", e)))?
    .ok_or_else(|| Error::Certificate("No private key found in PEM".to_string()))?;
  KeyPair::try_from(&key_der)
    .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {}", e)))
}

fn sign_leaf(
  issuer: &Issuer<'static, KeyPair>,
  leaf_key: &KeyPair,
  serial: u64,
  hostname: &str,
  back: Duration,
  ahead: Duration,
) -> Result<CertificateDer<'static>> {
  let mut params = CertificateParams::default();
  params.serial_number = Some(serial.into());

  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, hostname);
  params.distinguished_name = dn;

  params.subject_alt_names = subject_alt_names(hostname);
  params.key_usages = vec![
    KeyUsagePurpose::DataEncipherment,
    KeyUsagePurpose::KeyEncipherment,
  ];

  let now = OffsetDateTime::now_utc();
  params.not_before = now - back;
  params.not_after = now + ahead;

  let cert = params
    .signed_by(leaf_key, issuer)
    .map_err(|e| Error::Certificate(format!("Failed to sign leaf for {}: {}", hostname, e)))?;
  tracing::debug!("issued certificate for {} (serial {})", hostname, serial);
  Ok(CertificateDer::from(cert.der().to_vec()))
}

fn subject_alt_names(hostname: &str) -> Vec<SanType> {
  if hostname == WILDCARD {
    return Vec::new();
  }
  if let Ok(ip) = hostname.parse::<IpAddr>() {
    return vec![SanType::IpAddress(ip)];
  }
  // names that are not valid IA5 strings still get a CN-only certificate
  match hostname.try_into() {
    Ok(dns_name) => vec![SanType::DnsName(dns_name)],
    Err(_) => Vec::new(),
  }
}
