#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # transock
//!
//! A transparent forwarding proxy. Connections redirected to it (by a
//! firewall rule, typically) are routed by the hostname they ask for:
//!
//! - plaintext HTTP by its `Host:` header,
//! - TLS by terminating the session with a certificate minted on the fly for
//!   the client's SNI, then reading the `Host:` header of the first request.
//!
//! Each hostname is matched against glob rules and reaches its origin either
//! directly or through a SOCKS4, SOCKS4A or SOCKS5 upstream.
//!
//! ## Routing
//!
//! ```rust
//! use transock::{ForwardingRule, RouteTable, Upstream};
//!
//! let table = RouteTable::new(
//!   vec![ForwardingRule::new("*.lan", Upstream::Direct).unwrap()],
//!   Upstream::Socks {
//!     kind: transock::ProxyKind::Socks5,
//!     addr: "127.0.0.1:9050".parse().unwrap(),
//!   },
//! );
//! assert_eq!(table.lookup("nas.lan"), &Upstream::Direct);
//! assert_eq!(table.lookup("example.com").to_string(), "socks5://127.0.0.1:9050");
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! let config: transock::Config = "listen 8080\ndefault direct\n".parse().unwrap();
//! assert_eq!(config.listen, Some(8080));
//! ```
//!
//! See [`config`] for every directive.
//!
//! ## TLS interception
//!
//! Origin certificates are **not** verified unless `sslverify` names a CA
//! bundle: the proxy is an interception point, and clients only ever see
//! certificates signed by the configured root. All issued leaves share one
//! private key.

pub mod ca;
pub mod config;
mod connector;
mod errors;
pub mod handler;
pub mod relay;
pub mod route;
pub mod server;
pub mod socks;
pub mod target;
pub mod tls;

pub use ca::CertificateAuthority;
pub use config::Config;
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, ReplyError, Result};
pub use handler::Handler;
pub use relay::{relay, RelayEnd, RelayStats};
pub use route::{ForwardingRule, ProxyKind, RouteTable, Upstream};
pub use server::{Protocol, ProxyServer, ProxyState};
pub use target::Target;
