//! Hostname routing table
//!
//! Maps a destination hostname to the way the real destination is reached:
//! directly, or through a SOCKS4/SOCKS4A/SOCKS5 upstream. Patterns use shell
//! glob syntax (`*`, `?`, `[...]`), are case-sensitive and give `/` and `.`
//! no special meaning. The first matching rule wins; the default rule is
//! used when nothing matches.
use glob::{MatchOptions, Pattern};
use std::fmt;
use std::net::SocketAddr;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: false,
  require_literal_leading_dot: false,
};

/// How the destination is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
  /// Connect straight to the destination.
  Direct,
  /// SOCKS4, the destination is resolved locally.
  Socks4,
  /// SOCKS4A, the upstream resolves the destination.
  Socks4a,
  /// SOCKS5 with domain-name addressing.
  Socks5,
}

impl ProxyKind {
  /// Parse the scheme part of a rule URL.
  pub fn from_scheme(scheme: &str) -> Option<Self> {
    match scheme {
      "direct" => Some(ProxyKind::Direct),
      "socks4" => Some(ProxyKind::Socks4),
      "socks4a" => Some(ProxyKind::Socks4a),
      "socks5" => Some(ProxyKind::Socks5),
      _ => None,
    }
  }
  /// Scheme name as written in the configuration file.
  pub fn as_str(&self) -> &'static str {
    match self {
      ProxyKind::Direct => "direct",
      ProxyKind::Socks4 => "socks4",
      ProxyKind::Socks4a => "socks4a",
      ProxyKind::Socks5 => "socks5",
    }
  }
}

/// Where a request goes once routed. A SOCKS rule always carries its
/// upstream address, a direct rule never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
  /// No upstream proxy.
  Direct,
  /// Relay through a SOCKS proxy listening at `addr`.
  Socks {
    /// SOCKS4, SOCKS4A or SOCKS5; never [`ProxyKind::Direct`]
    kind: ProxyKind,
    /// resolved at configuration load time
    addr: SocketAddr,
  },
}

impl Upstream {
  /// The protocol used to reach the destination.
  pub fn kind(&self) -> ProxyKind {
    match self {
      Upstream::Direct => ProxyKind::Direct,
      Upstream::Socks { kind, .. } => *kind,
    }
  }
  /// The upstream proxy address, `None` for direct rules.
  pub fn addr(&self) -> Option<SocketAddr> {
    match self {
      Upstream::Direct => None,
      Upstream::Socks { addr, .. } => Some(*addr),
    }
  }
}

impl fmt::Display for Upstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Upstream::Direct => f.write_str("direct"),
      Upstream::Socks { kind, addr } => write!(f, "{}://{}", kind.as_str(), addr),
    }
  }
}

/// A `map` line: glob pattern plus upstream.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
  pattern: Pattern,
  upstream: Upstream,
}

impl ForwardingRule {
  /// Compile `pattern` and bind it to `upstream`.
  pub fn new(pattern: &str, upstream: Upstream) -> Result<Self, glob::PatternError> {
    Ok(Self {
      pattern: Pattern::new(pattern)?,
      upstream,
    })
  }
  /// The glob pattern as written.
  pub fn pattern(&self) -> &str {
    self.pattern.as_str()
  }
  /// The upstream used for matching hostnames.
  pub fn upstream(&self) -> &Upstream {
    &self.upstream
  }
  /// Whether `hostname` matches this rule's pattern.
  pub fn matches(&self, hostname: &str) -> bool {
    self.pattern.matches_with(hostname, MATCH_OPTIONS)
  }
}

/// Ordered rules plus the mandatory default. Immutable once built.
#[derive(Debug, Clone)]
pub struct RouteTable {
  rules: Vec<ForwardingRule>,
  default: Upstream,
}

impl RouteTable {
  /// Build a table. Rule order is lookup order.
  pub fn new(rules: Vec<ForwardingRule>, default: Upstream) -> Self {
    Self { rules, default }
  }
  /// The first rule matching `hostname`, or the default. Never fails.
  pub fn lookup(&self, hostname: &str) -> &Upstream {
    self
      .rules
      .iter()
      .find(|rule| rule.matches(hostname))
      .map(ForwardingRule::upstream)
      .unwrap_or(&self.default)
  }
  /// The rules in lookup order.
  pub fn rules(&self) -> &[ForwardingRule] {
    &self.rules
  }
  /// The rule used when nothing matches.
  pub fn default_upstream(&self) -> &Upstream {
    &self.default
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn socks(kind: ProxyKind, port: u16) -> Upstream {
    Upstream::Socks {
      kind,
      addr: SocketAddr::from(([127, 0, 0, 1], port)),
    }
  }

  fn table() -> RouteTable {
    RouteTable::new(
      vec![
        ForwardingRule::new("foo.*", Upstream::Direct).unwrap(),
        ForwardingRule::new("*.onion", socks(ProxyKind::Socks4a, 9050)).unwrap(),
        ForwardingRule::new("foo.example", socks(ProxyKind::Socks5, 1)).unwrap(),
        ForwardingRule::new("host-[0-9]?", socks(ProxyKind::Socks4, 2)).unwrap(),
      ],
      socks(ProxyKind::Socks5, 1080),
    )
  }

  #[test]
  fn first_match_wins() {
    // "foo.example" also matches the third rule, the first one takes it
    assert_eq!(table().lookup("foo.example"), &Upstream::Direct);
    assert_eq!(
      table().lookup("abc.onion"),
      &socks(ProxyKind::Socks4a, 9050)
    );
  }

  #[test]
  fn falls_back_to_default() {
    let t = table();
    assert_eq!(t.lookup("bar.example"), t.default_upstream());
    assert_eq!(t.lookup(""), t.default_upstream());
  }

  #[test]
  fn character_classes_and_single_wildcards() {
    let t = table();
    assert_eq!(t.lookup("host-1a"), &socks(ProxyKind::Socks4, 2));
    assert_eq!(t.lookup("host-x1"), t.default_upstream());
    assert_eq!(t.lookup("host-1"), t.default_upstream());
  }

  #[test]
  fn matching_is_case_sensitive() {
    let t = table();
    assert_eq!(t.lookup("FOO.example"), t.default_upstream());
  }

  #[test]
  fn separators_are_ordinary_characters() {
    let rule = ForwardingRule::new("a*z", Upstream::Direct).unwrap();
    assert!(rule.matches("a/b/z"));
    assert!(rule.matches("a.b.z"));
    let dot = ForwardingRule::new("*", Upstream::Direct).unwrap();
    assert!(dot.matches(".hidden"));
  }

  #[test]
  fn rules_keep_their_pattern_and_order() {
    let t = table();
    let patterns: Vec<_> = t.rules().iter().map(ForwardingRule::pattern).collect();
    assert_eq!(&patterns[..3], &["foo.*", "*.onion", "foo.example"]);
  }

  #[test]
  fn empty_table_always_yields_default() {
    let t = RouteTable::new(vec![], Upstream::Direct);
    assert_eq!(t.lookup("anything"), &Upstream::Direct);
  }

  #[test]
  fn upstream_accessors() {
    let up = socks(ProxyKind::Socks5, 1080);
    assert_eq!(up.kind(), ProxyKind::Socks5);
    assert_eq!(up.to_string(), "socks5://127.0.0.1:1080");
    assert_eq!(Upstream::Direct.addr(), None);
  }
}
