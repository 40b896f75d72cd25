//! Bridge line validation and the bridge registry.
//!
//! Bridges are non-public relays, optionally wrapped in a pluggable transport.
//! Every line is parsed and validated before it is stored; the registry never
//! holds a line Tor would refuse.
//!
//! # Accepted Shapes
//!
//! ```text
//! [Bridge] <addr:port> [fingerprint]                              ◄── vanilla
//! [Bridge] obfs4 <addr:port> <fingerprint> cert=<..> iat-mode=<n>
//! [Bridge] meek_lite <addr:port> [fingerprint] url=<..> [front=<..>]
//! [Bridge] snowflake <addr:port> <fingerprint> [key=value ...]
//! [Bridge] webtunnel <addr:port> <fingerprint> url=<..> [ver=<..>]
//! ```
//!
//! `meek` is accepted as an alias for `meek_lite`. Addresses must be literal
//! socket addresses (`1.2.3.4:443` or `[2001:db8::1]:443`).
//!
//! # What This Module Does NOT Do
//!
//! - **Bridge discovery**: lines come from the caller (BridgeDB, moat, etc.)
//! - **Reachability checks**: Tor reports bridge failures through its own events

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pluggable transport wrapping a bridge connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Plain bridge, no transport.
    None,
    /// obfs4 (lyrebird).
    Obfs4,
    /// meek_lite domain fronting.
    MeekLite,
    /// Snowflake WebRTC proxies.
    Snowflake,
    /// WebTunnel HTTPS upgrade.
    Webtunnel,
}

impl Transport {
    /// Name of the transport as written in bridge lines and torrc.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::None => "none",
            Transport::Obfs4 => "obfs4",
            Transport::MeekLite => "meek_lite",
            Transport::Snowflake => "snowflake",
            Transport::Webtunnel => "webtunnel",
        }
    }

    fn requires_fingerprint(&self) -> bool {
        matches!(
            self,
            Transport::Obfs4 | Transport::Snowflake | Transport::Webtunnel
        )
    }

    fn required_params(&self) -> &'static [&'static str] {
        match self {
            Transport::None | Transport::Snowflake => &[],
            Transport::Obfs4 => &["cert", "iat-mode"],
            Transport::MeekLite | Transport::Webtunnel => &["url"],
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "vanilla" => Ok(Transport::None),
            "obfs4" => Ok(Transport::Obfs4),
            "meek" | "meek_lite" => Ok(Transport::MeekLite),
            "snowflake" => Ok(Transport::Snowflake),
            "webtunnel" => Ok(Transport::Webtunnel),
            other => Err(Error::Validation(format!(
                "unsupported bridge transport: {}",
                other
            ))),
        }
    }
}

/// A validated bridge line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeLine {
    /// Transport in use, [`Transport::None`] for vanilla bridges.
    pub transport: Transport,
    /// Normalized line, without the `Bridge` keyword.
    pub raw: String,
    /// Bridge socket address.
    pub address: SocketAddr,
    /// Uppercase hex relay fingerprint, if given.
    pub fingerprint: Option<String>,
    /// Transport arguments in their original order.
    pub params: Vec<(String, String)>,
}

impl BridgeLine {
    /// Parses and validates a single bridge line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the line is empty, names an unknown
    /// transport, has a malformed address or fingerprint, or lacks the
    /// arguments its transport needs.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tor_manager::bridges::{BridgeLine, Transport};
    ///
    /// let line = BridgeLine::parse(
    ///     "Bridge obfs4 192.0.2.10:443 0123456789ABCDEF0123456789ABCDEF01234567 cert=abc iat-mode=0",
    /// ).unwrap();
    /// assert_eq!(line.transport, Transport::Obfs4);
    /// assert!(BridgeLine::parse("obfs4 192.0.2.10:443").is_err());
    /// ```
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens
            .first()
            .is_some_and(|t| t.eq_ignore_ascii_case("bridge"))
        {
            tokens.remove(0);
        }
        if tokens.is_empty() {
            return Err(Error::Validation("bridge line is empty".to_string()));
        }

        let mut rest = tokens.iter().copied();
        let first = rest.next().unwrap_or_default();
        let (transport, addr_token) = match first.parse::<SocketAddr>() {
            Ok(_) => (Transport::None, first),
            Err(_) => {
                let transport: Transport = first.parse()?;
                if transport == Transport::None {
                    return Err(Error::Validation(
                        "vanilla bridges are written without a transport name".to_string(),
                    ));
                }
                let addr = rest.next().ok_or_else(|| {
                    Error::Validation(format!("{} bridge is missing an address", transport))
                })?;
                (transport, addr)
            }
        };

        let address: SocketAddr = addr_token.parse().map_err(|_| {
            Error::Validation(format!("invalid bridge address: {}", addr_token))
        })?;

        let mut fingerprint = None;
        let mut params = Vec::new();
        for token in rest {
            if let Some((key, value)) = token.split_once('=') {
                if key.is_empty() {
                    return Err(Error::Validation(format!(
                        "invalid bridge argument: {}",
                        token
                    )));
                }
                params.push((key.to_string(), value.to_string()));
            } else if fingerprint.is_none() && params.is_empty() && is_fingerprint(token) {
                fingerprint = Some(token.to_ascii_uppercase());
            } else {
                return Err(Error::Validation(format!(
                    "unexpected token in bridge line: {}",
                    token
                )));
            }
        }

        if transport.requires_fingerprint() && fingerprint.is_none() {
            return Err(Error::Validation(format!(
                "{} bridge requires a 40-character hex fingerprint",
                transport
            )));
        }
        if transport == Transport::None && !params.is_empty() {
            return Err(Error::Validation(
                "vanilla bridges take no transport arguments".to_string(),
            ));
        }
        for required in transport.required_params() {
            if !params.iter().any(|(k, v)| k == required && !v.is_empty()) {
                return Err(Error::Validation(format!(
                    "{} bridge requires {}=",
                    transport, required
                )));
            }
        }

        let mut parts: Vec<String> = Vec::with_capacity(tokens.len());
        if transport != Transport::None {
            parts.push(transport.as_str().to_string());
        }
        parts.push(address.to_string());
        if let Some(ref fp) = fingerprint {
            parts.push(fp.clone());
        }
        parts.extend(params.iter().map(|(k, v)| format!("{}={}", k, v)));

        Ok(Self {
            transport,
            raw: parts.join(" "),
            address,
            fingerprint,
            params,
        })
    }
}

impl fmt::Display for BridgeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Returns true if `s` is a 40-character hex relay fingerprint.
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Ordered collection of validated bridge lines.
///
/// Duplicates are allowed (Tor tolerates repeats) and insertion order is kept
/// so that rendering the torrc is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRegistry {
    bridges: Vec<BridgeLine>,
}

impl BridgeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configured lines, failing on the first bad one.
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for line in lines {
            registry.add(line.as_ref())?;
        }
        Ok(registry)
    }

    /// Validates and appends a bridge line, returning the new count.
    ///
    /// On error the registry is left untouched.
    pub fn add(&mut self, line: &str) -> Result<usize> {
        let bridge = BridgeLine::parse(line)?;
        self.bridges.push(bridge);
        Ok(self.bridges.len())
    }

    /// Removes every bridge.
    pub fn clear(&mut self) {
        self.bridges.clear();
    }

    /// Number of stored bridges.
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Returns true if no bridges are stored.
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Iterates over bridges in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BridgeLine> {
        self.bridges.iter()
    }

    /// Distinct pluggable transports used by the stored bridges.
    pub fn transports(&self) -> BTreeSet<Transport> {
        self.bridges
            .iter()
            .map(|b| b.transport)
            .filter(|t| *t != Transport::None)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn test_parse_vanilla() {
        let line = BridgeLine::parse(&format!("192.0.2.1:9001 {}", FP.to_lowercase())).unwrap();
        assert_eq!(line.transport, Transport::None);
        assert_eq!(line.fingerprint.as_deref(), Some(FP));
        assert_eq!(line.raw, format!("192.0.2.1:9001 {}", FP));
    }

    #[test]
    fn test_parse_obfs4_with_bridge_keyword() {
        let input = format!(
            "Bridge   obfs4 192.0.2.10:443 {}  cert=AbCd+/= iat-mode=0",
            FP
        );
        let line = BridgeLine::parse(&input).unwrap();
        assert_eq!(line.transport, Transport::Obfs4);
        assert_eq!(line.params.len(), 2);
        assert_eq!(
            line.raw,
            format!("obfs4 192.0.2.10:443 {} cert=AbCd+/= iat-mode=0", FP)
        );
    }

    #[test]
    fn test_obfs4_requires_cert_and_fingerprint() {
        assert!(BridgeLine::parse(&format!("obfs4 192.0.2.10:443 {} iat-mode=0", FP)).is_err());
        assert!(BridgeLine::parse("obfs4 192.0.2.10:443 cert=x iat-mode=0").is_err());
    }

    #[test]
    fn test_meek_alias_and_optional_fingerprint() {
        let line = BridgeLine::parse(
            "meek 192.0.2.18:80 url=https://meek.example.net/ front=cdn.example.com",
        )
        .unwrap();
        assert_eq!(line.transport, Transport::MeekLite);
        assert!(line.fingerprint.is_none());
        assert!(line.raw.starts_with("meek_lite "));
    }

    #[test]
    fn test_snowflake_and_ipv6_webtunnel() {
        let snow = BridgeLine::parse(&format!(
            "snowflake 192.0.2.3:80 {} fingerprint={} url=https://snowflake.example/",
            FP, FP
        ))
        .unwrap();
        assert_eq!(snow.transport, Transport::Snowflake);

        let web = BridgeLine::parse(&format!(
            "webtunnel [2001:db8::1]:443 {} url=https://example.org/path ver=0.0.1",
            FP
        ))
        .unwrap();
        assert_eq!(web.address.port(), 443);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "   ",
            "Bridge",
            "obfs5 192.0.2.1:1 cert=a",
            "not-an-address",
            "192.0.2.1 9001",
            "192.0.2.1:9001 ZZZ",
            "192.0.2.1:9001 cert=x",
            "none 192.0.2.1:9001",
            "meek_lite 192.0.2.18:80",
        ] {
            assert!(BridgeLine::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_registry_rejects_without_mutation() {
        let mut registry = BridgeRegistry::new();
        assert_eq!(registry.add("192.0.2.1:9001").unwrap(), 1);
        assert!(registry.add("").is_err());
        assert!(registry.add("garbage line").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_keeps_order_and_duplicates() {
        let mut registry = BridgeRegistry::new();
        registry.add("192.0.2.2:9001").unwrap();
        registry.add("192.0.2.1:9001").unwrap();
        registry.add("192.0.2.2:9001").unwrap();
        let raws: Vec<&str> = registry.iter().map(|b| b.raw.as_str()).collect();
        assert_eq!(raws, ["192.0.2.2:9001", "192.0.2.1:9001", "192.0.2.2:9001"]);
        assert!(registry.transports().is_empty());
    }

    #[test]
    fn test_registry_transports() {
        let registry = BridgeRegistry::from_lines([
            format!("obfs4 192.0.2.10:443 {} cert=a iat-mode=0", FP),
            format!("snowflake 192.0.2.3:80 {}", FP),
            format!("obfs4 192.0.2.11:443 {} cert=b iat-mode=1", FP),
        ])
        .unwrap();
        let transports: Vec<Transport> = registry.transports().into_iter().collect();
        assert_eq!(transports, [Transport::Obfs4, Transport::Snowflake]);
    }
}
