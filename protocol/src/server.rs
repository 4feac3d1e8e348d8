//! Query targets
//!
//! A [`ServerDescriptor`] names one server to query: the protocol definition id,
//! the host and the client (game) port, plus per-target options. It never
//! changes once built; the port actually queried is derived by the definition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::{QueryError, Result};

/// Per-target overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Explicit query port, for servers where it cannot be derived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_port: Option<u16>,
    /// Anything else a definition may look at
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Caller-chosen id; defaults to `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Protocol definition id, e.g. `source` or `quake3`
    #[serde(rename = "type")]
    pub protocol: String,
    pub host: String,
    /// Client (game) port
    pub port: u16,
    #[serde(default)]
    pub options: ServerOptions,
}

impl ServerDescriptor {
    /// Parses `host:port`, `a.b.c.d:port` or `[v6]:port`
    pub fn new(protocol: impl Into<String>, address: &str) -> Result<Self> {
        let (host, port) = split_address(address)?;
        Ok(Self {
            id: None,
            protocol: protocol.into(),
            host,
            port,
            options: ServerOptions::default(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_query_port(mut self, port: u16) -> Self {
        self.options.query_port = Some(port);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.extra.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format_address(&self.host, self.port),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.extra.get(key).map(String::as_str)
    }
}

/// The host and port a query is actually sent to
///
/// Starts out as the descriptor's host and derived query port; a definition's
/// pre-send hook may point it somewhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    pub host: String,
    pub port: u16,
}

impl QueryTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_address(&self.host, self.port))
    }
}

fn split_address(address: &str) -> Result<(String, u16)> {
    let invalid = || QueryError::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        address.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || (host.contains(':') && host.parse::<IpAddr>().is_err()) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let server = ServerDescriptor::new("source", "127.0.0.1:27015").unwrap();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 27015);
        assert_eq!(server.id(), "127.0.0.1:27015");
    }

    #[test]
    fn test_parse_hostname_and_ipv6() {
        let server = ServerDescriptor::new("quake3", "q3.example.org:27960").unwrap();
        assert_eq!(server.host, "q3.example.org");

        let server = ServerDescriptor::new("quake3", "[::1]:27960").unwrap();
        assert_eq!(server.host, "::1");
        assert_eq!(server.id(), "[::1]:27960");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["nohost", ":27015", "host:99999", "[::1]27015", "a:b:27015", "host:port"] {
            assert!(
                matches!(ServerDescriptor::new("source", bad), Err(QueryError::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_options_deserialize() {
        let json = r#"{"type":"arma3","host":"10.0.0.1","port":2302,"options":{"query_port":2303,"master":"yes"}}"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(server.options.query_port, Some(2303));
        assert_eq!(server.option("master"), Some("yes"));
        assert_eq!(server.protocol, "arma3");
    }

    #[test]
    fn test_builders() {
        let server = ServerDescriptor::new("source", "1.2.3.4:1")
            .unwrap()
            .with_id("main")
            .with_query_port(2)
            .with_option("k", "v");
        assert_eq!(server.id(), "main");
        assert_eq!(server.options.query_port, Some(2));
        assert_eq!(server.option("k"), Some("v"));
    }
}
