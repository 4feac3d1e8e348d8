//! Command-line helpers: target parsing, server lists and report output

use engine::ServerReport;
use protocol::{QueryError, ServerDescriptor};
use std::error::Error;
use std::fs;
use std::path::Path;

/// Parses `type:host:port`, e.g. `css:203.0.113.7:27015` or `quake3:[::1]:27960`
pub fn parse_target(spec: &str) -> Result<ServerDescriptor, QueryError> {
    let (protocol, address) = spec
        .split_once(':')
        .filter(|(protocol, _)| !protocol.is_empty())
        .ok_or_else(|| QueryError::InvalidAddress(spec.to_string()))?;
    ServerDescriptor::new(protocol, address)
}

/// Reads a JSON array of server descriptors
///
/// ```json
/// [{"type": "css", "host": "203.0.113.7", "port": 27015},
///  {"type": "arma3", "host": "198.51.100.2", "port": 2302, "options": {"query_port": 2303}}]
/// ```
pub fn load_servers(path: &Path) -> Result<Vec<ServerDescriptor>, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    parse_servers(&contents)
}

pub fn parse_servers(json: &str) -> Result<Vec<ServerDescriptor>, Box<dyn Error>> {
    let servers: Vec<ServerDescriptor> = serde_json::from_str(json)?;
    Ok(servers)
}

/// Serializes reports as a JSON array
pub fn render_reports(reports: &[ServerReport], pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(reports)
    } else {
        serde_json::to_string(reports)
    }
}
