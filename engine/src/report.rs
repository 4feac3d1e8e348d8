//! Per-server outcome of a run

use protocol::{Phase, QueryError, QueryResult};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Where one (server, phase) pair ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Queued, not sent yet
    Idle,
    /// Waiting for the challenge round to finish
    Challenged,
    Sent,
    Complete,
    TimedOut,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct PhaseFailure {
    pub phase: Phase,
    #[serde(serialize_with = "display")]
    pub error: QueryError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Datagrams or connections sent, retries included
    pub attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ServerReport {
    pub id: String,
    /// Registry id the server was requested with
    pub protocol: String,
    /// Human-readable game title, when the protocol is known
    pub name: Option<String>,
    pub address: String,
    pub port_client: u16,
    pub port_query: Option<u16>,
    pub online: bool,
    pub join_link: Option<String>,
    pub phases: BTreeMap<Phase, PhaseStatus>,
    pub failed_phases: Vec<PhaseFailure>,
    /// Set when the server could not be queried at all
    #[serde(serialize_with = "display_opt")]
    pub error: Option<QueryError>,
    pub stats: ServerStats,
    pub result: QueryResult,
}

impl ServerReport {
    pub fn status(&self, phase: Phase) -> Option<PhaseStatus> {
        self.phases.get(&phase).copied()
    }

    /// The error recorded for `phase`, if it failed
    pub fn failed(&self, phase: Phase) -> Option<&QueryError> {
        self.failed_phases
            .iter()
            .find(|failure| failure.phase == phase)
            .map(|failure| &failure.error)
    }
}

fn display<S: Serializer>(error: &QueryError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

fn display_opt<S: Serializer>(error: &Option<QueryError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.collect_str(error),
        None => serializer.serialize_none(),
    }
}
