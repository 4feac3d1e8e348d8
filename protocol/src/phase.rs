use serde::{Deserialize, Serialize};
use std::fmt;

/// One logical request/response step of a protocol
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Status,
    Details,
    Players,
    Rules,
    Challenge,
    Version,
    Channels,
    Info,
    All,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Status => "status",
            Phase::Details => "details",
            Phase::Players => "players",
            Phase::Rules => "rules",
            Phase::Challenge => "challenge",
            Phase::Version => "version",
            Phase::Channels => "channels",
            Phase::Info => "info",
            Phase::All => "all",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Socket kind a protocol speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}
