//! Agent roles.

use serde::{Deserialize, Serialize};

/// Which side of the negotiation a connection speaks for.
///
/// Sent as the `agent-type` header during the connect handshake and used
/// by the relay to pick the broadcast audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Job,
    Machine,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Machine => "machine",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
