//! Relay activity snapshot.

use serde::{Deserialize, Serialize};

/// Counts of currently connected agents, pushed by the relay on request.
///
/// A snapshot has no lifecycle beyond "most recent value received";
/// consumers cache it and overwrite on the next push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BamStats {
    pub active_jobs: u64,
    pub active_machines: u64,
}
