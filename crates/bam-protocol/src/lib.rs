//! Canonical protocol types for BAM job/machine negotiation.
//!
//! Everything that crosses the relay is described here: the [`Message`]
//! envelope with its subject-tagged payload, the [`Frame`] catalogue of
//! transport channels, the [`BamStats`] snapshot and the agent roles.
//! The types are pure data; routing and delivery live in the transport
//! layer of the `bam` crate.

mod frame;
mod message;
mod role;
mod stats;

pub use frame::Frame;
pub use message::{JobDetails, Message, Payload};
pub use role::AgentRole;
pub use stats::BamStats;
