//! The negotiation envelope and its subject catalogue.
//!
//! One message type serves every negotiation subject. The payload is a
//! tagged union keyed by `subject`, so each handler receives exactly the
//! fields its subject carries and malformed bodies fail at parse time.

use serde::{Deserialize, Serialize};

/// A negotiation message exchanged through the relay.
///
/// `from_id` and `to_id` are relay-assigned connection identifiers: stable
/// for the lifetime of one connection, unique at any instant, and reused
/// across reconnects. `to_id` is empty on broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub from_id: String,
    pub to_id: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// Build a point-to-point message.
    pub fn direct(from_id: impl Into<String>, to_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            payload,
        }
    }

    /// Build a broadcast message. The relay fills in the audience, so the
    /// recipient field stays empty.
    pub fn broadcast(from_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: String::new(),
            payload,
        }
    }
}

/// Business payload, tagged by negotiation subject.
///
/// Wire shape is `{"subject": "...", "body": {...}}` as the broker
/// contract requires; subjects with nothing to say still carry an empty
/// body object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", content = "body", rename_all = "kebab-case")]
pub enum Payload {
    /// A machine opens a discovery round.
    MachineIsLookingForJobs {},

    /// A job offers itself to the machine that asked.
    JobIsAvailable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<JobDetails>,
    },

    /// The machine picked one of the offers it collected.
    MachineHasChosenAJob {},

    /// The chosen job hands over its payload.
    JobHasAcceptedMachinesOffer { gcode: String },

    /// The job is already taken (a job honors only its first acceptance).
    JobHasDeclinedMachinesOffer {},
}

impl Payload {
    /// The wire name of this subject.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::MachineIsLookingForJobs {} => "machine-is-looking-for-jobs",
            Self::JobIsAvailable { .. } => "job-is-available",
            Self::MachineHasChosenAJob {} => "machine-has-chosen-a-job",
            Self::JobHasAcceptedMachinesOffer { .. } => "job-has-accepted-machines-offer",
            Self::JobHasDeclinedMachinesOffer {} => "job-has-declined-machines-offer",
        }
    }
}

/// Submitter-provided details attached to an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
    pub name: String,
    pub material: String,
}
