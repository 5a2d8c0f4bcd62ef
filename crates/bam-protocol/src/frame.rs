//! Transport frames: the channel catalogue.
//!
//! A [`Frame`] is the unit the relay routes. Channels are transport-level
//! event lanes, not business semantics; the negotiation subjects travel
//! inside the `direct` and broadcast channels' [`Message`] payloads.

use serde::{Deserialize, Serialize};

use crate::{BamStats, Message};

/// One routed unit on the relay connection, tagged by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "kebab-case")]
pub enum Frame {
    /// First frame on a successful connection; carries the relay-assigned
    /// connection identifier.
    Connect { id: String },

    /// The relay refused the connection (bad access key, unknown group).
    ConnectError { reason: String },

    /// Broadcast to every job agent in the sender's group.
    AllJobs { message: Message },

    /// Broadcast to every machine agent in the sender's group.
    AllMachines { message: Message },

    /// Point-to-point delivery to the connection named in `message.to_id`.
    Direct { message: Message },

    /// The relay could not route a submitted message.
    MessageError { reason: String },

    /// With no payload: a client asking for a snapshot. With payload: the
    /// relay pushing the most recent one.
    Stats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<BamStats>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;

    #[test]
    fn test_channel_names() {
        let frame = Frame::AllJobs {
            message: Message::broadcast("m1", Payload::MachineIsLookingForJobs {}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"channel\":\"all-jobs\""));

        let frame = Frame::ConnectError {
            reason: "bad key".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"channel\":\"connect-error\""));
    }

    #[test]
    fn test_stats_request_has_no_payload() {
        let json = serde_json::to_string(&Frame::Stats { stats: None }).unwrap();
        assert_eq!(json, r#"{"channel":"stats"}"#);
    }

    #[test]
    fn test_stats_push_round_trip() {
        let frame = Frame::Stats {
            stats: Some(BamStats {
                active_jobs: 3,
                active_machines: 1,
            }),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"activeJobs\":3"));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_direct_frame_round_trip() {
        let frame = Frame::Direct {
            message: Message::direct("m1", "j1", Payload::MachineHasChosenAJob {}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }
}
