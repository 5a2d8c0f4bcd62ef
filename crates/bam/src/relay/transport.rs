//! The transport seam between agents and the broker.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use bam_protocol::{AgentRole, BamStats, Frame, Message};

/// Buffer size for inbound relay events.
pub(crate) const EVENT_BUFFER_SIZE: usize = 64;

/// Buffer size for outbound frames.
pub(crate) const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Credentials and role for one connection.
///
/// Keys are opaque pass-throughs; the broker validates them, not this
/// crate.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub access_key: String,
    pub group_key: Option<String>,
    pub role: AgentRole,
}

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay refused the credentials.
    #[error("relay rejected the connection: {0}")]
    Rejected(String),

    /// The relay could not be reached.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The connection is gone.
    #[error("relay connection closed")]
    Closed,
}

/// Inbound activity on one relay connection.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A broadcast on this connection's role channel.
    Broadcast(Message),
    /// A point-to-point message addressed to this connection.
    Direct(Message),
    /// A stats snapshot push.
    Stats(BamStats),
    /// The relay reported a routing failure.
    Error(String),
    /// The connection dropped.
    Closed,
}

/// Sends frames on one relay connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelaySender {
    outbound: mpsc::Sender<Frame>,
}

impl RelaySender {
    pub(crate) fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self { outbound }
    }

    pub async fn direct(&self, message: Message) -> Result<(), RelayError> {
        self.send(Frame::Direct { message }).await
    }

    pub async fn all_jobs(&self, message: Message) -> Result<(), RelayError> {
        self.send(Frame::AllJobs { message }).await
    }

    pub async fn all_machines(&self, message: Message) -> Result<(), RelayError> {
        self.send(Frame::AllMachines { message }).await
    }

    /// Ask for a stats snapshot; the reply arrives as [`RelayEvent::Stats`].
    pub async fn request_stats(&self) -> Result<(), RelayError> {
        self.send(Frame::Stats { stats: None }).await
    }

    async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RelayError::Closed)
    }
}

/// One live connection to the relay. Dropping it disconnects.
#[derive(Debug)]
pub struct RelayConnection {
    /// Relay-assigned identifier, stable for this connection's lifetime.
    pub id: String,
    pub sender: RelaySender,
    pub events: mpsc::Receiver<RelayEvent>,
}

/// Where the relay lives. Agents are generic over this seam so tests run
/// against the in-process hub and deployments against the WebSocket
/// client.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<RelayConnection, RelayError>;
}
