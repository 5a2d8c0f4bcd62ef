//! In-process relay hub.
//!
//! A broker stand-in that implements the same contract as the remote
//! relay: connection-scoped identifiers, addressed delivery, per-group
//! broadcast to one role's audience, and stats snapshots. It backs the
//! integration tests and single-host setups; the production broker stays
//! an external service.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;

use bam_protocol::{AgentRole, BamStats, Frame, Message};

use super::transport::{
    ConnectOptions, EVENT_BUFFER_SIZE, OUTBOUND_BUFFER_SIZE, RelayConnection, RelayError,
    RelayEvent, RelaySender, RelayTransport,
};

/// Length of hub-assigned connection identifiers.
const CONNECTION_ID_LENGTH: usize = 12;

struct HubConnection {
    role: AgentRole,
    group: Option<String>,
    events: mpsc::Sender<RelayEvent>,
}

type ConnectionTable = DashMap<String, HubConnection>;

/// In-process relay hub.
pub struct RelayHub {
    access_key: String,
    connections: Arc<ConnectionTable>,
}

impl RelayHub {
    /// A hub that admits connections presenting `access_key`.
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Current activity counts.
    pub fn stats(&self) -> BamStats {
        compute_stats(&self.connections)
    }
}

#[async_trait]
impl RelayTransport for RelayHub {
    async fn connect(&self, options: ConnectOptions) -> Result<RelayConnection, RelayError> {
        if options.access_key != self.access_key {
            return Err(RelayError::Rejected("bad access key".to_string()));
        }

        let id = nanoid::nanoid!(CONNECTION_ID_LENGTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER_SIZE);

        self.connections.insert(
            id.clone(),
            HubConnection {
                role: options.role,
                group: options.group_key.clone(),
                events: event_tx,
            },
        );
        debug!("hub connection {id} opened as {}", options.role);

        let connections = Arc::clone(&self.connections);
        let conn_id = id.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                route(&connections, &conn_id, frame).await;
            }
            // The agent dropped its sender: the connection is gone.
            connections.remove(&conn_id);
            debug!("hub connection {conn_id} closed");
        });

        Ok(RelayConnection {
            id,
            sender: RelaySender::new(outbound_tx),
            events: event_rx,
        })
    }
}

async fn route(connections: &ConnectionTable, from_id: &str, frame: Frame) {
    match frame {
        Frame::Direct { message } => {
            let target = connections
                .get(&message.to_id)
                .map(|conn| conn.events.clone());
            match target {
                Some(events) => {
                    let _ = events.send(RelayEvent::Direct(message)).await;
                }
                None => {
                    let reason = format!("no connection {}", message.to_id);
                    reply(connections, from_id, RelayEvent::Error(reason)).await;
                }
            }
        }
        Frame::AllJobs { message } => {
            broadcast(connections, from_id, AgentRole::Job, message).await;
        }
        Frame::AllMachines { message } => {
            broadcast(connections, from_id, AgentRole::Machine, message).await;
        }
        Frame::Stats { stats: None } => {
            let stats = compute_stats(connections);
            reply(connections, from_id, RelayEvent::Stats(stats)).await;
        }
        other => debug!("hub ignoring frame from {from_id}: {other:?}"),
    }
}

async fn broadcast(
    connections: &ConnectionTable,
    from_id: &str,
    audience: AgentRole,
    message: Message,
) {
    let sender_group = connections.get(from_id).and_then(|conn| conn.group.clone());

    // Collect senders first; map references must not be held across await.
    let targets: Vec<mpsc::Sender<RelayEvent>> = connections
        .iter()
        .filter(|entry| entry.key() != from_id)
        .filter(|entry| entry.value().role == audience)
        .filter(|entry| same_group(&sender_group, &entry.value().group))
        .map(|entry| entry.value().events.clone())
        .collect();

    for target in targets {
        let _ = target.send(RelayEvent::Broadcast(message.clone())).await;
    }
}

async fn reply(connections: &ConnectionTable, to_id: &str, event: RelayEvent) {
    let target = connections.get(to_id).map(|conn| conn.events.clone());
    if let Some(events) = target {
        let _ = events.send(event).await;
    }
}

fn compute_stats(connections: &ConnectionTable) -> BamStats {
    let mut stats = BamStats::default();
    for entry in connections.iter() {
        match entry.value().role {
            AgentRole::Job => stats.active_jobs += 1,
            AgentRole::Machine => stats.active_machines += 1,
        }
    }
    stats
}

/// Ungrouped connections hear every group; grouped ones only their own.
fn same_group(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
