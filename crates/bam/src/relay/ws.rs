//! WebSocket transport to a remote relay.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use bam_protocol::Frame;

use super::transport::{
    ConnectOptions, EVENT_BUFFER_SIZE, OUTBOUND_BUFFER_SIZE, RelayConnection, RelayError,
    RelayEvent, RelaySender, RelayTransport,
};

/// Connects to a relay over WebSocket.
///
/// Credentials and role travel as handshake headers; after the upgrade the
/// relay speaks first with a `connect` frame carrying the assigned
/// connection identifier, or a `connect-error` refusal.
pub struct WsRelay {
    url: String,
}

impl WsRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RelayTransport for WsRelay {
    async fn connect(&self, options: ConnectOptions) -> Result<RelayConnection, RelayError> {
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|err| RelayError::Unreachable(err.to_string()))?;
        {
            let headers = request.headers_mut();
            headers.insert(
                "x-access-key",
                options
                    .access_key
                    .parse()
                    .map_err(|_| RelayError::Rejected("access key is not header-safe".into()))?,
            );
            headers.insert(
                "agent-type",
                options
                    .role
                    .as_str()
                    .parse()
                    .map_err(|_| RelayError::Unreachable("invalid role header".into()))?,
            );
            if let Some(group) = &options.group_key {
                headers.insert(
                    "group-key",
                    group
                        .parse()
                        .map_err(|_| RelayError::Rejected("group key is not header-safe".into()))?,
                );
            }
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| RelayError::Unreachable(err.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        // The relay speaks first: connect or connect-error.
        let id = loop {
            let Some(result) = stream.next().await else {
                return Err(RelayError::Closed);
            };
            match result {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(Frame::Connect { id }) => break id,
                    Ok(Frame::ConnectError { reason }) => return Err(RelayError::Rejected(reason)),
                    Ok(other) => {
                        return Err(RelayError::Unreachable(format!(
                            "unexpected handshake frame on channel {other:?}"
                        )));
                    }
                    Err(err) => {
                        return Err(RelayError::Unreachable(format!(
                            "unparseable handshake frame: {err}"
                        )));
                    }
                },
                Ok(WsMessage::Close(_)) => return Err(RelayError::Closed),
                Ok(_) => continue,
                Err(err) => return Err(RelayError::Unreachable(err.to_string())),
            }
        };

        debug!("relay assigned connection id {id}");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER_SIZE);

        // Writer task: drains outbound frames into the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("failed to serialize frame: {err}");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: maps inbound frames to relay events.
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<Frame>(text.as_str()) {
                            Ok(frame) => {
                                let Some(event) = event_for(frame) else {
                                    continue;
                                };
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!("unparseable relay frame: {err}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("relay socket error: {err}");
                        break;
                    }
                }
            }
            let _ = event_tx.send(RelayEvent::Closed).await;
        });

        Ok(RelayConnection {
            id,
            sender: RelaySender::new(outbound_tx),
            events: event_rx,
        })
    }
}

fn event_for(frame: Frame) -> Option<RelayEvent> {
    match frame {
        Frame::AllJobs { message } | Frame::AllMachines { message } => {
            Some(RelayEvent::Broadcast(message))
        }
        Frame::Direct { message } => Some(RelayEvent::Direct(message)),
        Frame::Stats { stats: Some(stats) } => Some(RelayEvent::Stats(stats)),
        Frame::MessageError { reason } => Some(RelayEvent::Error(reason)),
        // A second connect, a refusal after the handshake, or an empty
        // stats frame mean nothing to an established connection.
        Frame::Connect { .. } | Frame::ConnectError { .. } | Frame::Stats { stats: None } => None,
    }
}
