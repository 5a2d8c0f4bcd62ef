//! The machine-side state machine.
//!
//! Connect, poll stats, and — while the driver marks the machine
//! available — run discovery rounds: broadcast, collect offers for a
//! fixed window, choose the oldest one, and hand the accepted payload to
//! the driver.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use bam_protocol::{AgentRole, BamStats, Message, Payload};

use crate::relay::{ConnectOptions, RelayConnection, RelayError, RelayEvent, RelayTransport};
use crate::timer::{Oneshot, Repeat};

const EVENT_BUFFER_SIZE: usize = 32;
const COMMAND_BUFFER_SIZE: usize = 8;

/// Round timing. The collection window must stay strictly shorter than
/// the discovery period so rounds never overlap.
#[derive(Debug, Clone)]
pub struct MachineTiming {
    pub discovery_period: Duration,
    pub collection_window: Duration,
    pub stats_period: Duration,
}

impl Default for MachineTiming {
    fn default() -> Self {
        Self {
            discovery_period: Duration::from_millis(4000),
            collection_window: Duration::from_millis(2000),
            stats_period: Duration::from_millis(1000),
        }
    }
}

/// Connection parameters for one machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub access_key: String,
    pub group_key: Option<String>,
    pub timing: MachineTiming,
}

/// Machine readiness, owned by the driver through
/// [`MachineAgentHandle::set_readiness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Disconnected,
    Connected,
    Available,
    Unavailable,
    Printing,
    PrintComplete,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Available => write!(f, "available"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Printing => write!(f, "printing"),
            Self::PrintComplete => write!(f, "print-complete"),
        }
    }
}

/// Notifications to the embedding driver/UI.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    /// The relay accepted the connection.
    Connected { id: String },
    ReadinessChanged(Readiness),
    /// Latest activity snapshot from the relay.
    Stats(BamStats),
    /// A job accepted this machine's offer. The payload is handed off
    /// here; moving readiness to printing is the driver's call.
    JobAccepted { job_id: String, gcode: String },
    /// The relay connection ended.
    Closed,
}

#[derive(Debug)]
enum MachineCommand {
    SetReadiness(Readiness),
    Disconnect,
}

/// Connects machine agents to a relay.
pub struct MachineAgent;

impl MachineAgent {
    /// Connect as a machine and run the agent. A relay refusal surfaces
    /// to the caller, which may offer connecting again; there is no
    /// automatic retry.
    pub async fn connect<T>(
        transport: &T,
        config: MachineConfig,
    ) -> Result<MachineAgentHandle, RelayError>
    where
        T: RelayTransport + ?Sized,
    {
        let connection = transport
            .connect(ConnectOptions {
                access_key: config.access_key.clone(),
                group_key: config.group_key.clone(),
                role: AgentRole::Machine,
            })
            .await?;

        info!("machine agent connected as {}", connection.id);

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let id = connection.id.clone();

        let actor = MachineActor {
            connection,
            timing: config.timing,
            readiness: Readiness::Connected,
            offers: VecDeque::new(),
            events: event_tx,
            commands: command_rx,
            stats_timer: Repeat::disarmed(),
            discovery: Repeat::disarmed(),
            collection: Oneshot::disarmed(),
        };
        tokio::spawn(actor.run());

        Ok(MachineAgentHandle {
            id,
            events: event_rx,
            commands: command_tx,
        })
    }
}

/// Command/notification surface of a running machine agent.
pub struct MachineAgentHandle {
    id: String,
    events: mpsc::Receiver<MachineEvent>,
    commands: mpsc::Sender<MachineCommand>,
}

impl MachineAgentHandle {
    /// The relay-assigned connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification; `None` once the agent is gone.
    pub async fn next_event(&mut self) -> Option<MachineEvent> {
        self.events.recv().await
    }

    pub async fn set_readiness(&self, readiness: Readiness) {
        let _ = self
            .commands
            .send(MachineCommand::SetReadiness(readiness))
            .await;
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(MachineCommand::Disconnect).await;
    }
}

struct MachineActor {
    connection: RelayConnection,
    timing: MachineTiming,
    readiness: Readiness,
    /// Offers collected this round, oldest first. Owned exclusively here;
    /// cleared on every selection outcome and on disconnect.
    offers: VecDeque<Message>,
    events: mpsc::Sender<MachineEvent>,
    commands: mpsc::Receiver<MachineCommand>,
    stats_timer: Repeat,
    discovery: Repeat,
    collection: Oneshot,
}

impl MachineActor {
    async fn run(mut self) {
        self.stats_timer.arm(self.timing.stats_period);
        self.emit(MachineEvent::Connected {
            id: self.connection.id.clone(),
        })
        .await;
        self.set_readiness(Readiness::Connected).await;

        loop {
            tokio::select! {
                event = self.connection.events.recv() => match event {
                    Some(RelayEvent::Direct(msg)) => self.on_direct(msg).await,
                    Some(RelayEvent::Broadcast(msg)) => {
                        debug!("machine agent ignoring broadcast {}", msg.payload.subject());
                    }
                    Some(RelayEvent::Stats(stats)) => {
                        self.emit(MachineEvent::Stats(stats)).await;
                    }
                    Some(RelayEvent::Error(reason)) => {
                        warn!("machine agent {}: relay error: {reason}", self.connection.id);
                    }
                    Some(RelayEvent::Closed) | None => {
                        self.emit(MachineEvent::Closed).await;
                        break;
                    }
                },
                _ = self.stats_timer.tick() => {
                    let _ = self.connection.sender.request_stats().await;
                },
                _ = self.discovery.tick() => self.discovery_tick().await,
                _ = self.collection.fired() => self.select_job().await,
                command = self.commands.recv() => match command {
                    Some(MachineCommand::SetReadiness(readiness)) => {
                        self.set_readiness(readiness).await;
                    }
                    Some(MachineCommand::Disconnect) | None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        debug!("machine agent {} finished", self.connection.id);
    }

    /// Readiness is driver-owned; the agent reacts by arming or
    /// disarming the discovery round.
    async fn set_readiness(&mut self, readiness: Readiness) {
        if readiness == Readiness::Available {
            if !self.discovery.is_armed() {
                self.discovery.arm(self.timing.discovery_period);
            }
        } else {
            self.discovery.disarm();
            self.collection.disarm();
        }

        self.readiness = readiness;
        self.emit(MachineEvent::ReadinessChanged(readiness)).await;
    }

    /// Open a discovery round: broadcast, then let replies accumulate for
    /// the collection window before picking one.
    async fn discovery_tick(&mut self) {
        if self.readiness != Readiness::Available {
            return;
        }

        info!("machine {} looking for jobs", self.connection.id);
        let msg = Message::broadcast(
            self.connection.id.clone(),
            Payload::MachineIsLookingForJobs {},
        );
        let _ = self.connection.sender.all_jobs(msg).await;
        self.collection.arm(self.timing.collection_window);
    }

    /// First come, first served: the oldest offer on the list wins. An
    /// empty round is not an error — discovery retries next period.
    async fn select_job(&mut self) {
        let Some(offer) = self.offers.pop_front() else {
            debug!("no offers this round");
            return;
        };

        info!("choosing job {}", offer.from_id);
        let msg = Message::direct(
            self.connection.id.clone(),
            offer.from_id,
            Payload::MachineHasChosenAJob {},
        );
        let _ = self.connection.sender.direct(msg).await;
    }

    async fn on_direct(&mut self, msg: Message) {
        match msg.payload {
            // Offers queue in arrival order; senders are not deduplicated.
            Payload::JobIsAvailable { .. } => {
                debug!("offer from job {}", msg.from_id);
                self.offers.push_back(msg);
            }
            Payload::JobHasAcceptedMachinesOffer { gcode } => {
                info!("job {} accepted, handing payload to the machine", msg.from_id);
                self.offers.clear();
                self.discovery.disarm();
                self.collection.disarm();
                self.emit(MachineEvent::JobAccepted {
                    job_id: msg.from_id,
                    gcode,
                })
                .await;
            }
            Payload::JobHasDeclinedMachinesOffer {} => {
                debug!("job {} declined; discovery stays armed", msg.from_id);
                self.offers.clear();
            }
            other => {
                debug!("machine agent ignoring direct {}", other.subject());
            }
        }
    }

    async fn shutdown(&mut self) {
        self.offers.clear();
        self.stats_timer.disarm();
        // The cached snapshot upstream goes back to zero with us.
        self.emit(MachineEvent::Stats(BamStats::default())).await;
        self.set_readiness(Readiness::Disconnected).await;
        self.emit(MachineEvent::Closed).await;
    }

    async fn emit(&self, event: MachineEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySender;
    use bam_protocol::Frame;
    use tokio::time;

    fn fast_timing() -> MachineTiming {
        MachineTiming {
            discovery_period: Duration::from_millis(40),
            collection_window: Duration::from_millis(15),
            // Keep stats traffic out of the outbound assertions.
            stats_period: Duration::from_secs(3600),
        }
    }

    fn spawn_actor() -> (
        mpsc::Sender<RelayEvent>,
        mpsc::Receiver<Frame>,
        mpsc::Receiver<MachineEvent>,
        mpsc::Sender<MachineCommand>,
    ) {
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);

        let actor = MachineActor {
            connection: RelayConnection {
                id: "m1".to_string(),
                sender: RelaySender::new(outbound_tx),
                events: relay_rx,
            },
            timing: fast_timing(),
            readiness: Readiness::Connected,
            offers: VecDeque::new(),
            events: event_tx,
            commands: command_rx,
            stats_timer: Repeat::disarmed(),
            discovery: Repeat::disarmed(),
            collection: Oneshot::disarmed(),
        };
        tokio::spawn(actor.run());

        (relay_tx, outbound_rx, event_rx, command_tx)
    }

    fn offer_from(job_id: &str) -> RelayEvent {
        RelayEvent::Direct(Message::direct(
            job_id,
            "m1",
            Payload::JobIsAvailable { details: None },
        ))
    }

    async fn next_frame(outbound: &mut mpsc::Receiver<Frame>) -> Frame {
        match time::timeout(Duration::from_secs(1), outbound.recv()).await {
            Ok(Some(frame)) => frame,
            other => panic!("expected an outbound frame, got {other:?}"),
        }
    }

    async fn expect_discovery(outbound: &mut mpsc::Receiver<Frame>) {
        match next_frame(outbound).await {
            Frame::AllJobs { message } => {
                assert!(matches!(
                    message.payload,
                    Payload::MachineIsLookingForJobs {}
                ));
            }
            other => panic!("expected a discovery broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_picks_the_earliest_offer() {
        let (relay_tx, mut outbound, _events, commands) = spawn_actor();
        commands
            .send(MachineCommand::SetReadiness(Readiness::Available))
            .await
            .unwrap();

        expect_discovery(&mut outbound).await;

        relay_tx.send(offer_from("job-a")).await.unwrap();
        relay_tx.send(offer_from("job-b")).await.unwrap();

        match next_frame(&mut outbound).await {
            Frame::Direct { message } => {
                assert_eq!(message.to_id, "job-a");
                assert!(matches!(message.payload, Payload::MachineHasChosenAJob {}));
            }
            other => panic!("expected the chosen-job message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acceptance_hands_off_and_stops_discovery() {
        let (relay_tx, mut outbound, mut events, commands) = spawn_actor();
        commands
            .send(MachineCommand::SetReadiness(Readiness::Available))
            .await
            .unwrap();

        expect_discovery(&mut outbound).await;
        relay_tx.send(offer_from("job-a")).await.unwrap();
        let _ = next_frame(&mut outbound).await;

        relay_tx
            .send(RelayEvent::Direct(Message::direct(
                "job-a",
                "m1",
                Payload::JobHasAcceptedMachinesOffer {
                    gcode: "G28".to_string(),
                },
            )))
            .await
            .unwrap();

        loop {
            match time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(MachineEvent::JobAccepted { job_id, gcode })) => {
                    assert_eq!(job_id, "job-a");
                    assert_eq!(gcode, "G28");
                    break;
                }
                Ok(Some(_)) => continue,
                other => panic!("expected the payload handoff, got {other:?}"),
            }
        }

        // Discovery is disarmed until the driver flips readiness again.
        let quiet = time::timeout(Duration::from_millis(120), outbound.recv()).await;
        assert!(quiet.is_err(), "no discovery may follow an acceptance");
    }

    #[tokio::test]
    async fn test_decline_clears_offers_and_retries() {
        let (relay_tx, mut outbound, _events, commands) = spawn_actor();
        commands
            .send(MachineCommand::SetReadiness(Readiness::Available))
            .await
            .unwrap();

        expect_discovery(&mut outbound).await;
        relay_tx.send(offer_from("job-a")).await.unwrap();
        let _ = next_frame(&mut outbound).await;

        relay_tx
            .send(RelayEvent::Direct(Message::direct(
                "job-a",
                "m1",
                Payload::JobHasDeclinedMachinesOffer {},
            )))
            .await
            .unwrap();

        // The next round runs and picks a fresh offer.
        expect_discovery(&mut outbound).await;
        relay_tx.send(offer_from("job-b")).await.unwrap();
        match next_frame(&mut outbound).await {
            Frame::Direct { message } => assert_eq!(message.to_id, "job-b"),
            other => panic!("expected the chosen-job message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_round_just_retries() {
        let (_relay_tx, mut outbound, _events, commands) = spawn_actor();
        commands
            .send(MachineCommand::SetReadiness(Readiness::Available))
            .await
            .unwrap();

        // Two consecutive broadcasts with no offers in between: the empty
        // collection window selects nothing and the round repeats.
        expect_discovery(&mut outbound).await;
        expect_discovery(&mut outbound).await;
    }

    #[tokio::test]
    async fn test_leaving_available_disarms_discovery() {
        let (_relay_tx, mut outbound, _events, commands) = spawn_actor();
        commands
            .send(MachineCommand::SetReadiness(Readiness::Available))
            .await
            .unwrap();
        expect_discovery(&mut outbound).await;

        commands
            .send(MachineCommand::SetReadiness(Readiness::Unavailable))
            .await
            .unwrap();

        let quiet = time::timeout(Duration::from_millis(120), outbound.recv()).await;
        assert!(quiet.is_err(), "an unavailable machine must not broadcast");
    }
}
