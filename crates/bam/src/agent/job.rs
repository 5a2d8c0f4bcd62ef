//! The job-side state machine.
//!
//! One submitter's lifecycle: connect, answer discovery broadcasts while
//! available, hand the payload to the first machine that picks it, or
//! give up when the availability window expires.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use bam_protocol::{AgentRole, JobDetails, Message, Payload};

use crate::relay::{ConnectOptions, RelayConnection, RelayError, RelayEvent, RelayTransport};
use crate::timer::Oneshot;

const EVENT_BUFFER_SIZE: usize = 32;
const COMMAND_BUFFER_SIZE: usize = 8;

/// Connection parameters for one job submission.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub access_key: String,
    pub group_key: Option<String>,
    /// How long to stay available before giving up.
    pub timeout: Duration,
    pub details: Option<JobDetails>,
}

/// Job lifecycle states. A job never reverts from selected within one
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotOnline,
    Available,
    Selected,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOnline => write!(f, "not-online"),
            Self::Available => write!(f, "available"),
            Self::Selected => write!(f, "selected"),
        }
    }
}

/// Notifications to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    StateChanged(JobState),
    /// A machine chose this job and the payload went out.
    Selected { machine_id: String },
    /// The availability window expired before any machine chose the job.
    TimedOut,
    /// The relay connection ended.
    Closed,
}

#[derive(Debug)]
enum JobCommand {
    Disconnect,
}

/// Connects job agents to a relay.
pub struct JobAgent;

impl JobAgent {
    /// Connect as a job and run the agent. A relay refusal propagates
    /// as-is; retrying is the caller's decision.
    pub async fn connect<T>(
        transport: &T,
        config: JobConfig,
        gcode: String,
    ) -> Result<JobAgentHandle, RelayError>
    where
        T: RelayTransport + ?Sized,
    {
        let connection = transport
            .connect(ConnectOptions {
                access_key: config.access_key.clone(),
                group_key: config.group_key.clone(),
                role: AgentRole::Job,
            })
            .await?;

        info!("job agent connected as {}", connection.id);

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let id = connection.id.clone();

        let actor = JobActor {
            connection,
            config,
            gcode,
            state: JobState::Available,
            events: event_tx,
            commands: command_rx,
            timeout: Oneshot::disarmed(),
        };
        tokio::spawn(actor.run());

        Ok(JobAgentHandle {
            id,
            events: event_rx,
            commands: command_tx,
        })
    }
}

/// Command/notification surface of a running job agent.
#[derive(Debug)]
pub struct JobAgentHandle {
    id: String,
    events: mpsc::Receiver<JobEvent>,
    commands: mpsc::Sender<JobCommand>,
}

impl JobAgentHandle {
    /// The relay-assigned connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification; `None` once the agent is gone.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(JobCommand::Disconnect).await;
    }
}

struct JobActor {
    connection: RelayConnection,
    config: JobConfig,
    gcode: String,
    state: JobState,
    events: mpsc::Sender<JobEvent>,
    commands: mpsc::Receiver<JobCommand>,
    timeout: Oneshot,
}

impl JobActor {
    async fn run(mut self) {
        self.timeout.arm(self.config.timeout);
        self.emit(JobEvent::StateChanged(self.state)).await;

        loop {
            tokio::select! {
                event = self.connection.events.recv() => match event {
                    Some(RelayEvent::Broadcast(msg)) => self.on_broadcast(msg).await,
                    Some(RelayEvent::Direct(msg)) => self.on_direct(msg).await,
                    Some(RelayEvent::Stats(_)) => {}
                    Some(RelayEvent::Error(reason)) => {
                        warn!("job agent {}: relay error: {reason}", self.connection.id);
                    }
                    Some(RelayEvent::Closed) | None => {
                        self.emit(JobEvent::Closed).await;
                        break;
                    }
                },
                _ = self.timeout.fired() => {
                    // Only an agent still waiting can time out; reaching
                    // selected disarms the timer first, so this never
                    // races a successful handoff.
                    if self.state == JobState::Available {
                        warn!("job agent {} timed out waiting to be chosen", self.connection.id);
                        self.set_state(JobState::NotOnline).await;
                        self.emit(JobEvent::TimedOut).await;
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(JobCommand::Disconnect) | None => {
                        self.emit(JobEvent::Closed).await;
                        break;
                    }
                },
            }
        }

        debug!("job agent {} finished", self.connection.id);
    }

    /// Every discovery broadcast gets one offer while the job is
    /// available; replying repeatedly is safe, so no round bookkeeping.
    async fn on_broadcast(&mut self, msg: Message) {
        if !matches!(msg.payload, Payload::MachineIsLookingForJobs {}) {
            return;
        }
        if self.state != JobState::Available {
            return;
        }

        debug!("offering job to machine {}", msg.from_id);
        let reply = Message::direct(
            self.connection.id.clone(),
            msg.from_id,
            Payload::JobIsAvailable {
                details: self.config.details.clone(),
            },
        );
        let _ = self.connection.sender.direct(reply).await;
    }

    /// A job honors only its first acceptance; later offers are declined.
    async fn on_direct(&mut self, msg: Message) {
        if !matches!(msg.payload, Payload::MachineHasChosenAJob {}) {
            debug!("job agent ignoring direct {}", msg.payload.subject());
            return;
        }

        if self.state == JobState::Available {
            info!("chosen by machine {}, sending payload", msg.from_id);
            self.set_state(JobState::Selected).await;
            self.timeout.disarm();

            let reply = Message::direct(
                self.connection.id.clone(),
                msg.from_id.clone(),
                Payload::JobHasAcceptedMachinesOffer {
                    gcode: self.gcode.clone(),
                },
            );
            let _ = self.connection.sender.direct(reply).await;
            self.emit(JobEvent::Selected {
                machine_id: msg.from_id,
            })
            .await;
        } else {
            debug!("declining machine {}, job already taken", msg.from_id);
            let reply = Message::direct(
                self.connection.id.clone(),
                msg.from_id,
                Payload::JobHasDeclinedMachinesOffer {},
            );
            let _ = self.connection.sender.direct(reply).await;
        }
    }

    async fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.emit(JobEvent::StateChanged(state)).await;
    }

    async fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySender;
    use bam_protocol::Frame;
    use tokio::time;

    fn spawn_actor(
        timeout: Duration,
    ) -> (
        mpsc::Sender<RelayEvent>,
        mpsc::Receiver<Frame>,
        mpsc::Receiver<JobEvent>,
        mpsc::Sender<JobCommand>,
    ) {
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);

        let actor = JobActor {
            connection: RelayConnection {
                id: "job-1".to_string(),
                sender: RelaySender::new(outbound_tx),
                events: relay_rx,
            },
            config: JobConfig {
                access_key: "socket-key".to_string(),
                group_key: None,
                timeout,
                details: None,
            },
            gcode: "G28\nG1 X10".to_string(),
            state: JobState::Available,
            events: event_tx,
            commands: command_rx,
            timeout: Oneshot::disarmed(),
        };
        tokio::spawn(actor.run());

        (relay_tx, outbound_rx, event_rx, command_tx)
    }

    async fn next_direct(outbound: &mut mpsc::Receiver<Frame>) -> Message {
        match time::timeout(Duration::from_secs(1), outbound.recv()).await {
            Ok(Some(Frame::Direct { message })) => message,
            other => panic!("expected a direct frame, got {other:?}"),
        }
    }

    fn chosen_by(machine_id: &str) -> RelayEvent {
        RelayEvent::Direct(Message::direct(
            machine_id,
            "job-1",
            Payload::MachineHasChosenAJob {},
        ))
    }

    #[tokio::test]
    async fn test_offers_itself_on_discovery() {
        let (relay_tx, mut outbound, mut events, _commands) =
            spawn_actor(Duration::from_secs(5));
        assert_eq!(
            events.recv().await,
            Some(JobEvent::StateChanged(JobState::Available))
        );

        relay_tx
            .send(RelayEvent::Broadcast(Message::broadcast(
                "m1",
                Payload::MachineIsLookingForJobs {},
            )))
            .await
            .unwrap();

        let reply = next_direct(&mut outbound).await;
        assert_eq!(reply.to_id, "m1");
        assert_eq!(reply.from_id, "job-1");
        assert!(matches!(reply.payload, Payload::JobIsAvailable { .. }));
    }

    #[tokio::test]
    async fn test_accepts_first_offer_and_declines_the_rest() {
        let (relay_tx, mut outbound, mut events, _commands) =
            spawn_actor(Duration::from_secs(5));

        relay_tx.send(chosen_by("m1")).await.unwrap();
        let reply = next_direct(&mut outbound).await;
        assert_eq!(reply.to_id, "m1");
        match reply.payload {
            Payload::JobHasAcceptedMachinesOffer { gcode } => {
                assert_eq!(gcode, "G28\nG1 X10");
            }
            other => panic!("expected acceptance, got {other:?}"),
        }

        // A second machine choosing the same job always gets a decline,
        // never silence or a second acceptance.
        relay_tx.send(chosen_by("m2")).await.unwrap();
        let reply = next_direct(&mut outbound).await;
        assert_eq!(reply.to_id, "m2");
        assert!(matches!(
            reply.payload,
            Payload::JobHasDeclinedMachinesOffer {}
        ));

        let mut selected = 0;
        while let Ok(Some(event)) = time::timeout(Duration::from_millis(50), events.recv()).await
        {
            if matches!(event, JobEvent::Selected { .. }) {
                selected += 1;
            }
        }
        assert_eq!(selected, 1);
    }

    #[tokio::test]
    async fn test_no_offers_after_selection() {
        let (relay_tx, mut outbound, _events, _commands) = spawn_actor(Duration::from_secs(5));

        relay_tx.send(chosen_by("m1")).await.unwrap();
        let _ = next_direct(&mut outbound).await;

        relay_tx
            .send(RelayEvent::Broadcast(Message::broadcast(
                "m2",
                Payload::MachineIsLookingForJobs {},
            )))
            .await
            .unwrap();

        let quiet = time::timeout(Duration::from_millis(50), outbound.recv()).await;
        assert!(quiet.is_err(), "a selected job must not offer itself again");
    }

    #[tokio::test]
    async fn test_times_out_when_not_chosen() {
        let (_relay_tx, _outbound, mut events, _commands) =
            spawn_actor(Duration::from_millis(30));

        assert_eq!(
            events.recv().await,
            Some(JobEvent::StateChanged(JobState::Available))
        );
        assert_eq!(
            events.recv().await,
            Some(JobEvent::StateChanged(JobState::NotOnline))
        );
        assert_eq!(events.recv().await, Some(JobEvent::TimedOut));
        // The actor closes its connection and ends.
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_selection_cancels_timeout() {
        let (relay_tx, mut outbound, mut events, _commands) =
            spawn_actor(Duration::from_millis(80));

        relay_tx.send(chosen_by("m1")).await.unwrap();
        let _ = next_direct(&mut outbound).await;

        // Wait well past the original deadline: no timeout transition may
        // ever fire once the job is selected.
        time::sleep(Duration::from_millis(150)).await;
        loop {
            match time::timeout(Duration::from_millis(50), events.recv()).await {
                Ok(Some(JobEvent::TimedOut)) => panic!("timeout fired after selection"),
                Ok(Some(JobEvent::StateChanged(JobState::NotOnline))) => {
                    panic!("job reverted after selection");
                }
                Ok(Some(_)) => continue,
                Ok(None) => panic!("actor ended unexpectedly"),
                Err(_) => break,
            }
        }
    }
}
