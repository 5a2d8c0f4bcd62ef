//! A pretend machine for exercising the negotiation loop end to end.

use std::time::Duration;

use log::info;

use crate::agent::{MachineAgentHandle, MachineEvent, Readiness};
use crate::timer::Oneshot;

/// Default pretend print time.
const PRINT_DURATION: Duration = Duration::from_secs(5);

/// Accepts jobs and "prints" them for a fixed duration.
pub struct DummyMachine {
    print_duration: Duration,
}

impl DummyMachine {
    pub fn new() -> Self {
        Self {
            print_duration: PRINT_DURATION,
        }
    }

    pub fn with_print_duration(print_duration: Duration) -> Self {
        Self { print_duration }
    }

    /// Drive the agent until it disconnects.
    pub async fn run(&self, handle: &mut MachineAgentHandle) {
        let mut readiness = Readiness::Connected;
        let mut print_timer = Oneshot::disarmed();

        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(MachineEvent::ReadinessChanged(current)) => readiness = current,
                    Some(MachineEvent::JobAccepted { gcode, .. }) => {
                        if readiness == Readiness::Available {
                            info!("dummy machine printing {} bytes of gcode", gcode.len());
                            handle.set_readiness(Readiness::Printing).await;
                            print_timer.arm(self.print_duration);
                        }
                    }
                    Some(MachineEvent::Closed) | None => break,
                    Some(_) => {}
                },
                _ = print_timer.fired() => {
                    info!("dummy machine finished printing");
                    handle.set_readiness(Readiness::PrintComplete).await;
                },
            }
        }
    }
}

impl Default for DummyMachine {
    fn default() -> Self {
        Self::new()
    }
}
