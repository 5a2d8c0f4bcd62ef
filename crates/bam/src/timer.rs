//! Re-armable timers for agent select loops.
//!
//! [`Repeat`] drives periodic work (discovery rounds, stats polls);
//! [`Oneshot`] covers bounded waits (the offer-collection window, the job
//! connection timeout). Both are plain owned state: while disarmed their
//! futures never resolve, so a `tokio::select!` arm simply stays pending,
//! and because the owning agent polls them between its own state
//! transitions, a firing always observes current state — there is no
//! callback closure to capture a stale snapshot.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// A repeating timer that can be disarmed and re-armed with a new period.
#[derive(Debug, Default)]
pub struct Repeat {
    interval: Option<Interval>,
}

impl Repeat {
    pub fn disarmed() -> Self {
        Self { interval: None }
    }

    /// Arm with `period`. The first fire is one full period away, and
    /// re-arming replaces the old schedule from the next cycle on.
    pub fn arm(&mut self, period: Duration) {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Stop future fires; a tick already being handled is unaffected.
    pub fn disarm(&mut self) {
        self.interval = None;
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next period elapse; pending forever while disarmed.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

/// A cancellable one-shot timeout.
#[derive(Debug, Default)]
pub struct Oneshot {
    deadline: Option<Instant>,
}

impl Oneshot {
    pub fn disarmed() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) to fire once after `delay`.
    pub fn arm(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Cancel before it fires.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once at the armed deadline, disarming itself; pending
    /// forever while disarmed.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
