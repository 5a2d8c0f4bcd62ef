//! The two negotiation state machines.
//!
//! One agent instance is one single-task actor: commands come in over a
//! channel, notifications go out over a channel, and relay events plus
//! timers are folded into the same `select!` loop, so no two handlers for
//! one instance ever run concurrently.

mod job;
mod machine;

pub use job::{JobAgent, JobAgentHandle, JobConfig, JobEvent, JobState};
pub use machine::{
    MachineAgent, MachineAgentHandle, MachineConfig, MachineEvent, MachineTiming, Readiness,
};
