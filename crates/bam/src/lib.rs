//! Brokered additive manufacturing (BAM) core.
//!
//! Job submitters and machine operators find each other through a shared
//! message relay: machines broadcast discovery rounds, jobs offer
//! themselves, and the first offer collected wins the round. The accepted
//! G-code payload is handed to a machine driver — a vendor HTTP client or
//! the acknowledgment-gated serial streamer in `bam-serial`.

pub mod agent;
pub mod machines;
pub mod relay;
pub mod settings;
pub mod timer;

pub use bam_protocol as protocol;
