//! Acknowledgment-gated G-code streaming for serial-connected printers.
//!
//! The engine drives one open byte duplex to a Marlin-style controller:
//! commands go out one at a time, each gated on the previous `ok`
//! acknowledgment; responses come back as an arbitrary byte stream that is
//! reassembled into lines before dispatch. Opening the underlying serial
//! port (with a baud rate) is the embedder's job — anything implementing
//! `AsyncRead + AsyncWrite` can be streamed to, which is also how the
//! tests substitute an in-memory device.

mod error;
mod lines;
mod printer;
mod response;

pub use error::PrintError;
pub use lines::LineAssembler;
pub use printer::{
    CancelHandle, PrintOutcome, PrinterEvent, PrinterState, SerialPrinter, RESET_SEQUENCE,
};
pub use response::{FirmwareInfo, Response};
