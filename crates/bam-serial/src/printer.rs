//! The acknowledgment-gated send loop and its reader task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::error::PrintError;
use crate::lines::LineAssembler;
use crate::response::Response;

/// Comment marker; comment lines never consume a flow-control slot.
const COMMENT_MARKER: char = ';';

/// Sentinel comment marking the logical end of a payload.
const END_OF_GCODE: &str = ";End of Gcode";

/// Asks the controller to identify itself.
const FIRMWARE_QUERY: &str = "M115";

/// Buffer size for the event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 16;

/// Fixed reset sequence transmitted after a cancellation, in order, under
/// the same one-line-at-a-time acknowledgment discipline as a print.
pub const RESET_SEQUENCE: [&str; 7] = [
    "M108 ; interrupts the printer to listen for gcode",
    "G91 ; use relative positioning",
    "M104 S0 ; Turn off extruder heater",
    "M140 S0 ; Turn off bed heater",
    "G1 X0 Y0 Z10 F1000 ; park print head",
    "M107 ; Turn off fan",
    "M84 ; disable motors",
];

/// Engine lifecycle, published through [`SerialPrinter::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    Idle,
    Streaming,
    Complete,
    Cancelling,
    Cancelled,
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Connection metadata reported upward; never used for control decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrinterEvent {
    FirmwareIdentified { firmware: String, device_id: String },
    LinkClosed,
}

/// How a print ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintOutcome {
    Complete,
    Cancelled,
}

/// Requests cancellation of the print in progress.
///
/// The latch is one-way: once fired it stays set until the engine has
/// pushed the full reset sequence through, which re-arms a fresh latch.
/// Obtain a new handle for each print.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// State shared between the send loop and the reader task.
struct Shared {
    /// Flow-control gate: true when the device may be sent another line.
    ok: AtomicBool,
    /// Wakes the send loop when the gate opens or the link drops.
    ack: Notify,
    link_up: AtomicBool,
}

enum Gate {
    Open,
    Cancelled,
    LinkLost,
}

/// Streams G-code to a serial-connected controller, one acknowledged line
/// at a time.
pub struct SerialPrinter {
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    state_tx: watch::Sender<PrinterState>,
    event_tx: broadcast::Sender<PrinterEvent>,
    reader: tokio::task::JoinHandle<()>,
}

impl SerialPrinter {
    /// Take over an open duplex to the device and ask it to identify
    /// itself. Opening the port (baud rate and friends) is the caller's
    /// concern.
    pub async fn open<S>(stream: S) -> Result<Self, PrintError>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            ok: AtomicBool::new(true),
            ack: Notify::new(),
            link_up: AtomicBool::new(true),
        });
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (state_tx, _) = watch::channel(PrinterState::Idle);

        let reader = tokio::spawn(reader_task(
            read_half,
            Arc::clone(&shared),
            event_tx.clone(),
        ));

        let mut printer = Self {
            writer: Box::new(write_half),
            shared,
            cancel: CancellationToken::new(),
            state_tx,
            event_tx,
            reader,
        };
        printer.write_line(FIRMWARE_QUERY).await?;
        Ok(printer)
    }

    /// Subscribe to connection metadata events.
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the engine lifecycle.
    pub fn state(&self) -> watch::Receiver<PrinterState> {
        self.state_tx.subscribe()
    }

    /// Handle for cancelling the current/next print.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stream one payload. Comment lines are skipped, the end-of-gcode
    /// sentinel completes early, and a fired cancel latch diverts into the
    /// reset sequence. The device closing the stream mid-print is an
    /// error, never a silent completion.
    pub async fn print(&mut self, gcode: &str) -> Result<PrintOutcome, PrintError> {
        info!("starting print ({} bytes)", gcode.len());
        self.set_state(PrinterState::Streaming);

        let mut cancelled = false;
        for line in gcode.split('\n') {
            if line == END_OF_GCODE {
                break;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if line.starts_with(COMMENT_MARKER) {
                continue;
            }

            match self.await_gate(true).await {
                Gate::Open => {}
                Gate::Cancelled => {
                    cancelled = true;
                    break;
                }
                Gate::LinkLost => {
                    self.set_state(PrinterState::Idle);
                    return Err(PrintError::StreamInterrupted);
                }
            }

            if let Err(err) = self.transmit(line).await {
                self.set_state(PrinterState::Idle);
                return Err(err);
            }
        }

        if cancelled {
            return self.run_reset_sequence().await;
        }

        info!("print complete");
        self.set_state(PrinterState::Complete);
        Ok(PrintOutcome::Complete)
    }

    /// Abandon the payload and walk the device back to a safe state.
    async fn run_reset_sequence(&mut self) -> Result<PrintOutcome, PrintError> {
        warn!("print cancelled, resetting printer");
        self.set_state(PrinterState::Cancelling);

        // The device may still owe an ok for an abandoned line; force the
        // gate open so the interrupt goes out immediately.
        self.shared.ok.store(true, Ordering::Release);

        for line in RESET_SEQUENCE {
            if let Gate::LinkLost = self.await_gate(false).await {
                self.set_state(PrinterState::Idle);
                return Err(PrintError::StreamInterrupted);
            }
            if let Err(err) = self.transmit(line).await {
                self.set_state(PrinterState::Idle);
                return Err(err);
            }
        }

        // The latch served its round; a fresh one arms the next print.
        self.cancel = CancellationToken::new();
        self.set_state(PrinterState::Cancelled);
        Ok(PrintOutcome::Cancelled)
    }

    /// Wait until the device may be sent another line.
    async fn await_gate(&self, cancellable: bool) -> Gate {
        loop {
            if !self.shared.link_up.load(Ordering::Acquire) {
                return Gate::LinkLost;
            }
            if self.shared.ok.load(Ordering::Acquire) {
                return Gate::Open;
            }
            if cancellable {
                tokio::select! {
                    _ = self.shared.ack.notified() => {}
                    _ = self.cancel.cancelled() => return Gate::Cancelled,
                }
            } else {
                self.shared.ack.notified().await;
            }
        }
    }

    /// Close the gate, then hand the line to the sink. Closing first means
    /// an acknowledgment arriving mid-write cannot be lost.
    async fn transmit(&mut self, line: &str) -> Result<(), PrintError> {
        debug!("sending: {line}");
        self.shared.ok.store(false, Ordering::Release);
        self.write_line(line).await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), PrintError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn set_state(&self, state: PrinterState) {
        self.state_tx.send_replace(state);
    }
}

impl Drop for SerialPrinter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn reader_task<R>(
    mut reader: R,
    shared: Arc<Shared>,
    event_tx: broadcast::Sender<PrinterEvent>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 512];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                for line in assembler.push(&chunk) {
                    dispatch_response(&line, &shared, &event_tx);
                }
            }
            Err(err) => {
                warn!("serial read failed: {err}");
                break;
            }
        }
    }

    debug!("serial reader finished");
    shared.link_up.store(false, Ordering::Release);
    shared.ack.notify_one();
    let _ = event_tx.send(PrinterEvent::LinkClosed);
}

fn dispatch_response(line: &str, shared: &Shared, event_tx: &broadcast::Sender<PrinterEvent>) {
    let response = Response::parse(line);

    if response.is_unrecognized() {
        debug!("unrecognized response: {line}");
        return;
    }

    if response.acknowledged {
        shared.ok.store(true, Ordering::Release);
        shared.ack.notify_one();
    }

    if let Some(firmware) = response.firmware {
        info!("firmware identified: {}", firmware.firmware);
        let _ = event_tx.send(PrinterEvent::FirmwareIdentified {
            firmware: firmware.firmware,
            device_id: firmware.device_id,
        });
    }
}
