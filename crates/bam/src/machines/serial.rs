//! Serial-connected printer driver (direct-streaming machine family).

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use bam_serial::{PrintOutcome, PrinterEvent, SerialPrinter};

use crate::agent::{MachineAgentHandle, MachineEvent, Readiness};

/// Streams accepted payloads straight to a Marlin-style controller.
///
/// The serial port itself is opened by the embedder (baud rate and all)
/// and handed in as a byte duplex; anything `AsyncRead + AsyncWrite`
/// works, which is also how the tests substitute an in-memory device.
pub struct SerialMachine {
    printer: SerialPrinter,
}

impl SerialMachine {
    /// Take over an open duplex to the printer.
    pub async fn connect<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let printer = SerialPrinter::open(stream)
            .await
            .context("opening printer link")?;
        Ok(Self { printer })
    }

    /// Drive the agent until it disconnects. Accepted payloads stream to
    /// the controller; a unit on `cancel_requests` aborts the active
    /// print through the reset sequence.
    pub async fn run(
        mut self,
        handle: &mut MachineAgentHandle,
        mut cancel_requests: mpsc::Receiver<()>,
    ) -> Result<()> {
        // Firmware identity is metadata for the operator, not control.
        let mut printer_events = self.printer.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = printer_events.recv().await {
                match event {
                    PrinterEvent::FirmwareIdentified {
                        firmware,
                        device_id,
                    } => {
                        info!("printer firmware: {firmware} (uuid {device_id})");
                    }
                    PrinterEvent::LinkClosed => break,
                }
            }
        });

        let mut readiness = Readiness::Connected;

        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(MachineEvent::ReadinessChanged(current)) => readiness = current,
                    Some(MachineEvent::JobAccepted { gcode, .. }) => {
                        if readiness == Readiness::Available {
                            self.print_job(handle, &gcode, &mut cancel_requests).await?;
                        }
                    }
                    Some(MachineEvent::Closed) | None => break,
                    Some(_) => {}
                },
                Some(()) = cancel_requests.recv() => {
                    // No print in flight; nothing to cancel.
                },
            }
        }

        Ok(())
    }

    async fn print_job(
        &mut self,
        handle: &mut MachineAgentHandle,
        gcode: &str,
        cancel_requests: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        handle.set_readiness(Readiness::Printing).await;

        let cancel = self.printer.cancel_handle();
        let print = self.printer.print(gcode);
        tokio::pin!(print);

        let outcome = loop {
            tokio::select! {
                outcome = &mut print => break outcome,
                Some(()) = cancel_requests.recv() => {
                    info!("cancelling print");
                    cancel.cancel();
                },
                // Keep draining agent events so the channel never backs up
                // under a long print.
                event = handle.next_event() => {
                    if matches!(event, Some(MachineEvent::Closed) | None) {
                        warn!("relay connection ended mid-print");
                    }
                },
            }
        };

        match outcome {
            Ok(PrintOutcome::Complete) => {
                info!("print complete");
                handle.set_readiness(Readiness::PrintComplete).await;
                Ok(())
            }
            Ok(PrintOutcome::Cancelled) => {
                warn!("print cancelled, machine held back from new work");
                handle.set_readiness(Readiness::Unavailable).await;
                Ok(())
            }
            Err(err) => {
                handle.set_readiness(Readiness::Unavailable).await;
                Err(err).context("print interrupted")
            }
        }
    }
}
