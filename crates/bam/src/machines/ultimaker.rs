//! Ultimaker vendor client and driver (networked machine family).
//!
//! The printer exposes an HTTP API: jobs are submitted whole rather than
//! streamed, and progress comes from polling.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::agent::{MachineAgentHandle, MachineEvent, Readiness};
use crate::timer::Repeat;

/// How often the printer is polled for status.
const STATUS_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Job name used for submitted payloads.
const JOB_NAME: &str = "bam-print";

/// The job the printer is currently running.
#[derive(Debug, Clone, Deserialize)]
pub struct UltimakerJob {
    pub name: String,
    #[serde(rename = "datetime_started")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "progress")]
    pub progress_percent: f64,
}

/// Thin client for the Ultimaker printer API.
pub struct UltimakerClient {
    http: reqwest::Client,
    base_url: String,
}

impl UltimakerClient {
    pub fn new(host: impl AsRef<str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{}/api/v1", host.as_ref()),
        }
    }

    pub async fn system_name(&self) -> Result<String> {
        let name = self
            .http
            .get(format!("{}/system/name", self.base_url))
            .send()
            .await
            .context("requesting system name")?
            .error_for_status()
            .context("system name request failed")?
            .json()
            .await
            .context("parsing system name")?;
        Ok(name)
    }

    /// Current printer state, e.g. `idle` or `printing`.
    pub async fn printer_status(&self) -> Result<String> {
        let status = self
            .http
            .get(format!("{}/printer/status", self.base_url))
            .send()
            .await
            .context("requesting printer status")?
            .error_for_status()
            .context("printer status request failed")?
            .json()
            .await
            .context("parsing printer status")?;
        Ok(status)
    }

    /// The running job, if any.
    pub async fn current_job(&self) -> Result<Option<UltimakerJob>> {
        let response = self
            .http
            .get(format!("{}/print_job", self.base_url))
            .send()
            .await
            .context("requesting current job")?;

        // No job running.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let job = response
            .error_for_status()
            .context("current job request failed")?
            .json()
            .await
            .context("parsing current job")?;
        Ok(Some(job))
    }

    /// Submit a payload for printing.
    pub async fn submit_job(&self, name: &str, gcode: &str) -> Result<()> {
        let file = reqwest::multipart::Part::text(gcode.to_string())
            .file_name(format!("{name}.gcode"))
            .mime_str("text/plain")
            .context("building upload part")?;
        let form = reqwest::multipart::Form::new()
            .text("jobname", name.to_string())
            .part("file", file);

        self.http
            .post(format!("{}/print_job", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("submitting print job")?
            .error_for_status()
            .context("print job submission failed")?;
        Ok(())
    }
}

/// Drives a machine agent against an Ultimaker printer.
pub struct UltimakerMachine {
    client: UltimakerClient,
}

impl UltimakerMachine {
    pub fn new(client: UltimakerClient) -> Self {
        Self { client }
    }

    /// Drive the agent until it disconnects: accepted payloads are
    /// submitted to the printer, and its status is polled once a second.
    pub async fn run(&self, handle: &mut MachineAgentHandle) -> Result<()> {
        let name = self
            .client
            .system_name()
            .await
            .context("connecting to printer")?;
        info!("connected to ultimaker \"{name}\"");

        let mut readiness = Readiness::Connected;
        let mut poll = Repeat::disarmed();
        poll.arm(STATUS_POLL_PERIOD);

        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(MachineEvent::ReadinessChanged(current)) => readiness = current,
                    Some(MachineEvent::JobAccepted { gcode, .. }) => {
                        if readiness == Readiness::Available {
                            info!("submitting accepted job to the printer");
                            match self.client.submit_job(JOB_NAME, &gcode).await {
                                Ok(()) => handle.set_readiness(Readiness::Printing).await,
                                Err(err) => {
                                    warn!("job submission failed: {err:#}");
                                    handle.set_readiness(Readiness::Unavailable).await;
                                }
                            }
                        }
                    }
                    Some(MachineEvent::Closed) | None => break,
                    Some(_) => {}
                },
                _ = poll.tick() => self.poll_status().await,
            }
        }

        Ok(())
    }

    async fn poll_status(&self) {
        match self.client.printer_status().await {
            Ok(status) => {
                debug!("printer status: {status}");
                if status == "printing" {
                    match self.client.current_job().await {
                        Ok(Some(job)) => {
                            debug!("job \"{}\" at {:.2}%", job.name, job.progress_percent);
                        }
                        Ok(None) => {}
                        Err(err) => debug!("job lookup failed: {err:#}"),
                    }
                }
            }
            Err(err) => debug!("status poll failed: {err:#}"),
        }
    }
}
