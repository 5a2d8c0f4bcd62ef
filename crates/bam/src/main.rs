//! bam — run BAM agents from the terminal.
//!
//! The CLI is the "UI layer" of the core: it issues the explicit agent
//! commands (connect, set readiness, disconnect) and renders the agents'
//! event streams as log lines.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use bam::agent::{
    JobAgent, JobConfig, JobEvent, MachineAgent, MachineConfig, MachineTiming, Readiness,
};
use bam::machines::{DummyMachine, UltimakerClient, UltimakerMachine};
use bam::protocol::JobDetails;
use bam::relay::WsRelay;
use bam::settings::Settings;

#[derive(Parser)]
#[command(name = "bam", version, about = "Brokered additive manufacturing agents")]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (overrides settings).
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// Access key presented to the relay (overrides settings).
    #[arg(long, global = true)]
    access_key: Option<String>,

    /// Group to negotiate in (overrides settings).
    #[arg(long, global = true)]
    group_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one G-code file as a job.
    Job(JobArgs),
    /// Run a machine that accepts jobs.
    Machine(MachineArgs),
}

#[derive(clap::Args)]
struct JobArgs {
    /// Path to the .gcode payload.
    #[arg(long)]
    gcode: PathBuf,

    /// Job name shown to machines (defaults to the file name).
    #[arg(long)]
    name: Option<String>,

    /// Material the job expects.
    #[arg(long)]
    material: Option<String>,

    /// Seconds to wait for a machine before giving up.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(clap::Args)]
struct MachineArgs {
    /// Which machine family to drive.
    #[arg(long, value_enum, default_value = "dummy")]
    driver: Driver,

    /// Ultimaker hostname or IP (ultimaker driver).
    #[arg(long)]
    ultimaker_host: Option<String>,

    /// Mark the machine available immediately.
    #[arg(long)]
    available: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Driver {
    Dummy,
    Ultimaker,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.relay_url {
        settings.relay_url = url;
    }
    if let Some(key) = cli.access_key {
        settings.access_key = key;
    }
    if let Some(group) = cli.group_key {
        settings.group_key = Some(group);
    }

    match cli.command {
        Command::Job(args) => run_job(settings, args),
        Command::Machine(args) => run_machine(settings, args),
    }
}

#[tokio::main]
async fn run_job(settings: Settings, args: JobArgs) -> Result<()> {
    if args.gcode.extension().and_then(|ext| ext.to_str()) != Some("gcode") {
        bail!("payload must be a .gcode file");
    }
    let gcode = std::fs::read_to_string(&args.gcode)
        .with_context(|| format!("reading {}", args.gcode.display()))?;

    let name = args.name.unwrap_or_else(|| {
        args.gcode
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
    });
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(settings.job.timeout_secs));

    let relay = WsRelay::new(settings.relay_url.clone());
    let config = JobConfig {
        access_key: settings.access_key.clone(),
        group_key: settings.group_key.clone(),
        timeout,
        details: Some(JobDetails {
            name,
            material: args.material.unwrap_or(settings.job.material),
        }),
    };

    let mut handle = JobAgent::connect(&relay, config, gcode)
        .await
        .context("connecting to relay")?;
    info!("job agent online as {}", handle.id());

    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::StateChanged(state) => info!("job state: {state}"),
            JobEvent::Selected { machine_id } => {
                info!("payload delivered to machine {machine_id}");
            }
            JobEvent::TimedOut => {
                warn!("no machine picked the job in time");
                break;
            }
            JobEvent::Closed => break,
        }
    }

    Ok(())
}

#[tokio::main]
async fn run_machine(settings: Settings, args: MachineArgs) -> Result<()> {
    let relay = WsRelay::new(settings.relay_url.clone());
    let config = MachineConfig {
        access_key: settings.access_key.clone(),
        group_key: settings.group_key.clone(),
        timing: MachineTiming::default(),
    };

    let mut handle = MachineAgent::connect(&relay, config)
        .await
        .context("connecting to relay")?;
    info!("machine agent online as {}", handle.id());

    if args.available {
        handle.set_readiness(Readiness::Available).await;
    }

    match args.driver {
        Driver::Dummy => {
            DummyMachine::new().run(&mut handle).await;
        }
        Driver::Ultimaker => {
            let host = args
                .ultimaker_host
                .or(settings.machine.ultimaker_host)
                .context("the ultimaker driver needs --ultimaker-host")?;
            UltimakerMachine::new(UltimakerClient::new(host))
                .run(&mut handle)
                .await?;
        }
    }

    Ok(())
}
