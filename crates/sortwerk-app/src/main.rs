// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sortwerk — Operator tools for the card scanner and sorter.
//
// Entry point. Initialises logging, loads the config, and runs one
// subcommand.

mod services;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::human_errors::humanize_error;
use sortwerk_core::types::{DetectionResult, Frame, ServoKind};
use sortwerk_core::SorterConfig;
use sortwerk_hardware::calibration::ReplayOutcome;
use sortwerk_hardware::serial::available_ports;
use sortwerk_hardware::{Command, DeviceMessage, HardwareLink, LinkEvent, replay_calibration};
use sortwerk_scanner::CalibrationStore;
use sortwerk_vision::normalize::encode_png;
use sortwerk_vision::{CardDetector, CardNormalizer};
use tokio::sync::broadcast::error::RecvError;

use services::calibration_file::CalibrationFile;
use services::data_dir;

#[derive(Parser)]
#[command(name = "sortwerk")]
#[command(about = "Trading card scanner and sorter tools")]
#[command(version)]
struct Cli {
    /// Config file (default: config.json in the data directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find cards in still images and write the normalized crops.
    Detect(DetectArgs),

    /// List serial ports.
    Ports,

    /// Drop the card on the belt into a bin.
    Bin {
        bin: u8,
        #[command(flatten)]
        port: PortArgs,
    },

    /// Move one servo to a raw position.
    Servo {
        #[arg(value_enum)]
        kind: ServoArg,
        module: u8,
        value: u16,
        #[command(flatten)]
        port: PortArgs,
    },

    /// Send stored calibration to the sorter.
    Calibrate {
        /// Calibration JSON (default: calibration.json in the data directory).
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        port: PortArgs,
    },

    /// Print messages the sorter sends on its own (jams, boot banners).
    Monitor {
        #[command(flatten)]
        port: PortArgs,
    },
}

#[derive(Debug, Clone, Args)]
struct DetectArgs {
    /// Input images.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Directory for normalized card PNGs.  Nothing is written if omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Override the detector's minimum confidence.
    #[arg(long)]
    min_confidence: Option<f32>,
}

#[derive(Debug, Clone, Args)]
struct PortArgs {
    /// Serial device (default: `serial_port` from the config).
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (default: `baud_rate` from the config).
    #[arg(long)]
    baud: Option<u32>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServoArg {
    Pusher,
    Gate,
}

impl From<ServoArg> for ServoKind {
    fn from(arg: ServoArg) -> Self {
        match arg {
            ServoArg::Pusher => ServoKind::Pusher,
            ServoArg::Gate => ServoKind::Gate,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            let human = humanize_error(&err);
            eprintln!("{}\n{}", human.message, human.suggestion);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let dir = data_dir::data_dir();
    let config = data_dir::load_config(cli.config.as_deref(), &dir)?;

    match cli.command {
        Commands::Detect(args) => run_detect(&config, &args),
        Commands::Ports => run_ports(),
        Commands::Bin { bin, port } => run_command(&config, &port, Command::bin(bin)).await,
        Commands::Servo {
            kind,
            module,
            value,
            port,
        } => run_command(&config, &port, Command::servo(kind.into(), module, value)).await,
        Commands::Calibrate { file, port } => {
            let file = file.unwrap_or_else(|| data_dir::calibration_path(&dir));
            run_calibrate(&config, &port, CalibrationFile::new(file)).await
        }
        Commands::Monitor { port } => run_monitor(&config, &port).await,
    }
}

// -- detect -------------------------------------------------------------------

#[derive(Serialize)]
struct DetectReport<'a> {
    image: &'a Path,
    #[serde(flatten)]
    result: DetectionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<PathBuf>,
}

fn run_detect(config: &SorterConfig, args: &DetectArgs) -> Result<()> {
    let detector = CardDetector::new(args.min_confidence.unwrap_or(config.min_confidence));
    let normalizer = CardNormalizer::from_config(config);
    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)?;
    }

    let mut found = 0usize;
    for path in &args.images {
        let image = image::open(path)
            .map_err(|err| SortwerkError::Vision(format!("{}: {err}", path.display())))?;
        let frame = Frame::new(image);
        let result = detector.detect(&frame);

        let mut normalized = None;
        if let (Some(quad), Some(out)) = (result.quad(), &args.out) {
            let card = normalizer.normalize(&frame.image, quad)?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("card");
            let target = out.join(format!("{stem}.card.png"));
            std::fs::write(&target, encode_png(&card)?)?;
            normalized = Some(target);
        }
        if result.detected() {
            found += 1;
        }

        let report = DetectReport {
            image: path,
            result,
            normalized,
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    tracing::info!(images = args.images.len(), found, "detection finished");
    Ok(())
}

// -- ports --------------------------------------------------------------------

fn run_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        match port.description {
            Some(description) => println!("{}  ({description})", port.name),
            None => println!("{}", port.name),
        }
    }
    Ok(())
}

// -- sorter commands ----------------------------------------------------------

async fn connect(config: &SorterConfig, args: &PortArgs) -> Result<HardwareLink> {
    let path = args
        .port
        .clone()
        .or_else(|| config.serial_port.clone())
        .ok_or_else(|| {
            SortwerkError::Config("no serial port: pass --port or set serial_port".into())
        })?;
    let baud = args.baud.unwrap_or(config.baud_rate);

    let link = HardwareLink::from_config(config);
    link.connect_serial(&path, baud).await?;
    Ok(link)
}

async fn run_command(config: &SorterConfig, port: &PortArgs, command: Command) -> Result<()> {
    let link = connect(config, port).await?;
    let reply = link.send(&command).await;
    link.disconnect().await;

    match reply? {
        Some(DeviceMessage::Ack { ok: true, .. }) => println!("ok"),
        Some(DeviceMessage::Ack { ok: false, error }) => {
            println!("rejected: {}", error.as_deref().unwrap_or("no reason given"));
        }
        Some(DeviceMessage::Jam { module }) => match module {
            Some(module) => println!("jam on module {module}"),
            None => println!("jam"),
        },
        Some(DeviceMessage::Ready) => println!("sorter restarted"),
        Some(DeviceMessage::Text(text)) => println!("{text}"),
        None => println!("no response"),
    }
    Ok(())
}

async fn run_calibrate(config: &SorterConfig, port: &PortArgs, store: CalibrationFile) -> Result<()> {
    let modules = store.load_all()?;
    if modules.is_empty() {
        println!("{} has no modules", store.path().display());
        return Ok(());
    }

    let link = connect(config, port).await?;
    let reports = replay_calibration(&link, &modules).await;
    link.disconnect().await;

    for report in reports? {
        let outcome = match report.outcome {
            ReplayOutcome::Acknowledged => "ok".to_string(),
            ReplayOutcome::Rejected(reason) => {
                format!("rejected ({})", reason.as_deref().unwrap_or("no reason given"))
            }
            ReplayOutcome::NoResponse => "no response".to_string(),
            ReplayOutcome::Failed(detail) => format!("failed: {detail}"),
        };
        println!("module {}: {outcome}", report.module);
    }
    Ok(())
}

async fn run_monitor(config: &SorterConfig, port: &PortArgs) -> Result<()> {
    let link = connect(config, port).await?;
    let mut events = link.subscribe();
    println!("listening, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::Unsolicited(line)) => match DeviceMessage::parse(&line) {
                    Ok(message) => println!("{message:?}"),
                    Err(_) => println!("? {line}"),
                },
                Ok(LinkEvent::Connected) => {}
                Ok(LinkEvent::Disconnected { reason }) => {
                    println!("disconnected: {reason}");
                    return Err(SortwerkError::HardwareDisconnected(reason));
                }
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "messages dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    link.disconnect().await;
    Ok(())
}
