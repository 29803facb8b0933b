//! Distress monitor service binary
//!
//! Reads transcripts from stdin (one per line) and runs the full
//! detection, countdown and dispatch pipeline. `cancel`, `retry`, `locate`
//! and `quit` are treated as commands.

use anyhow::{bail, Context, Result};
use clap::Parser;
use distress_monitor::countdown::{format_clock, Urgency};
use distress_monitor::{
    AlertStateMachine, Capabilities, ChannelSpeechSource, ContactStore, FixedLocation,
    InMemoryContactStore, JsonContactStore, LocationCapability, LocationFix, MonitorConfig,
    MonitorHandle, MonitorNotice, NoLocation, WhatsAppLinkSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "distress-service", version, about = "Voice distress monitor")]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON contacts file (array of {id?, name, phone})
    #[arg(long)]
    contacts: Option<PathBuf>,

    /// Name used in the alert text
    #[arg(short, long)]
    name: Option<String>,

    /// Static location as "lat,lng[,accuracy]"
    #[arg(short, long)]
    location: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    distress_monitor::init_logging();

    let cli = Cli::parse();
    info!("Starting Distress Monitor v{}", distress_monitor::VERSION);

    let config = load_config(&cli)?;

    let location: Arc<dyn LocationCapability> = match &cli.location {
        Some(raw) => Arc::new(FixedLocation::new(parse_location(raw)?)),
        None => Arc::new(NoLocation),
    };

    let contacts: Arc<dyn ContactStore> = match &cli.contacts {
        Some(path) => Arc::new(JsonContactStore::new(path.clone())),
        None => {
            warn!("No contacts file given; alerts will ask for configuration");
            Arc::new(InMemoryContactStore::default())
        }
    };

    let (line_tx, line_rx) = mpsc::channel(32);
    let capabilities = Capabilities {
        speech: Box::new(ChannelSpeechSource::new(line_rx)),
        location,
        sink: Arc::new(WhatsAppLinkSink::logging()),
        contacts,
    };

    let (machine, handle) = AlertStateMachine::new(config.clone(), capabilities)?;
    let mut notices = handle.subscribe();
    let monitor = tokio::spawn(machine.run());

    let total = config.countdown_secs;
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            report(total, &notice);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !run_command(&handle, &line_tx, &line).await {
            break;
        }
    }

    handle.shutdown();
    monitor.await.context("monitor task failed")?;
    info!("Distress monitor stopped");

    Ok(())
}

/// Act on one stdin line; returns false on `quit`
///
/// Never waits on a location lookup, so a `cancel` typed right after
/// `locate` still reaches the countdown immediately.
async fn run_command(handle: &MonitorHandle, transcripts: &mpsc::Sender<String>, line: &str) -> bool {
    match line.trim() {
        "" => {}
        "cancel" => {
            handle.cancel();
        }
        "retry" => {
            handle.retry();
        }
        "locate" => {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.locate().await.fix() {
                    Some(fix) => println!("Location: {} ({})", fix.coordinates(), fix.maps_link()),
                    None => println!("Location: unavailable"),
                }
            });
        }
        "quit" => return false,
        text => {
            if transcripts.send(text.to_string()).await.is_err() {
                warn!("Speech source is not accepting transcripts");
            }
        }
    }
    true
}

fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = match &cli.config {
        Some(path) => MonitorConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    config.apply_env()?;

    if let Some(name) = &cli.name {
        config.user_name = Some(name.clone());
    }

    Ok(config)
}

fn parse_location(raw: &str) -> Result<LocationFix> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid location: {}", raw))?;

    match parts.as_slice() {
        [lat, lng] => Ok(LocationFix::new(*lat, *lng, None)),
        [lat, lng, accuracy] => Ok(LocationFix::new(*lat, *lng, Some(*accuracy))),
        _ => bail!("location must be \"lat,lng[,accuracy]\": {}", raw),
    }
}

fn report(total: u32, notice: &MonitorNotice) {
    match notice {
        MonitorNotice::StateChanged(state) => info!("Status: {:?}", state),
        MonitorNotice::Detected { event, .. } => {
            println!("Emergency detected: \"{}\". Starting countdown...", event.matched_phrase)
        }
        MonitorNotice::Tick { remaining, .. } => {
            if *remaining == total || *remaining <= 10 || remaining % 5 == 0 {
                println!(
                    "[{}] {} - type 'cancel' to stop the alert",
                    format_clock(*remaining),
                    Urgency::for_remaining(*remaining).label()
                );
            }
        }
        MonitorNotice::Cancelled { .. } => {
            println!("Emergency alert cancelled. Monitoring again.")
        }
        MonitorNotice::NeedsConfiguration { .. } => {
            println!("No emergency contacts configured. Add contacts and try again.")
        }
        MonitorNotice::Dispatched { record, .. } => {
            println!("Emergency message sent to {}", record.contact_name)
        }
        MonitorNotice::SessionClosed(session) => info!(
            "Session {} closed as {:?} ({} recipient(s))",
            session.id, session.state, session.recipients_notified
        ),
        MonitorNotice::LocationResolved { outcome, .. } => {
            if !outcome.is_available() {
                warn!("Sending alert without location");
            }
        }
        MonitorNotice::SourceRestarted { attempt } => info!("Speech source restart #{}", attempt),
    }
}
