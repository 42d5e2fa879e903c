//! Interview session binary entry point
//!
//! Joins a room as interviewer or interviewee over a PeerJS-compatible relay
//! and logs every session event. Capture devices are synthetic.
//!
//! # Usage
//!
//! ```bash
//! # Host a room
//! cargo run --bin interview-session -- --role interviewer --room room-42
//!
//! # Join it from another terminal
//! cargo run --bin interview-session -- --role interviewee --room room-42
//!
//! # Use a local relay and a faster reconnect schedule
//! cargo run --bin interview-session -- \
//!   --role interviewer --room room-42 \
//!   --relay-host localhost --relay-port 9000 --insecure \
//!   --base-reconnect-delay-ms 250 --max-reconnect-attempts 3
//! ```

use clap::Parser;
use peer_session::{
    CallController, CallStatus, DeviceManager, EventChannel, IceServerConfig, PeerSessionManager,
    Role, SessionConfig, SessionEvent, SyntheticBackend, WebSocketRelay,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Two-party interview session
///
/// Settings not given on the command line come from `PEER_*` environment
/// variables, then from built-in defaults.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Participant role: interviewer or interviewee
    #[arg(short, long, env = "INTERVIEW_ROLE")]
    role: Role,

    /// Room id (the interviewer registers under it)
    #[arg(long, env = "INTERVIEW_ROOM")]
    room: String,

    /// Local peer id (defaults to the room id for the interviewer)
    #[arg(long, env = "INTERVIEW_IDENTITY")]
    identity: Option<String>,

    /// Preferred camera label (case-insensitive substring)
    #[arg(long, env = "PEER_PREFERRED_CAMERA")]
    camera: Option<String>,

    /// Relay host
    #[arg(long)]
    relay_host: Option<String>,

    /// Relay port
    #[arg(long)]
    relay_port: Option<u16>,

    /// Relay mount path
    #[arg(long)]
    relay_path: Option<String>,

    /// Relay key
    #[arg(long)]
    relay_key: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long, default_value_t = false)]
    insecure: bool,

    /// ICE server URLs (comma-separated, one server per URL)
    #[arg(long, value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Base reconnect delay in milliseconds
    #[arg(long)]
    base_reconnect_delay_ms: Option<u64>,

    /// Maximum reconnect delay in milliseconds
    #[arg(long)]
    max_reconnect_delay_ms: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "INTERVIEW_JSON_LOGS")]
    json_logs: bool,
}

/// Build the session configuration from the environment and CLI overrides
fn build_config_from_args(args: &Args) -> peer_session::Result<SessionConfig> {
    let mut config = SessionConfig::from_env()?;

    if let Some(host) = &args.relay_host {
        config.relay_host = host.clone();
    }
    if let Some(port) = args.relay_port {
        config.relay_port = port;
    }
    if let Some(path) = &args.relay_path {
        config.relay_path = path.clone();
    }
    if let Some(key) = &args.relay_key {
        config.relay_key = key.clone();
    }
    if args.insecure {
        config.secure_transport = false;
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.iter().map(IceServerConfig::new).collect();
    }
    if let Some(ms) = args.base_reconnect_delay_ms {
        config.base_reconnect_delay_ms = ms;
    }
    if let Some(ms) = args.max_reconnect_delay_ms {
        config.max_reconnect_delay_ms = ms;
    }
    if let Some(n) = args.max_reconnect_attempts {
        config.max_reconnect_attempts = n;
    }
    if let Some(label) = &args.camera {
        config = config.with_preferred_camera(label);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(
        version = peer_session::version(),
        role = %args.role,
        room = %args.room,
        "Interview session starting"
    );

    let config = build_config_from_args(&args)?;
    let identity = match (&args.identity, args.role) {
        (Some(id), _) => id.clone(),
        (None, Role::Interviewer) => args.room.clone(),
        (None, Role::Interviewee) => format!("guest-{}", uuid::Uuid::new_v4().simple()),
    };

    let events = EventChannel::default();
    let devices = Arc::new(DeviceManager::new(
        Arc::new(SyntheticBackend::default()),
        &config,
        events.clone(),
    ));
    let relay = Arc::new(WebSocketRelay::new(config.clone()));
    let session = PeerSessionManager::new(relay, devices, &config, events.clone());
    let controller = CallController::new(session);

    tokio::spawn(log_events(events.subscribe()));

    if let Err(e) = controller
        .start_session(args.role, &args.room, &identity)
        .await
    {
        error!("Failed to start session: {}", e);
    }

    let mut status = controller.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, ending call");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let call = status.borrow_and_update().clone();
                info!(status = %call.status, error = ?call.error_message, "Call status");
                if call.status == CallStatus::Ended {
                    break;
                }
            }
        }
    }

    controller.end_call().await?;
    info!("Interview session finished");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::RemoteStreamAvailable(stream)) => {
                info!(
                    remote = stream.peer_id(),
                    tracks = stream.tracks().len(),
                    "Remote stream available"
                );
            }
            Ok(SessionEvent::Reconnecting { attempt, delay }) => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
            }
            Ok(SessionEvent::ConnectivityError(message)) => {
                error!("Connectivity error: {}", message);
            }
            Ok(SessionEvent::DevicesChanged(devices)) => {
                for device in devices {
                    info!(id = %device.id, label = %device.label, "Camera");
                }
            }
            Ok(event) => info!(event = event.name(), details = ?event, "Session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_tracing(json: bool) {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
