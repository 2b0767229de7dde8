//! # Peerlink client
//!
//! Command-line peer: connects to a signaling relay, negotiates one WebRTC
//! session at a time with the remote device and logs what comes back
//! (state changes, tracks, lamp status frames).
//!
//! Stdin commands: `connect`, `disconnect`, `send <text>`, `quit`.

use clap::Parser;
use peerlink_session::media::{MediaStream, RenderTarget, TrackEvent};
use peerlink_session::{
    CodecExclusionPolicy, ControlCommand, ControllerSettings, NegotiationController, SessionNotice,
    Str0mEngine, WebSocketSignaling,
};
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer WebRTC session client", long_about = None)]
struct Args {
    /// Signaling relay URL (overrides `signaling.url`)
    #[arg(long)]
    signaling_url: Option<String>,

    /// Connect as soon as the signaling channel is up
    #[arg(long)]
    initiate: bool,

    /// Codec to strip from offers; repeat for several (overrides configuration)
    #[arg(long = "exclude-codec", value_name = "CODEC")]
    exclude_codecs: Vec<String>,

    /// Tear the session down when the remote peer sends `close`
    #[arg(long)]
    auto_disconnect: bool,
}

/// Logs what would be rendered. There is no video surface in a terminal.
struct LogRenderTarget;

impl RenderTarget for LogRenderTarget {
    fn attach(&mut self, stream: &MediaStream) {
        tracing::info!(stream = %stream.id, tracks = stream.tracks.len(), "Attached media stream");
    }

    fn add_track(&mut self, track: &TrackEvent) {
        tracing::info!(mid = %track.mid, kind = %track.kind, "Track added to stream");
    }

    fn release(&mut self) {
        tracing::info!("Media stream released");
    }
}

fn parse_command(line: &str) -> Option<ControlCommand> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "connect" => Some(ControlCommand::Connect),
        "disconnect" => Some(ControlCommand::Disconnect),
        "send" if !rest.trim().is_empty() => Some(ControlCommand::SendData(rest.trim().to_string())),
        "quit" | "exit" => Some(ControlCommand::Shutdown),
        _ => None,
    }
}

async fn read_commands(commands: mpsc::Sender<ControlCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match parse_command(&line) {
                Some(command) => {
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
                None => tracing::warn!(input = %line, "Unknown command (connect | disconnect | send <text> | quit)"),
            },
            Ok(None) => {
                tracing::debug!("stdin closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
}

async fn watch_notices(
    mut notices: mpsc::UnboundedReceiver<SessionNotice>,
    commands: mpsc::Sender<ControlCommand>,
    auto_disconnect: bool,
) {
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::StateChanged { session, state } => {
                tracing::info!(%session, %state, "Session state");
            }
            SessionNotice::RemoteClosed => {
                tracing::info!(auto_disconnect, "Remote peer closed the session");
                if auto_disconnect && commands.send(ControlCommand::Disconnect).await.is_err() {
                    break;
                }
            }
            SessionNotice::Status(update) => {
                tracing::info!(status = %update.summary(), "💡 Device status");
            }
            SessionNotice::Error { code, message } => {
                tracing::warn!(code = %code, message = %message, "Session error");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = peerlink_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlink=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("🚀 Starting Peerlink v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = ControllerSettings::from_config(&config);
    if !args.exclude_codecs.is_empty() {
        settings.exclusions = CodecExclusionPolicy::new(args.exclude_codecs);
    }
    tracing::info!(excluded = ?settings.exclusions.codecs(), "Offer codec exclusions");

    let url = args
        .signaling_url
        .unwrap_or_else(|| config.signaling.url.clone());
    let (signaling, inbound) = WebSocketSignaling::connect(&url).await?;
    tracing::info!("📡 Signaling relay at {url}");

    let bind_ip: IpAddr = config.media.bind_ip.parse()?;
    let engine = Str0mEngine::new(bind_ip).with_ice_servers(config.ice.servers.clone());

    let mut controller = NegotiationController::new(engine, signaling, LogRenderTarget, settings);
    let notices = controller.subscribe();
    let (commands, command_rx) = mpsc::channel(32);

    tokio::spawn(read_commands(commands.clone()));
    tokio::spawn(watch_notices(notices, commands.clone(), args.auto_disconnect));

    let shutdown = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            let _ = shutdown.send(ControlCommand::Shutdown).await;
        }
    });

    if args.initiate {
        commands.send(ControlCommand::Connect).await?;
    }
    drop(commands);

    controller.run(inbound, command_rx).await?;
    Ok(())
}
