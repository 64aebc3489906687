//! streamwatch CLI - watch a live stream from the terminal.
//!
//! This is the main binary entry point. See the `streamwatch` library
//! for the core functionality.

use anyhow::{Context, Result};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamwatch::api::{ApiClient, StaticToken};
use streamwatch::janus::{NegotiationSession, SignalingClient};
use streamwatch::media::RtcPeerFactory;
use streamwatch::phoenix::SocketOptions;
use streamwatch::watch::{GraphqlStreamApi, StreamWatcher, WatchEvent, WatchTarget};
use streamwatch::Config;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand};

/// How long `probe` waits for the gateway's offer.
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "streamwatch")]
#[command(about = "Watch live streams over Phoenix/GraphQL and Janus", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a channel until interrupted
    Watch {
        /// Channel id
        target: u64,
    },
    /// Check that the gateway produces an offer for a channel
    Probe {
        /// Channel id
        target: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { target } => run_watch(&config, WatchTarget(target)).await?,
        Commands::Probe { target } => run_probe(&config, target).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

/// Watch `target`, printing events until Ctrl-C.
async fn run_watch(config: &Config, target: WatchTarget) -> Result<()> {
    let signaling = SignalingClient::with_timeout(&config.signaling_url, config.request_timeout())
        .context("Failed to create signaling client")?;

    let mut api_client = ApiClient::new(&config.api_url, SocketOptions::default());
    if let Some(token) = &config.token {
        api_client = api_client.with_token_provider(Arc::new(StaticToken::new(token.clone())));
    }
    let api_client = Arc::new(api_client);

    let mut builder = StreamWatcher::builder(signaling, Arc::new(RtcPeerFactory))
        .session_settings(config.session_settings())
        .media_config(config.media_config())
        .metadata_refresh(config.metadata_refresh());
    match &config.documents {
        Some(documents) if documents.is_complete() => {
            builder = builder.stream_api(Arc::new(GraphqlStreamApi::new(
                Arc::clone(&api_client),
                documents.clone(),
            )));
        }
        _ => log::warn!("No GraphQL documents configured; watching media only"),
    }
    let watcher = builder.build();
    let mut events = watcher
        .take_events()
        .context("Watcher events already taken")?;

    println!("Watching {target} (Ctrl-C to stop)");
    watcher.watch(target);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    println!("Shutting down...");
    watcher.shutdown();
    api_client.shutdown().await;
    // Give the background destroy/unsubscribe requests a moment to go out.
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}

fn print_event(event: &WatchEvent) {
    match event {
        WatchEvent::Metadata { target, data } => println!("[{target}] metadata: {data}"),
        WatchEvent::History { target, data } => println!("[{target}] history: {data}"),
        WatchEvent::Chat { target, data } => println!("[{target}] chat: {data}"),
        WatchEvent::MediaStream { target, stream } => {
            println!("[{target}] media track #{} received", stream.index);
        }
        WatchEvent::MediaFailed { target, reason } => println!("[{target}] media failed: {reason}"),
        WatchEvent::MediaEnded { target } => println!("[{target}] media ended"),
        WatchEvent::InfoFailed { target, reason } => println!("[{target}] info failed: {reason}"),
        WatchEvent::ChatInterrupted { target } => println!("[{target}] chat interrupted"),
    }
}

/// Negotiate with the gateway up to the offer, then tear the session down.
async fn run_probe(config: &Config, target: u64) -> Result<()> {
    let signaling = SignalingClient::with_timeout(&config.signaling_url, config.request_timeout())
        .context("Failed to create signaling client")?;
    let session = NegotiationSession::create(signaling, target, &config.session_settings())
        .await
        .context("Failed to set up signaling session")?;
    println!(
        "Session {} / handle {} attached to {}",
        session.session_id(),
        session.plugin_id(),
        config.plugin
    );

    let offer = tokio::time::timeout(PROBE_TIMEOUT, session.sdp_offer()).await;
    let _ = session.destroy().await;

    let sdp = offer
        .context("Timed out waiting for the gateway offer")?
        .context("Failed to receive the gateway offer")?;
    for line in sdp.lines().filter(|l| l.starts_with("m=")) {
        println!("  {line}");
    }
    println!("Offer OK ({} bytes)", sdp.len());
    Ok(())
}
