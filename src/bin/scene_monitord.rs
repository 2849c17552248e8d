//! scene_monitord - live stream scene monitor daemon
//!
//! This daemon:
//! 1. Loads configuration (SCENE_CONFIG file, SCENE_* env, command line)
//! 2. Starts a supervisor for every configured stream
//! 3. Prints status, analysis and frame events to stdout as JSON lines
//! 4. Stops every stream on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use scene_monitor::{
    Broadcaster, ChatCompletionsClient, Collaborators, MonitorConfig, NewStream, SourceRouter,
    StreamEvent, StreamRegistry, Subscription, SystemClock,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Supervise camera streams and describe them with a vision model"
)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SCENE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stream locator to monitor; repeatable. Replaces the configured streams.
    /// Digits select a local capture device, anything else is a URI.
    #[arg(long = "stream", value_name = "LOCATOR")]
    streams: Vec<String>,

    /// Include base64 JPEG payloads in printed frame events.
    #[arg(long)]
    print_frames: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load_from(args.config.as_deref())?;
    if !args.streams.is_empty() {
        config.streams = args.streams.iter().cloned().map(NewStream::new).collect();
    }
    if config.streams.is_empty() {
        return Err(anyhow!(
            "no streams configured; pass --stream, set SCENE_STREAMS, or list streams in the config file"
        ));
    }

    let broadcaster = Broadcaster::new(config.subscriber_capacity);
    let events = broadcaster.subscribe();
    let print_frames = args.print_frames;
    thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || print_events(events, print_frames))
        .context("spawn event printer")?;

    let deps = Collaborators {
        source: Arc::new(SourceRouter::new(config.source.clone())),
        inference: Arc::new(ChatCompletionsClient::new(config.inference.clone())),
        broadcaster,
        clock: Arc::new(SystemClock),
    };
    let registry = StreamRegistry::new(deps, config.supervisor.clone());
    log::info!("inference endpoint {}", config.inference.endpoint);

    for request in config.streams {
        let locator = request.locator.clone();
        registry
            .add_stream(request)
            .with_context(|| format!("add stream {}", locator))?;
    }
    log::info!(
        "scene_monitord running with {} streams",
        registry.list_streams().len()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("set Ctrl-C handler")?;

    log::info!("scene_monitord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    registry.shutdown();
    Ok(())
}

fn print_events(events: Subscription, print_frames: bool) {
    let stdout = std::io::stdout();
    while let Some(event) = events.recv() {
        let line = match &event {
            StreamEvent::Frame(frame) if !print_frames => Ok(serde_json::json!({
                "event": "frame",
                "stream_id": frame.stream_id,
                "sequence": frame.sequence,
                "width": frame.width,
                "height": frame.height,
                "bytes": frame.jpeg.len(),
            })
            .to_string()),
            other => serde_json::to_string(other),
        };
        match line {
            Ok(line) => {
                let mut out = stdout.lock();
                if writeln!(out, "{}", line).is_err() {
                    return;
                }
            }
            Err(err) => log::warn!("failed to serialize event: {}", err),
        }
    }
}
