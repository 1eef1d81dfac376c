//! segue - headless command-line player
//!
//! Plays one or more M3U8 manifests in lockstep on a virtual audio clock and
//! reports playback events. Useful for checking manifests, network behaviour
//! and scheduling without an output device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use segue_common::config::TomlConfig;
use segue_common::human_time::{format_duration, format_pct, format_position};
use segue_common::PlayerEvent;
use segue_player::audio::{AudioContext, HeadlessContext};
use segue_player::fetch::{Fetcher, HttpFetcher};
use segue_player::{Controller, ControllerConfig, Track, TrackConfig};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for segue
#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(about = "Gapless segmented audio player")]
#[command(version)]
struct Args {
    /// Manifest URLs, played together on one timeline
    #[arg(required = true)]
    urls: Vec<String>,

    /// Path to the TOML config file
    #[arg(short, long, env = "SEGUE_CONFIG")]
    config: Option<PathBuf>,

    /// Loop the play window instead of stopping at its end
    #[arg(short = 'l', long = "loop")]
    looping: bool,

    /// Start of the play window in seconds
    #[arg(long)]
    offset: Option<f64>,

    /// Length of the play window in seconds
    #[arg(long)]
    play_duration: Option<f64>,

    /// Seek here before playing, in seconds
    #[arg(long)]
    seek: Option<f64>,

    /// Tick interval in milliseconds
    #[arg(long)]
    refresh_rate_ms: Option<u64>,

    /// Master volume
    #[arg(long)]
    volume: Option<f64>,

    /// Extra request header as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        TomlConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    if let Some(rate) = args.refresh_rate_ms {
        config.playback.refresh_rate_ms = rate;
    }
    if let Some(volume) = args.volume {
        config.playback.volume = volume;
    }
    for (name, value) in &args.headers {
        config.network.headers.insert(name.clone(), value.clone());
    }
    config.validate().context("Invalid configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting segue with {} manifest(s)", args.urls.len());

    let audio: Arc<dyn AudioContext> = Arc::new(HeadlessContext::new());
    let controller = Controller::new(
        audio,
        ControllerConfig::from(&config).closing_context_on_destroy(true),
    )
    .await
    .context("Failed to initialize controller")?;

    let fetcher: Arc<dyn Fetcher> = Arc::new(
        HttpFetcher::new(Duration::from_millis(config.network.request_timeout_ms))
            .context("Failed to build HTTP client")?,
    );

    let mut events = controller.stream();

    let tracks: Vec<Track> = args
        .urls
        .iter()
        .map(|_| Track::new(&controller, fetcher.clone(), TrackConfig::from(&config)))
        .collect();
    let loads = tracks
        .iter()
        .zip(&args.urls)
        .map(|(track, url)| async move {
            track
                .load(url)
                .await
                .with_context(|| format!("Failed to load {}", url))
        });
    for result in futures::future::join_all(loads).await {
        result?;
    }

    controller.set_loop(args.looping);
    if let Some(offset) = args.offset {
        controller.set_offset(offset).context("Invalid --offset")?;
    }
    if args.play_duration.is_some() {
        controller
            .set_play_duration(args.play_duration)
            .context("Invalid --play-duration")?;
    }
    if let Some(t) = args.seek {
        controller.seek(t).await.context("Invalid --seek")?;
    }

    info!(
        "Duration {}, play window {}",
        format_duration(controller.duration()),
        format_duration(controller.play_duration())
    );

    controller
        .play_when_ready()
        .await
        .context("Failed to start playback")?;

    let outcome = tokio::select! {
        result = report_events(&mut events, args.json, args.looping) => result,
        _ = shutdown_signal() => Ok(()),
    };

    controller
        .destroy()
        .await
        .context("Failed to shut down controller")?;
    info!("Shutdown complete");
    outcome
}

fn default_filter(level: &str) -> String {
    format!("segue={level},segue_player={level},segue_common={level}")
}

/// Print events until playback ends
async fn report_events(
    events: &mut tokio::sync::broadcast::Receiver<PlayerEvent>,
    json: bool,
    looping: bool,
) -> Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event stream lagged, {} events skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => return Err(anyhow!("Event stream closed")),
        };

        if json {
            println!(
                "{}",
                serde_json::to_string(&event).context("Failed to serialize event")?
            );
        } else {
            println!(
                "{} {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                describe(&event)
            );
        }

        if matches!(event, PlayerEvent::End) && !looping {
            return Ok(());
        }
    }
}

fn describe(event: &PlayerEvent) -> String {
    match event {
        PlayerEvent::Start => "start".to_string(),
        PlayerEvent::Pause => "pause".to_string(),
        PlayerEvent::Seek { t, pct, remaining } => format!(
            "seek {} ({}, {} left)",
            format_position(*t),
            format_pct(*pct),
            format_position(*remaining)
        ),
        PlayerEvent::TimeUpdate {
            t, pct, remaining, ..
        } => format!(
            "{} ({}, {} left)",
            format_position(*t),
            format_pct(*pct),
            format_position(*remaining)
        ),
        PlayerEvent::PauseStart => "buffering...".to_string(),
        PlayerEvent::PauseEnd => "buffered".to_string(),
        PlayerEvent::End => "end".to_string(),
        PlayerEvent::Error { cause } => format!("error: {}", cause),
        PlayerEvent::Init { track_id } => format!("track {} ready", track_id),
        PlayerEvent::Duration { duration } => format!("duration {}", format_duration(*duration)),
        PlayerEvent::Offset { offset } => format!("offset {}", format_position(*offset)),
        PlayerEvent::PlayDuration { play_duration } => {
            format!("play duration {}", format_duration(*play_duration))
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
