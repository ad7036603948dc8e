use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

use radiostream::{EngineConfig, PlayReason, PlaybackState, PlayerEvent, StreamPlayer};

/// Play a live internet radio stream until interrupted.
#[derive(Debug, Parser)]
#[command(name = "radiostream", version)]
struct Cli {
    /// Stream URL, or a .pls/.m3u playlist pointing at one
    url: String,

    /// JSON engine configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decoded blocks held before the oldest is dropped
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Decoded blocks required before playback starts
    #[arg(long)]
    min_blocks: Option<usize>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Output volume, 0.0 to 2.0
    #[arg(long)]
    volume: Option<f32>,
}

impl Cli {
    fn into_config(self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        config.endpoint.url = self.url;
        if let Some(capacity) = self.queue_capacity {
            config.endpoint.queue_capacity = capacity;
        }
        if let Some(min) = self.min_blocks {
            config.endpoint.min_blocks_before_playback = min;
        }
        if let Some(attempts) = self.max_attempts {
            config.backoff.max_attempts = attempts;
        }
        if let Some(volume) = self.volume {
            config.initial_volume = volume;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    let player = StreamPlayer::new(config).context("starting audio engine")?;
    let mut events = player.subscribe_events();
    player.play(PlayReason::UserInitiated);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(PlayerEvent::StateChanged(PlaybackState::Error(e))) => break Err(e.into()),
                Ok(PlayerEvent::StateChanged(state)) => info!("State: {state}"),
                Ok(PlayerEvent::Recovered { attempts, outage }) => {
                    info!("Back on air after {attempts} attempts ({:.1}s outage)", outage.as_secs_f64())
                }
                Ok(event) => debug!("Event: {event:?}"),
                Err(RecvError::Lagged(n)) => warn!("Missed {n} player events"),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    player.stop();
    player.shutdown().await;
    outcome
}
