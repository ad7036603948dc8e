//! Engine configuration, read once at construction and never mutated.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 12;
pub const DEFAULT_MIN_BLOCKS: usize = 4;
pub const DEFAULT_LOW_WATER_BLOCKS: usize = 3;
/// Enough for several consecutive frames at typical radio bitrates.
pub const DEFAULT_MIN_SYNC_BYTES: usize = 16 * 1024;
pub const USER_AGENT: &str = concat!("radiostream/", env!("CARGO_PKG_VERSION"));

/// Stream URL plus the buffering parameters tied to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamEndpoint {
    pub url: String,
    pub queue_capacity: usize,
    pub min_blocks_before_playback: usize,
}

impl Default for StreamEndpoint {
    fn default() -> Self {
        Self {
            url: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            min_blocks_before_playback: DEFAULT_MIN_BLOCKS,
        }
    }
}

impl StreamEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_min_blocks(mut self, min: usize) -> Self {
        self.min_blocks_before_playback = min;
        self
    }
}

/// Reconnect timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Fraction of the current wait added as random jitter, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: StreamEndpoint,
    pub backoff: BackoffConfig,
    /// Scheduler asks for more audio once fewer blocks than this are outstanding.
    pub low_water_blocks: usize,
    /// Bytes buffered before the first frame-sync attempt.
    pub min_sync_bytes: usize,
    pub connect_timeout_ms: u64,
    /// A connected stream silent for this long counts as disconnected.
    pub idle_timeout_ms: u64,
    pub user_agent: String,
    pub initial_volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: StreamEndpoint::default(),
            backoff: BackoffConfig::default(),
            low_water_blocks: DEFAULT_LOW_WATER_BLOCKS,
            min_sync_bytes: DEFAULT_MIN_SYNC_BYTES,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 15_000,
            user_agent: USER_AGENT.to_string(),
            initial_volume: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn new(endpoint: StreamEndpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let ep = &self.endpoint;
        if ep.url.trim().is_empty() {
            anyhow::bail!("stream URL is empty");
        }
        if ep.queue_capacity == 0 {
            anyhow::bail!("queue capacity must be at least 1");
        }
        if ep.min_blocks_before_playback == 0 || ep.min_blocks_before_playback > ep.queue_capacity {
            anyhow::bail!(
                "min blocks before playback must be in 1..={} (got {})",
                ep.queue_capacity,
                ep.min_blocks_before_playback
            );
        }
        if self.low_water_blocks == 0 {
            anyhow::bail!("low water mark must be at least 1 block");
        }
        let b = &self.backoff;
        if b.max_attempts == 0 {
            anyhow::bail!("max reconnect attempts must be at least 1");
        }
        if !(b.multiplier >= 1.0) {
            anyhow::bail!("backoff multiplier must be >= 1.0 (got {})", b.multiplier);
        }
        if !(0.0..1.0).contains(&b.jitter) {
            anyhow::bail!("backoff jitter must be in [0, 1) (got {})", b.jitter);
        }
        if b.max_delay_ms < b.initial_delay_ms {
            anyhow::bail!("backoff cap is below the initial delay");
        }
        Ok(())
    }

    pub(crate) fn clamped_volume(volume: f32) -> f32 {
        if volume.is_nan() {
            return 1.0;
        }
        volume.clamp(0.0, 2.0)
    }
}
