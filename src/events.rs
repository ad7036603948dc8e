//! Data types exchanged between the engine components and its subscribers.

use std::fmt;
use std::time::Duration;

use crate::error::StreamError;

/// Sample rate and channel count, latched from the first decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz x{}", self.sample_rate, self.channels)
    }
}

/// One decoded compressed frame worth of interleaved f32 PCM.
///
/// Treated as immutable once produced; shared by `Arc` with visualization
/// subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBlock {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl PcmBlock {
    pub fn new(format: AudioFormat, samples: Vec<f32>) -> Self {
        Self { format, samples }
    }

    /// Sample-frames in this block (one sample per channel each).
    pub fn frames(&self) -> usize {
        match self.format.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.format.sample_rate as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Idle,
    Connecting,
    Buffering { buffered: usize, required: usize },
    Playing,
    Paused,
    Stalled,
    Error(StreamError),
}

impl PlaybackState {
    /// True while the engine holds, or is trying to obtain, a live stream.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Buffering { .. } | Self::Playing | Self::Stalled
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Buffering { buffered, required } => {
                write!(f, "buffering({buffered}/{required})")
            }
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Stalled => write!(f, "stalled"),
            Self::Error(e) => write!(f, "error({e})"),
        }
    }
}

/// Why playback was requested; logged and carried for analytics consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayReason {
    UserInitiated,
    Resume,
    Autoplay,
    RemoteCommand,
    Other(String),
}

impl fmt::Display for PlayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserInitiated => write!(f, "user"),
            Self::Resume => write!(f, "resume"),
            Self::Autoplay => write!(f, "autoplay"),
            Self::RemoteCommand => write!(f, "remote"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Lifecycle and telemetry events broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    Started,
    Paused,
    Stopped,
    Stalled,
    RecoveredFromStall,
    NeedsMoreBuffers,
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectAttempt { attempt: u32 },
    ReconnectFailed { attempt: u32, reason: StreamError },
    /// Audio flowing again after an outage; `outage` spans stall to recovery.
    Recovered { attempts: u32, outage: Duration },
    Error(StreamError),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Play(PlayReason),
    Pause,
    Stop,
    SetVolume(f32),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IngestionEvent {
    Connected,
    /// Sent at most once per connection episode.
    Disconnected(StreamError),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DecoderEvent {
    FormatDiscovered(AudioFormat),
    /// A block was pushed into the sample queue.
    BlockReady,
    Failed(StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerEvent {
    Started,
    Stopped,
    NeedsMoreBuffers,
    Stalled,
    RecoveredFromStall,
}

/// Everything the coordinator reacts to, funnelled through one channel so
/// state transitions are serialized.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    Command(Command),
    Ingestion { session: u64, event: IngestionEvent },
    Decoder { session: u64, event: DecoderEvent },
    Scheduler(SchedulerEvent),
    BlockCompleted { generation: u64 },
    RetryDue { ticket: u64 },
}

pub(crate) type EngineTx = tokio::sync::mpsc::UnboundedSender<EngineMsg>;
pub(crate) type EngineRx = tokio::sync::mpsc::UnboundedReceiver<EngineMsg>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_frames_and_duration() {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        let block = PcmBlock::new(format, vec![0.0; 1152 * 2]);
        assert_eq!(block.frames(), 1152);
        let ms = block.duration().as_secs_f64() * 1000.0;
        assert!((ms - 26.122).abs() < 0.01);
    }

    #[test]
    fn test_state_display() {
        let state = PlaybackState::Buffering {
            buffered: 1,
            required: 2,
        };
        assert_eq!(state.to_string(), "buffering(1/2)");
        assert!(state.is_active());
        assert!(!PlaybackState::Paused.is_active());
    }
}
