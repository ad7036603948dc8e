//! Live internet-radio streaming engine.
//!
//! Opens a continuous MPEG audio stream over HTTP, decodes it incrementally,
//! buffers a few frames against network jitter and plays them on the default
//! output device, reconnecting with exponential backoff when the stream
//! stalls or drops. [`StreamPlayer`] is the entry point.

pub mod backoff;
pub mod config;
mod coordinator;
pub mod decoder;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod output;
pub mod player;
pub mod queue;
mod scheduler;
pub mod utils;

pub use config::{BackoffConfig, EngineConfig, StreamEndpoint};
pub use decoder::{FrameCodec, FrameDecoder, SymphoniaFrameCodec};
pub use error::{Result, StreamError};
pub use events::{AudioFormat, PcmBlock, PlayReason, PlaybackState, PlayerEvent};
pub use ingestion::{HttpTransport, StreamTransport};
pub use output::{AudioOutput, RodioOutput};
pub use player::StreamPlayer;
pub use queue::BoundedSampleQueue;
