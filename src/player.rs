//! Public handle to a running streaming engine.

use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::coordinator::{Outlets, StreamingCoordinator};
use crate::decoder::{FrameCodec, SymphoniaFrameCodec};
use crate::error::Result;
use crate::events::{Command, EngineMsg, EngineTx, PcmBlock, PlayReason, PlaybackState, PlayerEvent};
use crate::ingestion::{HttpTransport, StreamTransport};
use crate::output::{AudioOutput, RodioOutput};

const EVENT_CAPACITY: usize = 256;

/// Plays one live stream endpoint.
///
/// Commands return immediately; their effect is observable through
/// [`state`](Self::state), [`subscribe_state`](Self::subscribe_state) and
/// [`subscribe_events`](Self::subscribe_events). Must be created inside a
/// tokio runtime.
pub struct StreamPlayer {
    commands: EngineTx,
    state: watch::Receiver<PlaybackState>,
    events: broadcast::Sender<PlayerEvent>,
    samples: watch::Receiver<Option<Arc<PcmBlock>>>,
    volume: Mutex<f32>,
    task: Option<JoinHandle<()>>,
}

impl StreamPlayer {
    /// reqwest for HTTP, symphonia for decoding, the default rodio device
    /// for output.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let output = RodioOutput::open()?;
        Self::with_backends(config, transport, Box::new(SymphoniaFrameCodec::new()), Box::new(output))
    }

    pub fn with_backends(
        config: EngineConfig,
        transport: Arc<dyn StreamTransport>,
        codec: Box<dyn FrameCodec>,
        output: Box<dyn AudioOutput>,
    ) -> Result<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PlaybackState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (samples_tx, samples) = watch::channel(None);
        let volume = EngineConfig::clamped_volume(config.initial_volume);

        let coordinator = StreamingCoordinator::new(
            &config,
            transport,
            codec,
            output,
            Outlets {
                tx: commands.clone(),
                state: state_tx,
                events: events.clone(),
                samples: samples_tx,
            },
        )?;
        debug!("Starting engine for {}", config.endpoint.url);
        let task = tokio::spawn(coordinator.run(rx));

        Ok(Self {
            commands,
            state,
            events,
            samples,
            volume: Mutex::new(volume),
            task: Some(task),
        })
    }

    pub fn play(&self, reason: PlayReason) {
        self.send(Command::Play(reason));
    }

    /// Disconnects from the stream; a later `play` joins the live edge.
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Like `pause`, and also forgets any reconnect progress.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clamped to `[0, 2]`.
    pub fn set_volume(&self, volume: f32) {
        let volume = EngineConfig::clamped_volume(volume);
        *self.volume.lock().unwrap_or_else(|e| e.into_inner()) = volume;
        self.send(Command::SetVolume(volume));
    }

    pub fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    /// Lifecycle and telemetry events. A subscriber that falls behind loses
    /// the oldest events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Newest decoded block, for visualizers. Only the latest is retained.
    pub fn subscribe_samples(&self) -> watch::Receiver<Option<Arc<PcmBlock>>> {
        self.samples.clone()
    }

    /// Stop playback and wait for the engine to wind down.
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Engine task failed: {e}");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(EngineMsg::Command(command)).is_err() {
            warn!("Engine is no longer running");
        }
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(EngineMsg::Command(Command::Shutdown));
        }
    }
}
