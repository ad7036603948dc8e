//! The engine's state machine.
//!
//! One task owns every component and processes a single ordered stream of
//! [`EngineMsg`]s: user commands, ingestion and decoder events tagged with the
//! connection session that produced them, scheduler events, block
//! completions and backoff timer firings. Nothing else mutates playback
//! state, so transitions never race.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::decoder::worker::{DecodeWorker, SampleTap};
use crate::decoder::{FrameCodec, FrameDecoder};
use crate::error::{Result, StreamError};
use crate::events::{
    Command, DecoderEvent, EngineMsg, EngineRx, EngineTx, IngestionEvent, PlaybackState,
    PlayerEvent, SchedulerEvent,
};
use crate::ingestion::{StreamIngestionClient, StreamTransport};
use crate::output::AudioOutput;
use crate::queue::BoundedSampleQueue;
use crate::scheduler::{PlaybackScheduler, SchedulerState};

/// Outbound channels the coordinator publishes on.
pub(crate) struct Outlets {
    pub(crate) tx: EngineTx,
    pub(crate) state: watch::Sender<PlaybackState>,
    pub(crate) events: broadcast::Sender<PlayerEvent>,
    pub(crate) samples: SampleTap,
}

/// An outage in progress: from the first stall or disconnect until audio
/// plays again.
struct Recovery {
    started: Instant,
    attempts: u32,
}

struct PendingRetry {
    ticket: u64,
    token: CancellationToken,
}

pub(crate) struct StreamingCoordinator {
    state: PlaybackState,
    session: u64,
    backoff: Backoff,
    recovery: Option<Recovery>,
    retry: Option<PendingRetry>,
    next_ticket: u64,
    queue: Arc<BoundedSampleQueue>,
    worker: Option<DecodeWorker>,
    ingestion: StreamIngestionClient,
    scheduler: PlaybackScheduler,
    tx: EngineTx,
    state_tx: watch::Sender<PlaybackState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl StreamingCoordinator {
    pub(crate) fn new(
        config: &EngineConfig,
        transport: Arc<dyn StreamTransport>,
        codec: Box<dyn FrameCodec>,
        output: Box<dyn AudioOutput>,
        outlets: Outlets,
    ) -> Result<Self> {
        let endpoint = &config.endpoint;
        let queue = Arc::new(BoundedSampleQueue::new(
            endpoint.queue_capacity,
            endpoint.min_blocks_before_playback,
        ));

        let decoder = FrameDecoder::new(codec, config.min_sync_bytes);
        let worker = DecodeWorker::spawn(decoder, queue.clone(), outlets.tx.clone(), outlets.samples)
            .map_err(|e| StreamError::decoding(format!("cannot start decode thread: {e}")))?;

        let ingestion = StreamIngestionClient::new(
            endpoint.url.clone(),
            transport,
            worker.input(),
            outlets.tx.clone(),
            config.idle_timeout(),
        );

        let mut scheduler = PlaybackScheduler::new(output, outlets.tx.clone(), config.low_water_blocks);
        scheduler.set_volume(EngineConfig::clamped_volume(config.initial_volume));

        Ok(Self {
            state: PlaybackState::Idle,
            session: 0,
            backoff: Backoff::new(config.backoff.clone()),
            recovery: None,
            retry: None,
            next_ticket: 0,
            queue,
            worker: Some(worker),
            ingestion,
            scheduler,
            tx: outlets.tx,
            state_tx: outlets.state,
            events: outlets.events,
        })
    }

    pub(crate) async fn run(mut self, mut rx: EngineRx) {
        while let Some(msg) = rx.recv().await {
            if matches!(msg, EngineMsg::Command(Command::Shutdown)) {
                break;
            }
            self.handle(msg);
        }

        self.teardown();
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.shutdown()).await;
        }
        debug!("Coordinator exiting");
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Command(command) => self.on_command(command),
            EngineMsg::Ingestion { session, event } if session == self.session => {
                self.on_ingestion(event)
            }
            EngineMsg::Decoder { session, event } if session == self.session => {
                self.on_decoder(event)
            }
            EngineMsg::Ingestion { .. } | EngineMsg::Decoder { .. } => {}
            EngineMsg::Scheduler(event) => self.on_scheduler(event),
            EngineMsg::BlockCompleted { generation } => self.scheduler.on_block_completed(generation),
            EngineMsg::RetryDue { ticket } => self.on_retry_due(ticket),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Play(reason) => match self.state {
                PlaybackState::Idle | PlaybackState::Paused | PlaybackState::Error(_) => {
                    info!("Play requested ({reason})");
                    self.backoff.reset();
                    self.recovery = None;
                    self.begin_connect();
                }
                _ => debug!("Play ignored while {}", self.state),
            },
            Command::Pause => {
                if self.state.is_active() {
                    info!("Pausing: disconnecting from the live stream");
                    self.teardown();
                    self.set_state(PlaybackState::Paused);
                    self.emit(PlayerEvent::Paused);
                }
            }
            Command::Stop => {
                if self.state != PlaybackState::Idle {
                    info!("Stopping playback");
                    self.teardown();
                    self.backoff.reset();
                    self.set_state(PlaybackState::Idle);
                    self.emit(PlayerEvent::Stopped);
                }
            }
            Command::SetVolume(volume) => self.scheduler.set_volume(volume),
            Command::Shutdown => {}
        }
    }

    fn on_ingestion(&mut self, event: IngestionEvent) {
        match event {
            IngestionEvent::Connected => {
                if self.state == PlaybackState::Connecting {
                    self.set_state(PlaybackState::Buffering {
                        buffered: self.queue.count(),
                        required: self.queue.minimum(),
                    });
                }
            }
            IngestionEvent::Disconnected(reason) => {
                if self.state == PlaybackState::Connecting && self.recovery.is_none() {
                    self.fail(reason);
                } else {
                    self.on_stream_lost(reason);
                }
            }
        }
    }

    fn on_decoder(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::FormatDiscovered(format) => info!("Playing {format} audio"),
            DecoderEvent::BlockReady => match self.state {
                PlaybackState::Buffering { required, .. } => {
                    if self.queue.has_reached_minimum() {
                        self.go_playing();
                    } else {
                        self.set_state(PlaybackState::Buffering {
                            buffered: self.queue.count(),
                            required,
                        });
                    }
                }
                PlaybackState::Playing => {
                    if self.scheduler.is_hungry() {
                        self.feed_scheduler();
                    }
                }
                // The connection outlived the stall; enough audio arrived
                // before the retry fired.
                PlaybackState::Stalled if self.ingestion.is_active() => {
                    if self.queue.has_reached_minimum() {
                        self.go_playing();
                    }
                }
                _ => {}
            },
            DecoderEvent::Failed(reason) => self.on_stream_lost(reason),
        }
    }

    fn on_scheduler(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Started => self.emit(PlayerEvent::Started),
            SchedulerEvent::Stopped => debug!("Scheduler stopped"),
            SchedulerEvent::NeedsMoreBuffers => {
                self.emit(PlayerEvent::NeedsMoreBuffers);
                if self.state == PlaybackState::Playing {
                    self.feed_scheduler();
                }
            }
            SchedulerEvent::Stalled => {
                if self.scheduler.state() != SchedulerState::Stalled {
                    return;
                }
                self.emit(PlayerEvent::Stalled);
                if self.state == PlaybackState::Playing {
                    warn!("Audio output ran dry, scheduling reconnect");
                    self.begin_recovery();
                    self.schedule_retry();
                }
            }
            SchedulerEvent::RecoveredFromStall => self.emit(PlayerEvent::RecoveredFromStall),
        }
    }

    fn on_retry_due(&mut self, ticket: u64) {
        if self.retry.as_ref().map(|r| r.ticket) != Some(ticket) {
            return;
        }
        self.retry = None;
        let attempt = self.backoff.attempt();
        info!("Reconnect attempt {attempt}/{}", self.backoff.max_attempts());
        if let Some(recovery) = self.recovery.as_mut() {
            recovery.attempts = attempt;
        }
        self.emit(PlayerEvent::ReconnectAttempt { attempt });
        self.begin_connect();
    }

    /// The current session's bytes stopped flowing: the connection dropped or
    /// the decoder gave up on it.
    fn on_stream_lost(&mut self, reason: StreamError) {
        if reason.is_terminal() {
            self.fail(reason);
            return;
        }
        // Keep what is already decoded audible while reconnecting.
        if self.state == PlaybackState::Playing && !self.feed_scheduler() {
            return;
        }
        self.end_session();

        if self.retry.is_some() {
            debug!("Stream lost with a reconnect already pending: {reason}");
            return;
        }
        match self.recovery.as_ref() {
            Some(recovery) if recovery.attempts > 0 => {
                let attempt = recovery.attempts;
                warn!("Reconnect attempt {attempt} failed: {reason}");
                self.emit(PlayerEvent::ReconnectFailed { attempt, reason });
            }
            Some(_) => {}
            None => {
                warn!("Stream lost: {reason}");
                self.begin_recovery();
            }
        }
        self.schedule_retry();
    }

    fn begin_recovery(&mut self) {
        if self.recovery.is_none() {
            self.recovery = Some(Recovery {
                started: Instant::now(),
                attempts: 0,
            });
        }
    }

    fn schedule_retry(&mut self) {
        let Some(base) = self.backoff.next_delay() else {
            let attempts = self.backoff.max_attempts();
            error!("Giving up after {attempts} reconnect attempts");
            self.fail(StreamError::MaxReconnectAttemptsExceeded { attempts });
            return;
        };
        let attempt = self.backoff.attempt();
        let delay = self.backoff.jittered(base);
        info!("Reconnecting in {delay:?} (attempt {attempt}/{})", self.backoff.max_attempts());

        self.cancel_retry();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(EngineMsg::RetryDue { ticket });
                }
            }
        });
        self.retry = Some(PendingRetry { ticket, token });

        self.set_state(PlaybackState::Stalled);
        self.emit(PlayerEvent::ReconnectScheduled { attempt, delay });
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            debug!("Cancelling pending reconnect");
            retry.token.cancel();
        }
    }

    fn begin_connect(&mut self) {
        self.session += 1;
        if let Some(worker) = &self.worker {
            worker.reset(self.session);
        }
        self.queue.clear();
        self.ingestion.connect(self.session);
        self.set_state(PlaybackState::Connecting);
    }

    /// Drop the current connection and discard anything still in flight
    /// from it.
    fn end_session(&mut self) {
        self.ingestion.disconnect();
        self.session += 1;
        if let Some(worker) = &self.worker {
            worker.reset(self.session);
        }
    }

    fn go_playing(&mut self) {
        self.cancel_retry();
        self.scheduler.start();
        if !self.feed_scheduler() {
            return;
        }
        self.set_state(PlaybackState::Playing);
        if let Some(recovery) = self.recovery.take() {
            let outage = recovery.started.elapsed();
            info!(
                "Recovered after {} reconnect attempts, outage {:?}",
                recovery.attempts, outage
            );
            self.backoff.reset();
            self.emit(PlayerEvent::Recovered {
                attempts: recovery.attempts,
                outage,
            });
        }
    }

    /// Move everything queued into the output. Returns false if the output
    /// failed and the engine is now in `error`.
    fn feed_scheduler(&mut self) -> bool {
        let blocks = self.queue.drain();
        if blocks.is_empty() {
            return true;
        }
        match self.scheduler.schedule_blocks(blocks) {
            Ok(n) => {
                debug!("Scheduled {n} blocks, {} outstanding", self.scheduler.outstanding());
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn teardown(&mut self) {
        self.cancel_retry();
        self.end_session();
        self.queue.clear();
        self.scheduler.stop();
        self.recovery = None;
    }

    fn fail(&mut self, reason: StreamError) {
        error!("Playback failed: {reason}");
        self.teardown();
        self.backoff.reset();
        self.set_state(PlaybackState::Error(reason.clone()));
        self.emit(PlayerEvent::Error(reason));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        debug!("Player state changing from {} to {}", self.state, state);
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        self.emit(PlayerEvent::StateChanged(state));
    }

    fn emit(&self, event: PlayerEvent) {
        // Err only means nobody is subscribed.
        let _ = self.events.send(event);
    }
}
