//! Hands PCM blocks to the audio output in order and tracks how many are
//! still waiting to be rendered.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::Result;
use crate::events::{EngineMsg, EngineTx, PcmBlock, SchedulerEvent};
use crate::output::AudioOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Playing,
    /// Output ran dry while playback is still intended.
    Stalled,
}

pub(crate) struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    events: EngineTx,
    state: SchedulerState,
    outstanding: usize,
    low_water: usize,
    /// Bumped on every stop so completions of discarded blocks are ignored.
    generation: u64,
}

impl PlaybackScheduler {
    pub(crate) fn new(output: Box<dyn AudioOutput>, events: EngineTx, low_water: usize) -> Self {
        Self {
            output,
            events,
            state: SchedulerState::Stopped,
            outstanding: 0,
            low_water,
            generation: 0,
        }
    }

    pub(crate) fn state(&self) -> SchedulerState {
        self.state
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Room for more audio before the low-water mark is reached.
    pub(crate) fn is_hungry(&self) -> bool {
        self.state != SchedulerState::Stopped && self.outstanding < self.low_water
    }

    pub(crate) fn start(&mut self) {
        if self.state != SchedulerState::Stopped {
            return;
        }
        self.output.play();
        self.state = SchedulerState::Playing;
        info!("Playback started");
        self.emit(SchedulerEvent::Started);
    }

    pub(crate) fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        self.output.halt();
        self.outstanding = 0;
        self.generation += 1;
        self.state = SchedulerState::Stopped;
        info!("Playback stopped");
        self.emit(SchedulerEvent::Stopped);
    }

    pub(crate) fn set_volume(&mut self, volume: f32) {
        self.output.set_volume(volume);
    }

    pub(crate) fn schedule_block(&mut self, block: Arc<PcmBlock>) -> Result<()> {
        if self.state == SchedulerState::Stopped {
            warn!("Dropping block scheduled while stopped");
            return Ok(());
        }
        let generation = self.generation;
        let events = self.events.clone();
        self.output.append(
            block,
            Box::new(move || {
                let _ = events.send(EngineMsg::BlockCompleted { generation });
            }),
        )?;
        self.outstanding += 1;

        if self.state == SchedulerState::Stalled {
            self.state = SchedulerState::Playing;
            info!("Playback recovered from stall");
            self.emit(SchedulerEvent::RecoveredFromStall);
        }
        Ok(())
    }

    pub(crate) fn schedule_blocks(
        &mut self,
        blocks: impl IntoIterator<Item = Arc<PcmBlock>>,
    ) -> Result<usize> {
        let mut scheduled = 0;
        for block in blocks {
            self.schedule_block(block)?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Account for one block the output finished rendering.
    pub(crate) fn on_block_completed(&mut self, generation: u64) {
        if generation != self.generation || self.state == SchedulerState::Stopped {
            return;
        }
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.outstanding == 0 {
            if self.state == SchedulerState::Playing {
                self.state = SchedulerState::Stalled;
                warn!("Playback stalled: output ran dry");
                self.emit(SchedulerEvent::Stalled);
            }
        } else if self.outstanding < self.low_water && self.state == SchedulerState::Playing {
            debug!("Outstanding blocks down to {}", self.outstanding);
            self.emit(SchedulerEvent::NeedsMoreBuffers);
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(EngineMsg::Scheduler(event));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::error::{Result, StreamError};
    use crate::events::PcmBlock;
    use crate::output::{AudioOutput, CompletionFn};

    #[derive(Default)]
    pub struct Recorded {
        pub appended: Vec<Arc<PcmBlock>>,
        pub pending: VecDeque<CompletionFn>,
        pub playing: bool,
        pub halts: usize,
        pub volume: Option<f32>,
    }

    /// Output that renders nothing; tests decide when blocks "finish".
    #[derive(Clone, Default)]
    pub struct RecordingOutput {
        pub recorded: Arc<Mutex<Recorded>>,
        pub fail_append: bool,
    }

    impl RecordingOutput {
        pub fn appended(&self) -> usize {
            self.recorded.lock().unwrap().appended.len()
        }

        /// Finish the oldest queued block. Returns false when none is queued.
        pub fn complete_one(&self) -> bool {
            let callback = self.recorded.lock().unwrap().pending.pop_front();
            match callback {
                Some(callback) => {
                    callback();
                    true
                }
                None => false,
            }
        }

        pub fn complete_all(&self) -> usize {
            let mut n = 0;
            while self.complete_one() {
                n += 1;
            }
            n
        }
    }

    impl AudioOutput for RecordingOutput {
        fn append(&mut self, block: Arc<PcmBlock>, on_complete: CompletionFn) -> Result<()> {
            if self.fail_append {
                return Err(StreamError::AudioOutputSetupFailed("no device".into()));
            }
            let mut recorded = self.recorded.lock().unwrap();
            recorded.appended.push(block);
            recorded.pending.push_back(on_complete);
            Ok(())
        }

        fn play(&mut self) {
            self.recorded.lock().unwrap().playing = true;
        }

        fn halt(&mut self) {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.playing = false;
            recorded.halts += 1;
            recorded.pending.clear();
        }

        fn set_volume(&mut self, volume: f32) {
            self.recorded.lock().unwrap().volume = Some(volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingOutput;
    use super::*;
    use crate::error::StreamError;
    use crate::events::{AudioFormat, EngineRx};
    use tokio::sync::mpsc::unbounded_channel;

    fn block() -> Arc<PcmBlock> {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        Arc::new(PcmBlock::new(format, vec![0.0; 2304]))
    }

    fn scheduler(low_water: usize) -> (PlaybackScheduler, RecordingOutput, EngineRx) {
        let (tx, rx) = unbounded_channel();
        let output = RecordingOutput::default();
        (PlaybackScheduler::new(Box::new(output.clone()), tx, low_water), output, rx)
    }

    /// Feed every pending completion notice back into the scheduler and
    /// collect the scheduler events it produced.
    fn pump(scheduler: &mut PlaybackScheduler, rx: &mut EngineRx) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                EngineMsg::BlockCompleted { generation } => scheduler.on_block_completed(generation),
                EngineMsg::Scheduler(event) => events.push(event),
                other => panic!("unexpected message {other:?}"),
            }
        }
        events
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (mut s, output, mut rx) = scheduler(3);
        s.start();
        s.start();
        assert_eq!(s.state(), SchedulerState::Playing);
        s.stop();
        s.stop();
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert_eq!(pump(&mut s, &mut rx), vec![SchedulerEvent::Started, SchedulerEvent::Stopped]);
        assert_eq!(output.recorded.lock().unwrap().halts, 1);
    }

    #[test]
    fn test_blocks_go_out_in_order() {
        let (mut s, output, _rx) = scheduler(3);
        s.start();
        let blocks: Vec<_> = (0..4).map(|_| block()).collect();
        assert_eq!(s.schedule_blocks(blocks.clone()).unwrap(), 4);
        assert_eq!(s.outstanding(), 4);
        let recorded = output.recorded.lock().unwrap();
        for (sent, got) in blocks.iter().zip(&recorded.appended) {
            assert!(Arc::ptr_eq(sent, got));
        }
    }

    #[test]
    fn test_needs_more_below_low_water() {
        let (mut s, output, mut rx) = scheduler(3);
        s.start();
        s.schedule_blocks((0..4).map(|_| block())).unwrap();
        pump(&mut s, &mut rx);

        output.complete_one();
        assert!(pump(&mut s, &mut rx).is_empty());
        assert_eq!(s.outstanding(), 3);
        assert!(!s.is_hungry());

        output.complete_one();
        assert_eq!(pump(&mut s, &mut rx), vec![SchedulerEvent::NeedsMoreBuffers]);
        assert!(s.is_hungry());
    }

    #[test]
    fn test_stall_reported_once_before_recovery() {
        let (mut s, output, mut rx) = scheduler(1);
        s.start();
        s.schedule_blocks((0..2).map(|_| block())).unwrap();
        pump(&mut s, &mut rx);

        output.complete_all();
        let events = pump(&mut s, &mut rx);
        assert_eq!(events, vec![SchedulerEvent::Stalled]);
        assert_eq!(s.state(), SchedulerState::Stalled);

        // Late duplicate completion does not re-report the stall.
        s.on_block_completed(0);
        assert!(pump(&mut s, &mut rx).is_empty());

        s.schedule_block(block()).unwrap();
        assert_eq!(pump(&mut s, &mut rx), vec![SchedulerEvent::RecoveredFromStall]);
        assert_eq!(s.state(), SchedulerState::Playing);
    }

    #[test]
    fn test_completions_from_before_stop_are_ignored() {
        let (mut s, output, mut rx) = scheduler(3);
        s.start();
        s.schedule_blocks((0..3).map(|_| block())).unwrap();
        let stale: Vec<_> = output.recorded.lock().unwrap().pending.drain(..).collect();
        s.stop();
        s.start();
        s.schedule_block(block()).unwrap();
        pump(&mut s, &mut rx);

        for callback in stale {
            callback();
        }
        assert!(pump(&mut s, &mut rx).is_empty());
        assert_eq!(s.outstanding(), 1);
    }

    #[test]
    fn test_blocks_while_stopped_are_dropped() {
        let (mut s, output, _rx) = scheduler(3);
        s.schedule_block(block()).unwrap();
        assert_eq!(output.appended(), 0);
        assert_eq!(s.outstanding(), 0);
    }

    #[test]
    fn test_output_failure_propagates() {
        let (tx, _rx) = unbounded_channel();
        let output = RecordingOutput {
            fail_append: true,
            ..Default::default()
        };
        let mut s = PlaybackScheduler::new(Box::new(output), tx, 3);
        s.start();
        assert!(matches!(
            s.schedule_block(block()),
            Err(StreamError::AudioOutputSetupFailed(_))
        ));
        assert_eq!(s.outstanding(), 0);
    }
}
