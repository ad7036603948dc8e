//! Dedicated decode thread.
//!
//! Receives session-tagged byte chunks, runs the [`FrameDecoder`], and is the
//! only producer into the sample queue. A `Reset` marker starts a new
//! session: chunks tagged with any other session are discarded, so bytes
//! still in flight from a cancelled connection never reach the queue.

use bytes::Bytes;
use log::{debug, warn};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;

use super::FrameDecoder;
use crate::events::{DecoderEvent, EngineMsg, EngineTx, PcmBlock};
use crate::queue::BoundedSampleQueue;

pub(crate) enum DecodeMsg {
    Bytes { session: u64, bytes: Bytes },
    Reset { session: u64 },
    Shutdown,
}

pub(crate) type SampleTap = watch::Sender<Option<Arc<PcmBlock>>>;

/// Cloneable handle the ingestion task pushes bytes through.
#[derive(Clone)]
pub(crate) struct DecodeInput {
    tx: mpsc::Sender<DecodeMsg>,
}

impl DecodeInput {
    /// Returns false once the decode thread has gone away.
    pub(crate) fn push(&self, session: u64, bytes: Bytes) -> bool {
        self.tx.send(DecodeMsg::Bytes { session, bytes }).is_ok()
    }
}

pub(crate) struct DecodeWorker {
    input: DecodeInput,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub(crate) fn spawn(
        decoder: FrameDecoder,
        queue: Arc<BoundedSampleQueue>,
        events: EngineTx,
        tap: SampleTap,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("radiostream-decode".to_string())
            .spawn(move || run(decoder, rx, queue, events, tap))?;
        Ok(Self {
            input: DecodeInput { tx },
            handle: Some(handle),
        })
    }

    pub(crate) fn input(&self) -> DecodeInput {
        self.input.clone()
    }

    /// Start `session`: the thread clears the queue and resets the decoder
    /// before touching any of its bytes.
    pub(crate) fn reset(&self, session: u64) {
        if self.input.tx.send(DecodeMsg::Reset { session }).is_err() {
            warn!("Decode thread is gone, cannot reset to session {session}");
        }
    }

    /// Stop after everything already queued has been processed, and wait
    /// for the thread to exit.
    pub(crate) fn shutdown(mut self) {
        let _ = self.input.tx.send(DecodeMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Decode thread panicked");
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.input.tx.send(DecodeMsg::Shutdown);
        }
    }
}

fn run(
    mut decoder: FrameDecoder,
    rx: mpsc::Receiver<DecodeMsg>,
    queue: Arc<BoundedSampleQueue>,
    events: EngineTx,
    tap: SampleTap,
) {
    // Nothing is accepted until the first Reset names a session.
    let mut current: Option<u64> = None;
    let mut failed = false;

    while let Ok(msg) = rx.recv() {
        match msg {
            DecodeMsg::Shutdown => break,
            DecodeMsg::Reset { session } => {
                decoder.reset();
                queue.clear();
                current = Some(session);
                failed = false;
            }
            DecodeMsg::Bytes { session, bytes } => {
                if current != Some(session) || failed {
                    continue;
                }
                let mut announced = decoder.format().is_some();
                let result = decoder.decode(&bytes, |block| {
                    if !announced {
                        announced = true;
                        let _ = events.send(EngineMsg::Decoder {
                            session,
                            event: DecoderEvent::FormatDiscovered(block.format),
                        });
                    }
                    let block = Arc::new(block);
                    queue.enqueue(block.clone());
                    tap.send_replace(Some(block));
                    let _ = events.send(EngineMsg::Decoder {
                        session,
                        event: DecoderEvent::BlockReady,
                    });
                });
                if let Err(e) = result {
                    warn!("Decoding failed in session {session}: {e}");
                    failed = true;
                    let _ = events.send(EngineMsg::Decoder {
                        session,
                        event: DecoderEvent::Failed(e),
                    });
                }
            }
        }
    }
    debug!(
        "Decode thread exiting after {} frames, {} bytes skipped",
        decoder.frames_decoded(),
        decoder.bytes_skipped()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::frame::{synthetic_frame, MP3_128K_44K_STEREO};
    use crate::decoder::testing::SilenceCodec;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn frames(n: usize) -> Bytes {
        (0..n)
            .flat_map(|_| synthetic_frame(MP3_128K_44K_STEREO))
            .collect::<Vec<u8>>()
            .into()
    }

    #[test]
    fn test_stale_session_bytes_are_dropped() {
        let queue = Arc::new(BoundedSampleQueue::new(64, 1));
        let (events_tx, mut events_rx) = unbounded_channel();
        let (tap, tap_rx) = watch::channel(None);
        let decoder = FrameDecoder::new(Box::new(SilenceCodec::default()), 0);
        let worker = DecodeWorker::spawn(decoder, queue.clone(), events_tx, tap).unwrap();
        let input = worker.input();

        // Before any reset nothing is accepted.
        input.push(1, frames(3));
        worker.reset(2);
        input.push(1, frames(3));
        input.push(2, frames(4));
        worker.shutdown();

        assert_eq!(queue.count(), 4);
        assert!(tap_rx.borrow().is_some());

        let mut ready = 0;
        let mut formats = 0;
        while let Ok(msg) = events_rx.try_recv() {
            match msg {
                EngineMsg::Decoder { session, event } => {
                    assert_eq!(session, 2);
                    match event {
                        DecoderEvent::BlockReady => ready += 1,
                        DecoderEvent::FormatDiscovered(_) => {
                            assert_eq!(ready, 0, "format announced before first block");
                            formats += 1;
                        }
                        DecoderEvent::Failed(e) => panic!("unexpected failure {e}"),
                    }
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(ready, 4);
        assert_eq!(formats, 1);
    }

    #[test]
    fn test_reset_clears_queue() {
        let queue = Arc::new(BoundedSampleQueue::new(64, 1));
        let (events_tx, _events_rx) = unbounded_channel();
        let (tap, _tap_rx) = watch::channel(None);
        let decoder = FrameDecoder::new(Box::new(SilenceCodec::default()), 0);
        let worker = DecodeWorker::spawn(decoder, queue.clone(), events_tx, tap).unwrap();

        worker.reset(1);
        worker.input().push(1, frames(5));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while queue.count() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.count(), 5);

        worker.reset(2);
        worker.shutdown();
        assert!(queue.is_empty());
    }
}
