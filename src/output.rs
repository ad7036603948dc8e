//! Audio output backends.

use log::{debug, info};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::error::{Result, StreamError};
use crate::events::PcmBlock;

/// Invoked by the device once a block has been fully rendered.
pub type CompletionFn = Box<dyn Fn() + Send + 'static>;

/// A device that renders PCM blocks strictly in submission order.
pub trait AudioOutput: Send {
    /// Queue `block` behind everything already submitted. `on_complete`
    /// fires after its last sample has been consumed by the device.
    fn append(&mut self, block: Arc<PcmBlock>, on_complete: CompletionFn) -> Result<()>;

    fn play(&mut self);

    /// Stop rendering and discard everything queued. Completion callbacks
    /// of discarded blocks may or may not fire.
    fn halt(&mut self);

    fn set_volume(&mut self, volume: f32);
}

/// rodio output.
///
/// `OutputStream` is not `Send`, so it lives on its own thread for the
/// lifetime of this value and only the handle crosses over.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    volume: f32,
    _keepalive: mpsc::Sender<()>,
}

impl std::fmt::Debug for RodioOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioOutput")
            .field("sink", &self.sink.as_ref().map(|_| "Some(Sink)"))
            .field("volume", &self.volume)
            .finish()
    }
}

impl RodioOutput {
    pub fn open() -> Result<Self> {
        let (init_tx, init_rx) = mpsc::channel();
        let (keepalive, parked) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("radiostream-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = init_tx.send(Ok(handle));
                    // Returns once the owning RodioOutput is dropped.
                    let _ = parked.recv();
                    drop(stream);
                    debug!("Audio output thread exiting");
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| StreamError::AudioOutputSetupFailed(e.to_string()))?;

        let handle = init_rx
            .recv()
            .map_err(|_| {
                StreamError::AudioOutputSetupFailed("output thread exited during setup".into())
            })?
            .map_err(StreamError::AudioOutputSetupFailed)?;
        info!("Opened default audio output device");

        Ok(Self {
            handle,
            sink: None,
            volume: 1.0,
            _keepalive: keepalive,
        })
    }

    fn sink(&mut self) -> Result<&Sink> {
        if self.sink.is_none() {
            let sink = Sink::try_new(&self.handle)
                .map_err(|e| StreamError::AudioOutputSetupFailed(e.to_string()))?;
            sink.set_volume(self.volume);
            self.sink = Some(sink);
        }
        self.sink
            .as_ref()
            .ok_or_else(|| StreamError::AudioOutputSetupFailed("sink unavailable".into()))
    }
}

impl AudioOutput for RodioOutput {
    fn append(&mut self, block: Arc<PcmBlock>, on_complete: CompletionFn) -> Result<()> {
        let sink = self.sink()?;
        sink.append(SamplesBuffer::new(
            block.format.channels,
            block.format.sample_rate,
            block.samples.clone(),
        ));
        sink.append(EmptyCallback::<f32>::new(on_complete));
        Ok(())
    }

    fn play(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
        }
    }

    fn halt(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }
}
