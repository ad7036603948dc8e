//! Symphonia-backed [`FrameCodec`].
//!
//! Framing is done by [`FrameDecoder`](super::FrameDecoder); this only feeds
//! single frames to a symphonia MPEG audio decoder as packets and
//! interleaves the result to f32.

use log::{debug, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    CodecParameters, CodecType, Decoder, DecoderOptions, CODEC_TYPE_MP1, CODEC_TYPE_MP2,
    CODEC_TYPE_MP3,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use symphonia::default::get_codecs;

use super::frame::{FrameHeader, Layer};
use super::FrameCodec;
use crate::error::FrameError;
use crate::events::{AudioFormat, PcmBlock};

#[derive(Default)]
pub struct SymphoniaFrameCodec {
    decoder: Option<(Layer, Box<dyn Decoder>)>,
    sample_buf: Option<SampleBuffer<f32>>,
    reset_pending: bool,
    ts: u64,
}

impl SymphoniaFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn codec_type(layer: Layer) -> CodecType {
        match layer {
            Layer::Layer1 => CODEC_TYPE_MP1,
            Layer::Layer2 => CODEC_TYPE_MP2,
            Layer::Layer3 => CODEC_TYPE_MP3,
        }
    }

    fn ensure_decoder(&mut self, header: &FrameHeader) -> Result<(), FrameError> {
        let current = matches!(&self.decoder, Some((layer, _)) if *layer == header.layer);
        if current && !self.reset_pending {
            return Ok(());
        }
        let mut params = CodecParameters::new();
        params
            .for_codec(Self::codec_type(header.layer))
            .with_sample_rate(header.sample_rate);
        let decoder = get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| FrameError::Fatal(format!("no decoder for {:?}: {e}", header.layer)))?;
        debug!("Created symphonia decoder for {:?} at {} Hz", header.layer, header.sample_rate);
        self.decoder = Some((header.layer, decoder));
        self.reset_pending = false;
        Ok(())
    }
}

impl FrameCodec for SymphoniaFrameCodec {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn decode_frame(&mut self, header: &FrameHeader, frame: &[u8]) -> Result<PcmBlock, FrameError> {
        self.ensure_decoder(header)?;
        let Some((_, decoder)) = self.decoder.as_mut() else {
            return Err(FrameError::Fatal("decoder unavailable".into()));
        };

        let duration = header.samples_per_frame() as u64;
        let packet = Packet::new_from_slice(0, self.ts, duration, frame);
        self.ts += duration;

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => return Err(FrameError::Corrupt(msg.to_string())),
            Err(SymphoniaError::IoError(e)) => return Err(FrameError::Corrupt(e.to_string())),
            Err(SymphoniaError::ResetRequired) => {
                warn!("Symphonia decoder reset required, recreating");
                self.reset_pending = true;
                return Err(FrameError::Corrupt("decoder reset".into()));
            }
            Err(e) => return Err(FrameError::Fatal(e.to_string())),
        };

        let spec = *decoded.spec();
        let format = AudioFormat {
            sample_rate: spec.rate,
            channels: spec.channels.count() as u16,
        };

        let frames = decoded.capacity();
        let needed = frames * spec.channels.count();
        if self.sample_buf.as_ref().map_or(false, |b| b.capacity() < needed) {
            self.sample_buf = None;
        }
        let buf = self
            .sample_buf
            .get_or_insert_with(|| SampleBuffer::<f32>::new(frames as u64, spec));
        buf.copy_interleaved_ref(decoded);

        Ok(PcmBlock::new(format, buf.samples().to_vec()))
    }

    fn reset(&mut self) {
        self.decoder = None;
        self.reset_pending = false;
        self.ts = 0;
    }
}
