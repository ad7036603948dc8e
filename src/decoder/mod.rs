//! Incremental frame decoder for continuous MPEG audio byte streams.
//!
//! Bytes arrive in arbitrary chunks. The decoder accumulates them, finds
//! frame boundaries itself, skips tags and junk, and hands one complete frame
//! at a time to a [`FrameCodec`] backend. Emitted blocks do not depend on
//! where the chunk boundaries fell.

pub mod frame;
pub mod symphonia;
pub(crate) mod worker;

use log::{debug, info, warn};

use crate::error::{FrameError, StreamError};
use crate::events::{AudioFormat, PcmBlock};
use frame::{probe_tag, FrameHeader, TagProbe, HEADER_LEN};

pub use self::symphonia::SymphoniaFrameCodec;

/// Consecutive undecodable frames tolerated before the stream is abandoned.
pub const MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 8;

/// Decoder backend turning one compressed frame into PCM.
pub trait FrameCodec: Send {
    fn name(&self) -> &'static str;

    fn decode_frame(&mut self, header: &FrameHeader, frame: &[u8]) -> Result<PcmBlock, FrameError>;

    /// Drop any inter-frame state (bit reservoir, timestamps).
    fn reset(&mut self);
}

enum Candidate {
    Accept(usize),
    Reject,
    Wait,
    FormatChange(FrameHeader),
}

pub struct FrameDecoder {
    codec: Box<dyn FrameCodec>,
    buffer: Vec<u8>,
    /// Bytes of an oversized tag still to be discarded as they arrive.
    skip_remaining: usize,
    min_sync_bytes: usize,
    /// Bytes seen since the last reset, skipped ones included.
    received: usize,
    format: Option<AudioFormat>,
    reference: Option<FrameHeader>,
    consecutive_errors: u32,
    frames_decoded: u64,
    bytes_skipped: u64,
}

impl FrameDecoder {
    pub fn new(codec: Box<dyn FrameCodec>, min_sync_bytes: usize) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(min_sync_bytes.max(4096)),
            skip_remaining: 0,
            min_sync_bytes,
            received: 0,
            format: None,
            reference: None,
            consecutive_errors: 0,
            frames_decoded: 0,
            bytes_skipped: 0,
        }
    }

    /// Format latched from the first decoded frame of the current episode.
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped
    }

    /// Clear everything so no partial frame leaks into the next episode.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skip_remaining = 0;
        self.received = 0;
        self.format = None;
        self.reference = None;
        self.consecutive_errors = 0;
        self.codec.reset();
    }

    /// Append `bytes` and emit a block for every complete frame now available.
    pub fn decode<F>(&mut self, bytes: &[u8], mut emit: F) -> Result<(), StreamError>
    where
        F: FnMut(PcmBlock),
    {
        self.received = self.received.saturating_add(bytes.len());
        let mut input = bytes;
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(input.len());
            input = &input[n..];
            self.skip_remaining -= n;
            self.bytes_skipped += n as u64;
        }
        self.buffer.extend_from_slice(input);

        if self.format.is_none() && self.received < self.min_sync_bytes {
            return Ok(());
        }

        let buffer = std::mem::take(&mut self.buffer);
        let (consumed, result) = self.scan(&buffer, &mut emit);
        self.buffer = buffer;
        self.buffer.drain(..consumed);
        result
    }

    fn scan<F>(&mut self, buffer: &[u8], emit: &mut F) -> (usize, Result<(), StreamError>)
    where
        F: FnMut(PcmBlock),
    {
        let mut pos = 0;
        while pos < buffer.len() {
            let rest = &buffer[pos..];

            if rest[0] != 0xFF {
                match probe_tag(rest) {
                    TagProbe::NeedMore => break,
                    TagProbe::Tag(len) if len <= rest.len() => {
                        debug!("Skipping {len} byte tag");
                        pos += len;
                        self.bytes_skipped += len as u64;
                    }
                    TagProbe::Tag(len) => {
                        debug!("Skipping {len} byte tag across chunks");
                        self.skip_remaining = len - rest.len();
                        self.bytes_skipped += rest.len() as u64;
                        pos = buffer.len();
                    }
                    TagProbe::None => {
                        let n = rest[1..]
                            .iter()
                            .position(|b| matches!(b, 0xFF | b'I' | b'T' | b'A'))
                            .map_or(rest.len(), |p| p + 1);
                        pos += n;
                        self.bytes_skipped += n as u64;
                    }
                }
                continue;
            }

            if rest.len() < HEADER_LEN {
                break;
            }
            let Some(header) = FrameHeader::parse(rest) else {
                pos += 1;
                self.bytes_skipped += 1;
                continue;
            };

            match self.check_candidate(&header, rest) {
                Candidate::Wait => break,
                Candidate::Reject => {
                    pos += 1;
                    self.bytes_skipped += 1;
                }
                Candidate::FormatChange(next) => {
                    let latched = self.format.map(|f| f.to_string()).unwrap_or_default();
                    return (
                        pos,
                        Err(StreamError::decoding(format!(
                            "stream format changed from {latched} to {} Hz x{}",
                            next.sample_rate, next.channels
                        ))),
                    );
                }
                Candidate::Accept(len) => {
                    let frame = &rest[..len];
                    pos += len;
                    if let Err(e) = self.decode_frame(&header, frame, emit) {
                        return (pos, Err(e));
                    }
                }
            }
        }
        (pos, Ok(()))
    }

    fn check_candidate(&self, header: &FrameHeader, rest: &[u8]) -> Candidate {
        let len = header.frame_len();
        if len <= HEADER_LEN {
            return Candidate::Reject;
        }
        match &self.reference {
            Some(reference) if reference.same_stream(header) => {
                if rest.len() < len {
                    Candidate::Wait
                } else {
                    Candidate::Accept(len)
                }
            }
            reference => {
                // Unconfirmed or foreign header: only a second matching
                // header right after it makes it a real frame.
                if rest.len() < len + HEADER_LEN {
                    return Candidate::Wait;
                }
                match FrameHeader::parse(&rest[len..]) {
                    Some(next) if next.same_stream(header) => {
                        if reference.is_some() {
                            Candidate::FormatChange(*header)
                        } else {
                            Candidate::Accept(len)
                        }
                    }
                    _ => Candidate::Reject,
                }
            }
        }
    }

    fn decode_frame<F>(&mut self, header: &FrameHeader, frame: &[u8], emit: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(PcmBlock),
    {
        match self.codec.decode_frame(header, frame) {
            Ok(block) => {
                match self.format {
                    None => {
                        info!("Stream format discovered: {} via {}", block.format, self.codec.name());
                        self.format = Some(block.format);
                        self.reference = Some(*header);
                    }
                    Some(format) if format != block.format => {
                        return Err(StreamError::decoding(format!(
                            "decoded format {} does not match stream format {format}",
                            block.format
                        )));
                    }
                    Some(_) => {}
                }
                self.consecutive_errors = 0;
                self.frames_decoded += 1;
                emit(block);
                Ok(())
            }
            Err(FrameError::Corrupt(msg)) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > MAX_CONSECUTIVE_FRAME_ERRORS {
                    return Err(StreamError::decoding(format!(
                        "{} consecutive undecodable frames, last: {msg}",
                        self.consecutive_errors
                    )));
                }
                warn!("Dropping corrupt frame: {msg}");
                Ok(())
            }
            Err(FrameError::Fatal(msg)) => Err(StreamError::decoding(msg)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::frame::{synthetic_frame, MP3_128K_44K_STEREO, MP3_64K_48K_MONO};
    use super::testing::SilenceCodec;
    use super::*;

    fn decoder(min_sync: usize) -> FrameDecoder {
        FrameDecoder::new(Box::new(SilenceCodec::default()), min_sync)
    }

    fn stream(frames: usize) -> Vec<u8> {
        (0..frames).flat_map(|_| synthetic_frame(MP3_128K_44K_STEREO)).collect()
    }

    fn feed(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> Result<Vec<PcmBlock>, StreamError> {
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.decode(chunk, |b| out.push(b))?;
        }
        Ok(out)
    }

    #[test]
    fn test_decodes_known_frame_count() {
        let bytes = stream(50);
        let mut dec = decoder(0);
        let blocks = feed(&mut dec, &[&bytes]).unwrap();
        assert_eq!(blocks.len(), 50);
        for block in &blocks {
            assert_eq!(block.format, AudioFormat { sample_rate: 44_100, channels: 2 });
            assert_eq!(block.frames(), 1152);
        }
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let bytes = stream(80);
        let whole = feed(&mut decoder(16 * 1024), &[&bytes]).unwrap();

        for size in [1usize, 3, 7, 100, 417, 418, 1000, 4096] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            let split = feed(&mut decoder(16 * 1024), &chunks).unwrap();
            assert_eq!(split, whole, "chunk size {size}");
        }
        assert_eq!(whole.len(), 80);
    }

    #[test]
    fn test_waits_for_sync_threshold() {
        let bytes = stream(10);
        let mut dec = decoder(16 * 1024);
        let blocks = feed(&mut dec, &[&bytes]).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(dec.buffered_len(), bytes.len());
    }

    #[test]
    fn test_junk_prefix_then_frames() {
        let mut bytes: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
        // Plant a few false syncs in the junk.
        bytes[100] = 0xFF;
        bytes[101] = 0xFB;
        bytes[102] = 0x90;
        bytes[103] = 0x40;
        bytes[5000] = 0xFF;
        let junk_len = bytes.len();
        bytes.extend(stream(40));

        let mut dec = decoder(16 * 1024);
        let mut blocks = Vec::new();
        let mut peak = 0;
        for chunk in bytes.chunks(512) {
            dec.decode(chunk, |b| blocks.push(b)).unwrap();
            peak = peak.max(dec.buffered_len());
        }
        assert_eq!(blocks.len(), 40);
        assert!(dec.bytes_skipped() >= junk_len as u64);
        // Junk is discarded as soon as it is scanned.
        assert!(peak <= 16 * 1024 + 512);
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn test_skips_id3v2_spanning_chunks() {
        let mut bytes = b"ID3\x04\x00\x00".to_vec();
        // 3000-byte tag body
        bytes.extend_from_slice(&[0x00, 0x00, 0x17, 0x38]);
        bytes.extend(std::iter::repeat(0xFFu8).take(3000));
        bytes.extend(stream(5));

        let mut dec = decoder(0);
        let chunks: Vec<&[u8]> = bytes.chunks(256).collect();
        let blocks = feed(&mut dec, &chunks).unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(dec.bytes_skipped(), 3010);
    }

    #[test]
    fn test_long_tag_counts_toward_sync_threshold() {
        let mut bytes = b"ID3\x04\x00\x00".to_vec();
        // 20000-byte tag body, longer than the sync threshold on its own
        bytes.extend_from_slice(&[0x00, 0x01, 0x1C, 0x20]);
        bytes.extend(std::iter::repeat(0u8).take(20_000));
        bytes.extend(stream(10));

        let whole = feed(&mut decoder(16 * 1024), &[&bytes]).unwrap();
        assert_eq!(whole.len(), 10);

        for size in [256usize, 4096] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            let mut dec = decoder(16 * 1024);
            let split = feed(&mut dec, &chunks).unwrap();
            assert_eq!(split, whole, "chunk size {size}");
            assert_eq!(dec.bytes_skipped(), 20_010);
        }
    }

    #[test]
    fn test_format_change_is_error() {
        let mut bytes = stream(5);
        for _ in 0..3 {
            bytes.extend(synthetic_frame(MP3_64K_48K_MONO));
        }
        let mut dec = decoder(0);
        let mut blocks = Vec::new();
        let err = dec.decode(&bytes, |b| blocks.push(b)).unwrap_err();
        assert!(matches!(err, StreamError::DecodingFailed(_)));
        assert_eq!(blocks.len(), 5);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let bytes = stream(4);
        let mut dec = decoder(0);
        let blocks = feed(&mut dec, &[&bytes[..1000]]).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(dec.buffered_len() > 0);

        dec.reset();
        assert_eq!(dec.buffered_len(), 0);
        assert_eq!(dec.format(), None);

        let blocks = feed(&mut dec, &[&bytes]).unwrap();
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn test_persistent_codec_failure_is_error() {
        let codec = SilenceCodec {
            fail_all: true,
            ..Default::default()
        };
        let mut dec = FrameDecoder::new(Box::new(codec), 0);
        let bytes = stream(20);
        let err = feed(&mut dec, &[&bytes]).unwrap_err();
        assert!(matches!(err, StreamError::DecodingFailed(_)));
    }
}
