//! MPEG audio frame header parsing and non-audio tag detection.

/// Bytes needed to read a frame header.
pub const HEADER_LEN: usize = 4;
const ID3V2_HEADER_LEN: usize = 10;
const ID3V1_LEN: usize = 128;
const APE_FOOTER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Layer1,
    Layer2,
    Layer3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: Layer,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u16,
}

const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

impl FrameHeader {
    /// Parse the four header bytes at the start of `bytes`.
    ///
    /// Returns `None` for anything that is not a usable header: missing sync,
    /// reserved version/layer/sample-rate, free-format or bad bitrate, and
    /// reserved emphasis.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let (b1, b2, b3) = (bytes[1], bytes[2], bytes[3]);
        if bytes[0] != 0xFF || b1 & 0xE0 != 0xE0 {
            return None;
        }

        let version = match (b1 >> 3) & 0b11 {
            0b00 => MpegVersion::Mpeg25,
            0b10 => MpegVersion::Mpeg2,
            0b11 => MpegVersion::Mpeg1,
            _ => return None,
        };
        let layer = match (b1 >> 1) & 0b11 {
            0b01 => Layer::Layer3,
            0b10 => Layer::Layer2,
            0b11 => Layer::Layer1,
            _ => return None,
        };

        let bitrate_index = (b2 >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 0x0F {
            return None;
        }
        let table = match (version, layer) {
            (MpegVersion::Mpeg1, Layer::Layer1) => &BITRATES_V1_L1,
            (MpegVersion::Mpeg1, Layer::Layer2) => &BITRATES_V1_L2,
            (MpegVersion::Mpeg1, Layer::Layer3) => &BITRATES_V1_L3,
            (_, Layer::Layer1) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };
        let bitrate_kbps = table[bitrate_index];

        let base_rate = match (b2 >> 2) & 0b11 {
            0 => 44_100,
            1 => 48_000,
            2 => 32_000,
            _ => return None,
        };
        let sample_rate = match version {
            MpegVersion::Mpeg1 => base_rate,
            MpegVersion::Mpeg2 => base_rate / 2,
            MpegVersion::Mpeg25 => base_rate / 4,
        };

        if b3 & 0b11 == 0b10 {
            return None;
        }

        Some(Self {
            version,
            layer,
            bitrate_kbps,
            sample_rate,
            padding: (b2 >> 1) & 1 == 1,
            channels: if b3 >> 6 == 0b11 { 1 } else { 2 },
        })
    }

    /// Total frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate_kbps as usize * 1000;
        let rate = self.sample_rate as usize;
        let pad = self.padding as usize;
        match (self.layer, self.version) {
            (Layer::Layer1, _) => (12 * bitrate / rate + pad) * 4,
            (Layer::Layer3, MpegVersion::Mpeg2 | MpegVersion::Mpeg25) => 72 * bitrate / rate + pad,
            _ => 144 * bitrate / rate + pad,
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        match (self.layer, self.version) {
            (Layer::Layer1, _) => 384,
            (Layer::Layer3, MpegVersion::Mpeg2 | MpegVersion::Mpeg25) => 576,
            _ => 1152,
        }
    }

    /// Frames of one stream share version, layer, sample rate and channel count.
    pub fn same_stream(&self, other: &FrameHeader) -> bool {
        self.version == other.version
            && self.layer == other.layer
            && self.sample_rate == other.sample_rate
            && self.channels == other.channels
    }
}

/// What sits at the front of the byte buffer, when it is not audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagProbe {
    /// Not a recognised tag.
    None,
    /// Too few bytes to tell yet.
    NeedMore,
    /// A tag of this many bytes (header included) starts here.
    Tag(usize),
}

/// Detect ID3v2, ID3v1 and APE tags at the start of `bytes`.
pub fn probe_tag(bytes: &[u8]) -> TagProbe {
    if bytes.len() < 3 {
        return if could_start_tag(bytes) {
            TagProbe::NeedMore
        } else {
            TagProbe::None
        };
    }
    match &bytes[..3] {
        b"ID3" => {
            if bytes.len() < ID3V2_HEADER_LEN {
                return TagProbe::NeedMore;
            }
            let size = &bytes[6..10];
            if size.iter().any(|b| b & 0x80 != 0) {
                return TagProbe::None;
            }
            let body = size
                .iter()
                .fold(0usize, |acc, b| (acc << 7) | (*b as usize));
            let footer = if bytes[5] & 0x10 != 0 { ID3V2_HEADER_LEN } else { 0 };
            TagProbe::Tag(ID3V2_HEADER_LEN + body + footer)
        }
        b"TAG" => TagProbe::Tag(ID3V1_LEN),
        b"APE" => {
            if bytes.len() < 16 {
                return TagProbe::NeedMore;
            }
            if &bytes[..8] != b"APETAGEX" {
                return TagProbe::None;
            }
            // Size field counts items plus footer, excluding the header.
            let size = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
            TagProbe::Tag(APE_FOOTER_LEN + size)
        }
        _ => TagProbe::None,
    }
}

fn could_start_tag(bytes: &[u8]) -> bool {
    [&b"ID3"[..], &b"TAG"[..], &b"APE"[..]]
        .iter()
        .any(|magic| magic.starts_with(bytes))
}

/// Build a silent-payload frame for the given header bytes. Test helper.
#[cfg(test)]
pub(crate) fn synthetic_frame(header: [u8; 4]) -> Vec<u8> {
    let parsed = FrameHeader::parse(&header).expect("valid synthetic header");
    let mut frame = vec![0u8; parsed.frame_len()];
    frame[..4].copy_from_slice(&header);
    frame
}

/// MPEG-1 Layer III, 128 kbps, 44.1 kHz, joint stereo, no padding: 417 bytes.
#[cfg(test)]
pub(crate) const MP3_128K_44K_STEREO: [u8; 4] = [0xFF, 0xFB, 0x90, 0x40];
/// MPEG-1 Layer III, 64 kbps, 48 kHz, mono, no padding: 192 bytes.
#[cfg(test)]
pub(crate) const MP3_64K_48K_MONO: [u8; 4] = [0xFF, 0xFB, 0x54, 0xC0];
