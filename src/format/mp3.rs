//! MPEG audio, and the generic fallback for streams served as `mp3`.
//!
//! Bytes are spilled until the read budget is used up, then scanned for the
//! first frame that is confirmed by a second one. A Xing, Info or VBRI
//! header in that frame gives exact frame counts; otherwise the stream is
//! taken to be constant bitrate.
//!
//! When the stream starts with an ID3v2 tag, which may hold cover art of
//! any size, the budget is moved to the end of the tag plus enough audio to
//! find frames.

use std::time::Duration;

use super::{id3v2_len, FormatInfo, ID3V2_HEADER_LEN, Outcome, ParseContext, ReadBytes};
use crate::buffer::BufferState;

pub const DEFAULT_BUDGET: usize = 128 * 1024;

/// Audio read behind an ID3v2 tag.
pub const ID3_TAIL: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layer {
    I,
    II,
    III,
}

const BITRATES_V1: [[u16; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];

const BITRATES_V2: [[u16; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameHeader {
    version: Version,
    layer: Layer,

    /// In bits per second.
    bitrate: u32,
    samplerate: u32,
    padding: bool,
    mono: bool,
}

impl FrameHeader {
    fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.be_u32(0)?;
        if header & 0xffe0_0000 != 0xffe0_0000 {
            return None;
        }

        let version = match (header >> 19) & 0x03 {
            0 => Version::Mpeg25,
            2 => Version::Mpeg2,
            3 => Version::Mpeg1,
            _ => return None,
        };
        let layer = match (header >> 17) & 0x03 {
            1 => Layer::III,
            2 => Layer::II,
            3 => Layer::I,
            _ => return None,
        };

        // free format bitrates cannot be measured from headers
        let index = ((header >> 12) & 0x0f) as usize;
        if index == 0 || index == 15 {
            return None;
        }
        let kbps = match (version, layer) {
            (Version::Mpeg1, Layer::I) => BITRATES_V1[0][index],
            (Version::Mpeg1, Layer::II) => BITRATES_V1[1][index],
            (Version::Mpeg1, Layer::III) => BITRATES_V1[2][index],
            (_, Layer::I) => BITRATES_V2[0][index],
            (_, Layer::II | Layer::III) => BITRATES_V2[1][index],
        };

        let rates = match version {
            Version::Mpeg1 => [44_100, 48_000, 32_000],
            Version::Mpeg2 => [22_050, 24_000, 16_000],
            Version::Mpeg25 => [11_025, 12_000, 8_000],
        };
        let samplerate = *rates.get(((header >> 10) & 0x03) as usize)?;

        Some(Self {
            version,
            layer,
            bitrate: u32::from(kbps) * 1000,
            samplerate,
            padding: (header >> 9) & 0x01 != 0,
            mono: (header >> 6) & 0x03 == 3,
        })
    }

    fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (Layer::I, _) => 384,
            (Layer::II, _) | (Layer::III, Version::Mpeg1) => 1152,
            (Layer::III, _) => 576,
        }
    }

    fn frame_len(&self) -> usize {
        let padding = u32::from(self.padding);
        let len = match self.layer {
            Layer::I => (12 * self.bitrate / self.samplerate + padding) * 4,
            Layer::II | Layer::III => {
                self.samples_per_frame() / 8 * self.bitrate / self.samplerate + padding
            }
        };
        len as usize
    }

    /// Offset of a Xing or Info header, behind the side information.
    fn xing_offset(&self) -> usize {
        match (self.version, self.mono) {
            (Version::Mpeg1, false) => 36,
            (Version::Mpeg1, true) | (_, false) => 21,
            (_, true) => 13,
        }
    }

    fn channels(&self) -> u16 {
        if self.mono {
            1
        } else {
            2
        }
    }
}

/// Frame count and stream size from a VBR header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct VbrHeader {
    vbr: bool,
    frames: Option<u32>,
    bytes: Option<u32>,
}

fn parse_vbr_header(frame: &[u8], header: &FrameHeader) -> Option<VbrHeader> {
    let xing = header.xing_offset();
    match frame.get(xing..xing + 4)? {
        magic @ (b"Xing" | b"Info") => {
            let flags = frame.be_u32(xing + 4)?;
            let mut offset = xing + 8;
            let mut vbr = VbrHeader {
                vbr: magic == b"Xing",
                ..Default::default()
            };
            if flags & 0x01 != 0 {
                vbr.frames = frame.be_u32(offset);
                offset += 4;
            }
            if flags & 0x02 != 0 {
                vbr.bytes = frame.be_u32(offset);
            }
            return Some(vbr);
        }
        _ => {}
    }

    if frame.get(36..40)? == b"VBRI" {
        return Some(VbrHeader {
            vbr: true,
            bytes: frame.be_u32(36 + 10),
            frames: frame.be_u32(36 + 14),
        });
    }

    None
}

/// Finds the first frame followed by another valid frame.
fn find_frame(bytes: &[u8], start: usize) -> Option<(usize, FrameHeader)> {
    (start..bytes.len().saturating_sub(4)).find_map(|offset| {
        let header = FrameHeader::parse(&bytes[offset..])?;
        let next = offset + header.frame_len();
        let confirmed = FrameHeader::parse(bytes.get(next..)?)
            .is_some_and(|next| next.version == header.version && next.layer == header.layer);
        confirmed.then_some((offset, header))
    })
}

pub fn parse(state: &mut BufferState, context: &ParseContext) -> Outcome {
    if state.is_first_chunk() {
        if state.len() < ID3V2_HEADER_LEN && !state.is_eof() {
            return Outcome::NeedMore;
        }

        if let Some(tag_len) = id3v2_len(state.bytes()) {
            debug!("{} starts with a {tag_len} byte ID3v2 tag", context.url);
            state.set_budget(tag_len + ID3_TAIL);
        }
        state.parsed();
    }

    if !state.is_exhausted() && !state.is_eof() {
        return Outcome::NeedMore;
    }

    let bytes = state.bytes();
    let start = id3v2_len(bytes).unwrap_or_default();
    let Some((offset, header)) = find_frame(bytes, start) else {
        warn!("no MPEG frames found in {} bytes of {}", bytes.len(), context.url);
        return Outcome::Done(FormatInfo {
            bitrate: context.header_bitrate,
            ..Default::default()
        });
    };
    trace!("first MPEG frame at {offset}: {header:?}");

    let vbr = parse_vbr_header(&bytes[offset..], &header).unwrap_or_default();
    let frame_duration = f64::from(header.samples_per_frame()) / f64::from(header.samplerate);
    let vbr_duration = vbr
        .frames
        .filter(|frames| *frames > 0)
        .map(|frames| Duration::from_secs_f64(f64::from(frames) * frame_duration));
    let scanned_bitrate = match (vbr.bytes, vbr_duration) {
        (Some(size), Some(duration)) => super::bitrate_of(u64::from(size), duration),
        _ => None,
    }
    .unwrap_or(header.bitrate);

    // Icecast and Shoutcast know better than a sample of the stream.
    let bitrate = context.header_bitrate.unwrap_or(scanned_bitrate);
    let duration = vbr_duration.or_else(|| {
        let length = context.content_length?;
        (bitrate > 0).then(|| Duration::from_secs_f64(length as f64 * 8.0 / f64::from(bitrate)))
    });

    Outcome::Done(FormatInfo {
        samplerate: Some(header.samplerate),
        channels: Some(header.channels()),
        bitrate: Some(bitrate),
        vbr: vbr.vbr,
        duration,
        audio_offset: Some(state.base() + offset as u64),
        ..Default::default()
    })
}
