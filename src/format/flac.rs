//! Native FLAC.
//!
//! Metadata blocks are read until the last one, which gives the offset of
//! the first audio frame and the header block a decoder needs before it.
//! Streams whose header can't be found are still played, with a
//! conservative bitrate estimate and an initial block the decoder has to
//! derive itself.

use std::time::Duration;

use bytes::Bytes;

use super::{bitrate_of, estimate_bitrate, id3v2_len, FormatInfo, Outcome, ParseContext, ReadBytes};
use crate::{buffer::BufferState, store::InitialBlock};

const MARKER: &[u8; 4] = b"fLaC";
const BLOCK_HEADER_LEN: usize = 4;
const STREAMINFO: u8 = 0;
const STREAMINFO_LEN: usize = 34;

/// Decode parameters of a STREAMINFO metadata block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StreamInfo {
    pub samplerate: u32,
    pub channels: u16,
    pub samplesize: u16,
    pub total_samples: u64,
}

impl StreamInfo {
    /// Decodes the block data, without its block header.
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let packed = data.get(10..18)?;
        let samplerate = (u32::from(packed[0]) << 12)
            | (u32::from(packed[1]) << 4)
            | u32::from(packed[2] >> 4);
        let channels = u16::from((packed[2] >> 1) & 0x07) + 1;
        let samplesize = u16::from(((packed[2] & 0x01) << 4) | (packed[3] >> 4)) + 1;
        let total_samples = (u64::from(packed[3] & 0x0f) << 32) | u64::from(data.be_u32(14)?);

        Some(Self {
            samplerate,
            channels,
            samplesize,
            total_samples,
        })
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        if self.samplerate == 0 || self.total_samples == 0 {
            return None;
        }

        Some(Duration::from_secs_f64(
            self.total_samples as f64 / f64::from(self.samplerate),
        ))
    }
}

enum Scan {
    Incomplete,
    NotFlac,
    Header {
        start: usize,
        audio_offset: usize,
        info: StreamInfo,
    },
}

fn scan(bytes: &[u8]) -> Scan {
    let start = id3v2_len(bytes).unwrap_or_default();
    let Some(marker) = bytes.get(start..start + MARKER.len()) else {
        return Scan::Incomplete;
    };
    if marker != MARKER {
        return Scan::NotFlac;
    }

    let mut offset = start + MARKER.len();
    let mut info = None;
    loop {
        let Some(header) = bytes.be_u32(offset) else {
            return Scan::Incomplete;
        };
        let last = header & 0x8000_0000 != 0;
        let kind = ((header >> 24) & 0x7f) as u8;
        let len = (header & 0x00ff_ffff) as usize;

        let data = offset + BLOCK_HEADER_LEN;
        if kind == STREAMINFO {
            if len < STREAMINFO_LEN {
                return Scan::NotFlac;
            }
            match bytes.get(data..data + STREAMINFO_LEN) {
                Some(block) => info = StreamInfo::parse(block),
                None => return Scan::Incomplete,
            }
        }

        offset = data + len;
        if last {
            break;
        }
    }

    if offset > bytes.len() {
        // the last block itself is still being read
        return Scan::Incomplete;
    }

    match info {
        Some(info) => Scan::Header {
            start,
            audio_offset: offset,
            info,
        },
        None => Scan::NotFlac,
    }
}

/// CD quality, assumed when the header is unknown.
fn fallback(context: &ParseContext) -> Outcome {
    warn!("no FLAC header found in {}, estimating bitrate", context.url);

    Outcome::Done(FormatInfo {
        bitrate: Some(estimate_bitrate(44_100, 16, 2)),
        lossless: true,
        initial_block: InitialBlock::Recompute,
        ..Default::default()
    })
}

pub fn parse(state: &mut BufferState, context: &ParseContext) -> Outcome {
    let (start, end, info) = match scan(state.bytes()) {
        Scan::Header {
            start,
            audio_offset,
            info,
        } => (start, audio_offset, info),
        Scan::Incomplete if !state.is_eof() => return Outcome::NeedMore,
        Scan::Incomplete | Scan::NotFlac => return fallback(context),
    };
    trace!("FLAC STREAMINFO: {info:?}, audio at {end}");

    let audio_offset = state.base() + end as u64;
    let audio_size = context
        .content_length
        .and_then(|length| length.checked_sub(audio_offset));
    let duration = info.duration();

    let bitrate = match (audio_size, duration) {
        (Some(size), Some(duration)) => bitrate_of(size, duration),
        _ => None,
    }
    .unwrap_or_else(|| estimate_bitrate(info.samplerate, info.samplesize, info.channels));

    let header = Bytes::copy_from_slice(&state.bytes()[start..end]);

    Outcome::Done(FormatInfo {
        samplerate: Some(info.samplerate),
        samplesize: Some(info.samplesize),
        channels: Some(info.channels),
        bitrate: Some(bitrate),
        duration,
        audio_offset: Some(audio_offset),
        audio_size,
        lossless: true,
        initial_block: InitialBlock::Header(header),
        ..Default::default()
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use url::Url;

    /// STREAMINFO data for 44.1 kHz, 16 bit stereo, `total` samples.
    pub(crate) fn streaminfo(total: u64) -> Vec<u8> {
        let mut data = vec![0x10, 0x00, 0x10, 0x00, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[0x0a, 0xc4, 0x42, 0xf0 | ((total >> 32) as u8 & 0x0f)]);
        data.extend_from_slice(&(total as u32).to_be_bytes());
        data.resize(STREAMINFO_LEN, 0);
        data
    }

    fn stream(total: u64) -> Vec<u8> {
        let mut bytes = MARKER.to_vec();
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x22]);
        bytes.extend(streaminfo(total));
        // last block: 8 bytes of padding
        bytes.extend_from_slice(&[0x81, 0x00, 0x00, 0x08]);
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&[0xff, 0xf8, 0x69, 0x08]);
        bytes
    }

    fn context(url: &Url, content_length: Option<u64>) -> ParseContext<'_> {
        ParseContext {
            url,
            content_length,
            header_bitrate: None,
            max_wma_bitrate: None,
        }
    }

    #[test]
    fn reads_streaminfo() {
        let url = Url::parse("http://example.com/song.flac").unwrap();
        let mut state = BufferState::new(0);
        state.push(&stream(44_100 * 60));

        let Outcome::Done(info) = parse(&mut state, &context(&url, Some(5_000_054))) else {
            panic!("header not found");
        };
        assert_eq!(info.samplerate, Some(44_100));
        assert_eq!(info.channels, Some(2));
        assert_eq!(info.samplesize, Some(16));
        assert_eq!(info.audio_offset, Some(54));
        assert_eq!(info.audio_size, Some(5_000_000));
        assert_eq!(info.duration, Some(Duration::from_secs(60)));
        assert_eq!(info.bitrate, Some(666_666));
        assert!(matches!(info.initial_block, InitialBlock::Header(ref h) if h.len() == 54));
    }

    #[test]
    fn waits_for_complete_header() {
        let url = Url::parse("http://example.com/song.flac").unwrap();
        let bytes = stream(0);
        let mut state = BufferState::new(0);
        state.push(&bytes[..20]);
        assert!(matches!(parse(&mut state, &context(&url, None)), Outcome::NeedMore));

        state.push(&bytes[20..]);
        let Outcome::Done(info) = parse(&mut state, &context(&url, None)) else {
            panic!("header not found");
        };
        assert_eq!(info.bitrate, Some(846_720));
        assert_eq!(info.duration, None);
    }

    #[test]
    fn falls_back_without_header() {
        let url = Url::parse("http://example.com/song.flac").unwrap();
        let mut state = BufferState::new(0);
        state.push(b"RIFF not a flac stream");

        let Outcome::Done(info) = parse(&mut state, &context(&url, None)) else {
            panic!("fallback expected");
        };
        assert_eq!(info.bitrate, Some(846_720));
        assert_eq!(info.initial_block, InitialBlock::Recompute);
    }

    #[test]
    fn oversized_block_falls_back_at_end_of_body() {
        let url = Url::parse("http://example.com/song.flac").unwrap();
        let mut bytes = stream(0);
        bytes.truncate(bytes.len() - 16);
        bytes.extend_from_slice(&[0x81, 0xff, 0xff, 0xff]);

        let mut state = BufferState::new(0);
        state.push(&bytes);
        assert!(matches!(parse(&mut state, &context(&url, None)), Outcome::NeedMore));

        state.finish();
        let Outcome::Done(info) = parse(&mut state, &context(&url, None)) else {
            panic!("fallback expected");
        };
        assert_eq!(info.initial_block, InitialBlock::Recompute);
    }

    #[test]
    fn falls_back_at_end_of_body() {
        let url = Url::parse("http://example.com/song.flac").unwrap();
        let mut state = BufferState::new(0);
        state.push(b"fLaC\x00\x00");
        state.finish();

        let Outcome::Done(info) = parse(&mut state, &context(&url, None)) else {
            panic!("fallback expected");
        };
        assert_eq!(info.initial_block, InitialBlock::Recompute);
    }
}
