//! PCM in RIFF WAVE and AIFF/AIFC containers.
//!
//! The decoder plays raw samples, so it has to be told where they start,
//! how they are laid out and in which byte order. A stream whose chunks
//! can't be found is unusable.

use std::time::Duration;

use super::{FormatInfo, Outcome, ParseContext, ReadBytes};
use crate::{buffer::BufferState, error::Error};

/// Error code for streams without a format or data chunk.
pub const UNABLE_TO_PARSE: &str = "WAV_UNABLE_TO_PARSE";

const CHUNK_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Container {
    Wave,
    Aiff,
    Aifc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Format {
    channels: u16,
    samplerate: u32,
    samplesize: u16,
    big_endian: bool,
}

#[derive(Debug)]
enum Scan {
    Incomplete,
    Malformed(&'static str),
    Found {
        container: Container,
        format: Format,
        audio_offset: usize,

        /// As declared, may be zero or bogus for live streams.
        audio_size: u64,
    },
}

/// Converts an 80-bit IEEE 754 extended precision number, as AIFF stores
/// sample rates.
fn extended_to_u32(bytes: &[u8]) -> Option<u32> {
    let exponent = i32::from(bytes.be_u16(0)? & 0x7fff);
    let mantissa = bytes.be_u64(2)?;
    if exponent == 0 || mantissa == 0 {
        return Some(0);
    }

    let shift = exponent - 16383 - 63;
    let value = if shift >= 0 {
        mantissa.checked_shl(shift.unsigned_abs())?
    } else {
        mantissa.checked_shr(shift.unsigned_abs()).unwrap_or_default()
    };
    u32::try_from(value).ok()
}

fn parse_fmt(data: &[u8]) -> Option<Format> {
    Some(Format {
        channels: data.le_u16(2)?,
        samplerate: data.le_u32(4)?,
        samplesize: data.le_u16(14)?,
        big_endian: false,
    })
}

fn parse_comm(data: &[u8], container: Container) -> Option<Format> {
    let compression = if container == Container::Aifc {
        data.get(18..22)
    } else {
        None
    };

    Some(Format {
        channels: data.be_u16(0)?,
        samplesize: data.be_u16(6)?,
        samplerate: extended_to_u32(data.get(8..18)?)?,
        // byte swapped PCM
        big_endian: compression != Some(b"sowt".as_slice()),
    })
}

fn scan(bytes: &[u8]) -> Scan {
    let Some(magic) = bytes.get(..12) else {
        return Scan::Incomplete;
    };
    let container = match (&magic[..4], &magic[8..12]) {
        (b"RIFF", b"WAVE") => Container::Wave,
        (b"FORM", b"AIFF") => Container::Aiff,
        (b"FORM", b"AIFC") => Container::Aifc,
        _ => return Scan::Malformed("not a RIFF or AIFF stream"),
    };

    let mut offset = 12;
    let mut format = None;
    loop {
        let Some(id) = bytes.get(offset..).and_then(|rest| rest.get(..4)) else {
            return Scan::Incomplete;
        };
        let size = match container {
            Container::Wave => bytes.le_u32(offset + 4),
            Container::Aiff | Container::Aifc => bytes.be_u32(offset + 4),
        };
        let Some(size) = size else {
            return Scan::Incomplete;
        };

        let data_start = offset + CHUNK_HEADER_LEN;
        let data_end = data_start.saturating_add(size as usize);
        let data = bytes.get(data_start..data_end);

        match (container, id) {
            (Container::Wave, b"fmt ") => match data {
                Some(data) => format = parse_fmt(data),
                None => return Scan::Incomplete,
            },
            (Container::Aiff | Container::Aifc, b"COMM") => match data {
                Some(data) => format = parse_comm(data, container),
                None => return Scan::Incomplete,
            },
            (Container::Wave, b"data") => {
                let Some(format) = format else {
                    return Scan::Malformed("data chunk before fmt chunk");
                };
                return Scan::Found {
                    container,
                    format,
                    audio_offset: data_start,
                    audio_size: u64::from(size),
                };
            }
            (Container::Aiff | Container::Aifc, b"SSND") => {
                let Some(format) = format else {
                    return Scan::Malformed("SSND chunk before COMM chunk");
                };
                let Some(skip) = bytes.be_u32(data_start) else {
                    return Scan::Incomplete;
                };
                let skip = (skip as usize).saturating_add(8);
                return Scan::Found {
                    container,
                    format,
                    audio_offset: data_start.saturating_add(skip),
                    audio_size: u64::from(size).saturating_sub(skip as u64),
                };
            }
            _ => {}
        }

        // chunks are padded to an even length
        offset = data_end.saturating_add(size as usize & 1);
    }
}

pub fn parse(state: &mut BufferState, context: &ParseContext) -> Outcome {
    let (container, format, offset, declared_size) = match scan(state.bytes()) {
        Scan::Found {
            container,
            format,
            audio_offset,
            audio_size,
        } => (container, format, audio_offset, audio_size),
        Scan::Incomplete if !state.is_eof() => return Outcome::NeedMore,
        Scan::Incomplete => {
            return Outcome::Failed(Error::parse_failure(
                UNABLE_TO_PARSE,
                format!("no audio chunk found in {}", context.url),
            ));
        }
        Scan::Malformed(reason) => {
            return Outcome::Failed(Error::parse_failure(
                UNABLE_TO_PARSE,
                format!("{reason}: {}", context.url),
            ));
        }
    };
    trace!("{container:?} {format:?}, audio at {offset}");

    if format.channels == 0 || format.samplesize == 0 || format.samplerate == 0 {
        return Outcome::Failed(Error::parse_failure(
            UNABLE_TO_PARSE,
            format!("invalid PCM format {format:?} in {}", context.url),
        ));
    }

    let audio_offset = state.base() + offset as u64;
    let remainder = context
        .content_length
        .and_then(|length| length.checked_sub(audio_offset));
    let audio_size = match remainder {
        Some(remainder) if declared_size == 0 || declared_size > remainder => remainder,
        _ => declared_size,
    };

    let bitrate = format
        .samplerate
        .saturating_mul(u32::from(format.samplesize) * u32::from(format.channels));
    let duration = (audio_size > 0)
        .then(|| Duration::from_secs_f64(audio_size as f64 * 8.0 / f64::from(bitrate)));

    Outcome::Done(FormatInfo {
        content_type: Some(match container {
            Container::Wave => "wav",
            Container::Aiff | Container::Aifc => "aif",
        }),
        samplerate: Some(format.samplerate),
        samplesize: Some(format.samplesize),
        channels: Some(format.channels),
        bitrate: Some(bitrate),
        duration,
        audio_offset: Some(audio_offset),
        audio_size: (audio_size > 0).then_some(audio_size),
        block_align: Some(u32::from(format.channels) * u32::from(format.samplesize / 8)),
        big_endian: Some(format.big_endian),
        lossless: true,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn wave(data_len: u32) -> Vec<u8> {
        let mut bytes = b"RIFF\0\0\0\0WAVE".to_vec();
        bytes.extend_from_slice(b"fmt \x10\0\0\0");
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&44_100u32.to_le_bytes());
        bytes.extend_from_slice(&176_400u32.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"LIST\x03\0\0\0abc\0");
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes
    }

    fn aifc(compression: &[u8; 4]) -> Vec<u8> {
        let mut bytes = b"FORM\0\0\0\0AIFC".to_vec();
        bytes.extend_from_slice(b"COMM\0\0\0\x16");
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&1000u32.to_be_bytes());
        bytes.extend_from_slice(&16u16.to_be_bytes());
        bytes.extend_from_slice(&[0x40, 0x0e, 0xac, 0x44, 0, 0, 0, 0, 0, 0]);
        bytes.extend_from_slice(compression);
        bytes.extend_from_slice(b"SSND\0\0\x0f\xa8");
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes
    }

    fn run(bytes: &[u8], content_length: Option<u64>) -> Outcome {
        let url = Url::parse("http://example.com/song.wav").unwrap();
        let context = ParseContext {
            url: &url,
            content_length,
            header_bitrate: None,
            max_wma_bitrate: None,
        };
        let mut state = BufferState::new(0);
        state.push(bytes);
        parse(&mut state, &context)
    }

    #[test]
    fn wave_is_little_endian() {
        let Outcome::Done(info) = run(&wave(1_764_000), None) else {
            panic!("no format found");
        };
        assert_eq!(info.content_type, Some("wav"));
        assert_eq!(info.big_endian, Some(false));
        assert_eq!(info.audio_offset, Some(56));
        assert_eq!(info.audio_size, Some(1_764_000));
        assert_eq!(info.block_align, Some(4));
        assert_eq!(info.bitrate, Some(1_411_200));
        assert_eq!(info.duration, Some(Duration::from_secs(10)));
    }

    #[test]
    fn open_ended_data_uses_content_length() {
        let Outcome::Done(info) = run(&wave(0), Some(1056)) else {
            panic!("no format found");
        };
        assert_eq!(info.audio_size, Some(1000));
    }

    #[test]
    fn aifc_byte_order() {
        let Outcome::Done(info) = run(&aifc(b"NONE"), None) else {
            panic!("no format found");
        };
        assert_eq!(info.content_type, Some("aif"));
        assert_eq!(info.samplerate, Some(44_100));
        assert_eq!(info.big_endian, Some(true));
        assert_eq!(info.audio_size, Some(4000));

        let Outcome::Done(info) = run(&aifc(b"sowt"), None) else {
            panic!("no format found");
        };
        assert_eq!(info.big_endian, Some(false));
    }

    #[test]
    fn needs_more_then_fails() {
        let bytes = wave(0);
        assert!(matches!(run(&bytes[..30], None), Outcome::NeedMore));

        let url = Url::parse("http://example.com/song.wav").unwrap();
        let context = ParseContext {
            url: &url,
            content_length: None,
            header_bitrate: None,
            max_wma_bitrate: None,
        };
        let mut state = BufferState::new(0);
        state.push(&bytes[..30]);
        state.finish();
        match parse(&mut state, &context) {
            Outcome::Failed(err) => assert_eq!(err.code(), UNABLE_TO_PARSE),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn oversized_chunk_fails_at_end_of_body() {
        let mut bytes = b"RIFF\0\0\0\0WAVE".to_vec();
        bytes.extend_from_slice(b"LIST\xff\xff\xff\xff");
        bytes.extend_from_slice(&wave(0)[12..]);

        let url = Url::parse("http://example.com/song.wav").unwrap();
        let context = ParseContext {
            url: &url,
            content_length: None,
            header_bitrate: None,
            max_wma_bitrate: None,
        };
        let mut state = BufferState::new(0);
        state.push(&bytes);
        assert!(matches!(parse(&mut state, &context), Outcome::NeedMore));

        state.finish();
        match parse(&mut state, &context) {
            Outcome::Failed(err) => assert_eq!(err.code(), UNABLE_TO_PARSE),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn oversized_sound_offset_is_not_trusted() {
        let mut bytes = aifc(b"NONE");
        let skip = bytes.len() - 8;
        bytes[skip..skip + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        let Outcome::Done(info) = run(&bytes, None) else {
            panic!("no format found");
        };
        assert_eq!(info.audio_size, None);
    }

    #[test]
    fn rejects_other_containers() {
        assert!(matches!(run(b"ID3\x04\0\0\0\0\0\0\0\0", None), Outcome::Failed(_)));
    }
}
