//! MP4 audio (ISO base media file format).
//!
//! The decoder needs the `moov` box, which encoders either write before the
//! media data or, annoyingly, after it. In the latter case the `mdat` box
//! is skipped by asking for the stream again starting where it ends; a
//! decoder later has to do the same, so the record is marked to always
//! recompute its initial block.

use std::time::Duration;

use super::{bitrate_of, flac::StreamInfo, FormatInfo, Outcome, ParseContext, ReadBytes};
use crate::{buffer::BufferState, error::Error};

/// Error code for streams that are not MP4 or lack a usable `moov` box.
pub const UNABLE_TO_PARSE: &str = "MP4_UNABLE_TO_PARSE";

/// AAC low complexity.
const AOT_AAC_LC: u8 = 2;

/// Scalable to lossless, the enhancement layer of HD-AAC.
const AOT_SLS: u8 = 37;

type FourCc = [u8; 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BoxHeader {
    Incomplete,
    Malformed,
    Box {
        kind: FourCc,
        header_len: usize,

        /// Including the header, `None` when the box extends to the end of
        /// its parent.
        size: Option<u64>,
    },
}

fn is_fourcc(kind: &FourCc) -> bool {
    kind.iter()
        .all(|byte| byte.is_ascii_alphanumeric() || *byte == b' ' || *byte == 0xa9)
}

fn read_header(bytes: &[u8]) -> BoxHeader {
    let (Some(size), Some(kind)) = (bytes.be_u32(0), bytes.get(4..8)) else {
        return BoxHeader::Incomplete;
    };
    let Ok(kind) = FourCc::try_from(kind) else {
        return BoxHeader::Incomplete;
    };
    if !is_fourcc(&kind) {
        return BoxHeader::Malformed;
    }

    let (header_len, size) = match size {
        0 => (8, None),
        1 => match bytes.be_u64(8) {
            Some(size) => (16, Some(size)),
            None => return BoxHeader::Incomplete,
        },
        size => (8, Some(u64::from(size))),
    };

    if size.is_some_and(|size| size < header_len as u64) {
        return BoxHeader::Malformed;
    }

    BoxHeader::Box {
        kind,
        header_len,
        size,
    }
}

/// Iterates over the child boxes in `data`, stopping at the first one that
/// doesn't fit.
fn children(data: &[u8]) -> impl Iterator<Item = (FourCc, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let rest = data.get(offset..)?;
        let BoxHeader::Box {
            kind,
            header_len,
            size,
        } = read_header(rest)
        else {
            return None;
        };

        let size = size.map_or(Some(rest.len()), |size| usize::try_from(size).ok())?;
        let payload = rest.get(header_len..size)?;
        offset += size;
        Some((kind, payload))
    })
}

fn child<'a>(data: &'a [u8], kind: &FourCc) -> Option<&'a [u8]> {
    children(data).find_map(|(k, payload)| (k == *kind).then_some(payload))
}

/// Reads an `mvhd` or `mdhd` payload.
fn parse_duration(payload: &[u8]) -> Option<Duration> {
    let (timescale, duration) = match payload.u8_at(0)? {
        1 => (payload.be_u32(20)?, payload.be_u64(24)?),
        _ => (payload.be_u32(12)?, u64::from(payload.be_u32(16)?)),
    };

    // all ones means unknown
    if timescale == 0 || duration == 0 || duration == u64::from(u32::MAX) {
        return None;
    }

    Some(Duration::from_secs_f64(
        duration as f64 / f64::from(timescale),
    ))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Codec {
    Aac {
        object_type: Option<u8>,
    },
    Alac,
    Flac,
    Opus,
    #[default]
    Other,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Track {
    is_audio: bool,
    duration: Option<Duration>,
    codec: Codec,
    samplerate: Option<u32>,
    samplesize: Option<u16>,
    channels: Option<u16>,
    bitrate: Option<u32>,

    /// Stream offset of the first chunk.
    first_chunk: Option<u64>,

    /// Sum of all sample sizes.
    sample_bytes: Option<u64>,
}

/// Reads the length of an MPEG-4 descriptor, up to four 7-bit bytes.
fn descriptor_len(data: &[u8], offset: &mut usize) -> Option<usize> {
    let mut len = 0;
    for _ in 0..4 {
        let byte = data.u8_at(*offset)?;
        *offset += 1;
        len = (len << 7) | usize::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            break;
        }
    }
    Some(len)
}

/// Returns the average bitrate and audio object type from an `esds`
/// payload.
fn parse_esds(payload: &[u8]) -> (Option<u32>, Option<u8>) {
    fn inner(payload: &[u8]) -> Option<(Option<u32>, Option<u8>)> {
        // version and flags
        let mut offset = 4;

        if payload.u8_at(offset)? != 0x03 {
            return None;
        }
        offset += 1;
        descriptor_len(payload, &mut offset)?;
        let flags = payload.u8_at(offset + 2)?;
        offset += 3;
        if flags & 0x80 != 0 {
            offset += 2;
        }
        if flags & 0x40 != 0 {
            offset += 1 + usize::from(payload.u8_at(offset)?);
        }
        if flags & 0x20 != 0 {
            offset += 2;
        }

        if payload.u8_at(offset)? != 0x04 {
            return None;
        }
        offset += 1;
        descriptor_len(payload, &mut offset)?;
        let bitrate = payload.be_u32(offset + 9).filter(|bitrate| *bitrate > 0);
        offset += 13;

        let object_type = if payload.u8_at(offset) == Some(0x05) {
            offset += 1;
            descriptor_len(payload, &mut offset)?;
            let first = payload.u8_at(offset)?;
            match first >> 3 {
                31 => {
                    let second = payload.u8_at(offset + 1)?;
                    Some(32 + (((first & 0x07) << 3) | (second >> 5)))
                }
                object_type => Some(object_type),
            }
        } else {
            None
        };

        Some((bitrate, object_type))
    }

    inner(payload).unwrap_or_default()
}

fn parse_sample_entry(track: &mut Track, kind: FourCc, entry: &[u8]) {
    track.channels = entry.be_u16(16).filter(|channels| *channels > 0);
    track.samplesize = entry.be_u16(18).filter(|size| *size > 0);
    track.samplerate = entry.be_u32(24).map(|rate| rate >> 16).filter(|rate| *rate > 0);

    // QuickTime sound description versions add fields before the children
    let extensions = match entry.be_u16(8) {
        Some(1) => 16,
        Some(2) => 36,
        _ => 0,
    };
    let boxes = entry.get(28 + extensions..).unwrap_or_default();

    match &kind {
        b"mp4a" => {
            let (bitrate, object_type) = child(boxes, b"esds").map(parse_esds).unwrap_or_default();
            track.codec = Codec::Aac { object_type };
            track.bitrate = bitrate;
        }
        b"alac" => {
            track.codec = Codec::Alac;
            if let Some(config) = child(boxes, b"alac") {
                let nonzero = |value: u8| (value > 0).then_some(u16::from(value));
                track.samplesize = config.u8_at(9).and_then(nonzero).or(track.samplesize);
                track.channels = config.u8_at(13).and_then(nonzero).or(track.channels);
                track.bitrate = config.be_u32(20).filter(|bitrate| *bitrate > 0);
                track.samplerate = config.be_u32(24).filter(|rate| *rate > 0).or(track.samplerate);
            }
        }
        b"fLaC" => {
            track.codec = Codec::Flac;
            if let Some(info) = child(boxes, b"dfLa")
                .and_then(|dfla| dfla.get(8..))
                .and_then(StreamInfo::parse)
            {
                track.samplerate = Some(info.samplerate);
                track.samplesize = Some(info.samplesize);
                track.channels = Some(info.channels);
            }
        }
        b"Opus" => {
            track.codec = Codec::Opus;
            if let Some(dops) = child(boxes, b"dOps") {
                track.channels = dops.u8_at(1).map(u16::from).or(track.channels);
                track.samplerate = dops.be_u32(4).filter(|rate| *rate > 0).or(track.samplerate);
            }
        }
        _ => {}
    }
}

fn parse_stbl(track: &mut Track, stbl: &[u8]) {
    for (kind, payload) in children(stbl) {
        match &kind {
            b"stsd" => {
                if let Some((kind, entry)) = payload.get(8..).and_then(|e| children(e).next()) {
                    parse_sample_entry(track, kind, entry);
                }
            }
            b"stsz" => {
                let (Some(size), Some(count)) = (payload.be_u32(4), payload.be_u32(8)) else {
                    continue;
                };
                track.sample_bytes = if size > 0 {
                    Some(u64::from(size) * u64::from(count))
                } else {
                    (0..count as usize)
                        .map(|i| payload.be_u32(12 + i * 4).map(u64::from))
                        .sum()
                };
            }
            b"stco" => track.first_chunk = payload.be_u32(8).map(u64::from),
            b"co64" => track.first_chunk = payload.be_u64(8),
            _ => {}
        }
    }
}

fn parse_trak(trak: &[u8]) -> Option<Track> {
    let mdia = child(trak, b"mdia")?;
    let mut track = Track {
        is_audio: child(mdia, b"hdlr").and_then(|hdlr| hdlr.get(8..12)) == Some(b"soun".as_slice()),
        duration: child(mdia, b"mdhd").and_then(parse_duration),
        ..Default::default()
    };

    if let Some(stbl) = child(mdia, b"minf").and_then(|minf| child(minf, b"stbl")) {
        parse_stbl(&mut track, stbl);
    }

    Some(track)
}

/// Where the media data was found, in stream offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MediaData {
    offset: u64,
    size: Option<u64>,
}

fn describe(moov: &[u8], mdat: Option<MediaData>, context: &ParseContext) -> Outcome {
    let tracks: Vec<_> = children(moov)
        .filter(|(kind, _)| kind == b"trak")
        .filter_map(|(_, trak)| parse_trak(trak))
        .filter(|track| track.is_audio)
        .collect();
    trace!("MP4 audio tracks: {tracks:#?}");

    let Some(first) = tracks.first() else {
        return Outcome::Failed(Error::parse_failure(
            UNABLE_TO_PARSE,
            format!("no audio track in {}", context.url),
        ));
    };

    let duration = first
        .duration
        .or_else(|| child(moov, b"mvhd").and_then(parse_duration));
    let audio_offset = mdat.map(|mdat| mdat.offset).or(first.first_chunk);
    let audio_size = mdat.and_then(|mdat| mdat.size).or(first.sample_bytes);

    let mut info = FormatInfo {
        samplerate: first.samplerate,
        samplesize: first.samplesize,
        channels: first.channels,
        bitrate: first.bitrate,
        duration,
        audio_offset,
        audio_size,
        ..Default::default()
    };

    match first.codec {
        Codec::Alac | Codec::Flac => {
            // header bitrates are unreliable for lossless codecs
            info.lossless = true;
            if let (Some(size), Some(duration)) = (audio_size, duration) {
                info.bitrate = bitrate_of(size, duration).or(info.bitrate);
            }
            if first.codec == Codec::Alac {
                info.content_type = Some("alc");
            }
        }
        Codec::Aac {
            object_type: Some(AOT_AAC_LC),
        } => {
            let companion = tracks.iter().skip(1).find(|track| {
                track.codec
                    == Codec::Aac {
                        object_type: Some(AOT_SLS),
                    }
            });
            if let Some(companion) = companion {
                debug!("{} is HD-AAC", context.url);
                info.content_type = Some("sls");
                info.samplesize = companion.samplesize.or(info.samplesize);
            }
        }
        _ => {}
    }

    if info.bitrate.is_none() {
        if let (Some(size), Some(duration)) = (audio_size, duration) {
            info.bitrate = bitrate_of(size, duration);
        }
    }

    Outcome::Done(info)
}

fn malformed(context: &ParseContext, reason: &str) -> Outcome {
    Outcome::Failed(Error::parse_failure(
        UNABLE_TO_PARSE,
        format!("{reason}: {}", context.url),
    ))
}

pub fn parse(state: &mut BufferState, context: &ParseContext) -> Outcome {
    let bytes = state.bytes();
    let base = state.base();
    let retried = base > 0;

    let incomplete = || {
        if state.is_eof() {
            malformed(context, "no moov box found")
        } else {
            Outcome::NeedMore
        }
    };

    let mut offset = 0;
    let mut mdat = None;
    loop {
        let Some(rest) = bytes.get(offset..) else {
            return incomplete();
        };
        let (kind, header_len, size) = match read_header(rest) {
            BoxHeader::Box {
                kind,
                header_len,
                size,
            } => (kind, header_len, size),
            BoxHeader::Incomplete => return incomplete(),
            BoxHeader::Malformed => return malformed(context, "invalid box"),
        };
        let Some(stream_offset) = base.checked_add(offset as u64) else {
            return malformed(context, "box too large");
        };

        match &kind {
            b"moov" => {
                let Some(size) = size.and_then(|size| usize::try_from(size).ok()) else {
                    return malformed(context, "moov box without size");
                };
                let Some(moov) = rest.get(header_len..size) else {
                    return incomplete();
                };

                // media data right behind the header, if already buffered
                if let Some(BoxHeader::Box {
                    kind: next,
                    header_len: next_header_len,
                    size: next_size,
                }) = rest.get(size..).map(read_header)
                {
                    if next == *b"mdat" {
                        mdat = stream_offset
                            .checked_add((size + next_header_len) as u64)
                            .map(|data_offset| MediaData {
                                offset: data_offset,
                                size: next_size
                                    .map(|next_size| next_size - next_header_len as u64),
                            });
                    }
                }

                return describe(moov, mdat, context);
            }
            b"mdat" => {
                let Some(data_offset) = stream_offset.checked_add(header_len as u64) else {
                    return malformed(context, "box too large");
                };
                mdat = Some(MediaData {
                    offset: data_offset,
                    size: size.map(|size| size - header_len as u64),
                });

                let Some(size) = size else {
                    return malformed(context, "mdat extends to the end, no moov box");
                };
                if retried {
                    return malformed(context, "mdat box after range request");
                }

                let Some(end) = stream_offset.checked_add(size) else {
                    return malformed(context, "box too large");
                };

                // the rest of the box is probably not buffered yet
                if end - base > bytes.len() as u64 {
                    debug!("mdat before moov in {}, continuing at {end}", context.url);
                    return Outcome::Retry(end);
                }
            }
            _ => {
                if size.is_none() {
                    return malformed(context, "unsized box before moov");
                }
            }
        }

        let Some(next) = size
            .and_then(|size| usize::try_from(size).ok())
            .and_then(|size| offset.checked_add(size))
        else {
            return malformed(context, "box too large");
        };
        offset = next;
    }
}
