//! WMA streams in the Advanced Systems Format.
//!
//! An ASF header declares any number of streams, each with a codec and
//! usually a bitrate. Radio servers commonly offer the same program in
//! several bitrates within one header, so the parser selects the best
//! playable audio stream that fits within the configured cap, and remembers
//! the command stream that carries title updates.
//!
//! Headers fetched over MMS-over-HTTP are prefixed by a 12 byte `$H`
//! chunking preamble, which is skipped.

use std::time::Duration;

use super::{FormatInfo, Outcome, ParseContext, ReadBytes};
use crate::error::Error;

pub const READ_LIMIT: usize = 128 * 1024;

/// Error code for headers without usable bitrate information.
pub const UNABLE_TO_PARSE: &str = "ASF_UNABLE_TO_PARSE";

/// Codec IDs that can be played: WMA 7/8/9 and WMA 9 Voice.
const PLAYABLE_CODECS: [u16; 2] = [0x0161, 0x000a];

const CHUNK_MAGIC: &[u8; 2] = b"$H";
const CHUNK_PREAMBLE_LEN: usize = 12;

/// Size of an object header: GUID and 64-bit size.
const OBJECT_HEADER_LEN: usize = 24;

/// Size of the top-level header object header.
const HEADER_OBJECT_LEN: usize = 30;

/// GUIDs are stored with their first three groups little-endian.
const fn guid(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> [u8; 16] {
    let a = d1.to_le_bytes();
    let b = d2.to_le_bytes();
    let c = d3.to_le_bytes();
    [
        a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5],
        d4[6], d4[7],
    ]
}

const HEADER: [u8; 16] = guid(
    0x75B2_2630,
    0x668E,
    0x11CF,
    [0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C],
);
const FILE_PROPERTIES: [u8; 16] = guid(
    0x8CAB_DCA1,
    0xA947,
    0x11CF,
    [0x8E, 0xE4, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65],
);
const STREAM_PROPERTIES: [u8; 16] = guid(
    0xB7DC_0791,
    0xA9B7,
    0x11CF,
    [0x8E, 0xE6, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65],
);
const STREAM_BITRATE_PROPERTIES: [u8; 16] = guid(
    0x7BF8_75CE,
    0x468D,
    0x11D1,
    [0x8D, 0x82, 0x00, 0x60, 0x97, 0xC9, 0xA2, 0xB2],
);
const HEADER_EXTENSION: [u8; 16] = guid(
    0x5FBF_03B5,
    0xA92E,
    0x11CF,
    [0x8E, 0xE3, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65],
);
const EXTENDED_STREAM_PROPERTIES: [u8; 16] = guid(
    0x14E6_A5CB,
    0xC672,
    0x4332,
    [0x83, 0x99, 0xA9, 0x69, 0x52, 0x06, 0x5B, 0x5A],
);
const AUDIO_MEDIA: [u8; 16] = guid(
    0xF869_9E40,
    0x5B4D,
    0x11CF,
    [0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B],
);
const COMMAND_MEDIA: [u8; 16] = guid(
    0x59DA_CFC0,
    0x59E6,
    0x11D0,
    [0xA3, 0xAC, 0x00, 0xA0, 0xC9, 0x03, 0x48, 0xF6],
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Audio,
    Command,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Stream {
    number: u16,
    kind: StreamKind,
    codec: Option<u16>,
    channels: Option<u16>,
    samplerate: Option<u32>,
    samplesize: Option<u16>,

    /// From the stream bitrate properties, else the audio format.
    bitrate: Option<u32>,
}

impl Stream {
    fn is_playable(&self) -> bool {
        self.kind == StreamKind::Audio
            && self.codec.is_some_and(|codec| PLAYABLE_CODECS.contains(&codec))
    }
}

#[derive(Debug, Default)]
struct Header {
    max_bitrate: Option<u32>,

    /// In 100 ns units, including the preroll.
    play_duration: u64,
    preroll_ms: u64,
    broadcast: bool,
    streams: Vec<Stream>,

    /// Stream number and average bitrate.
    stream_bitrates: Vec<(u16, u32)>,
}

impl Header {
    /// Parses the header object at the start of `bytes`. Objects cut off by
    /// the end of the buffer are ignored.
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.get(..16)? != HEADER {
            return None;
        }

        let mut header = Self::default();
        let header_len = usize::try_from(bytes.le_u64(16)?).ok()?;
        let end = header_len.min(bytes.len());
        header.parse_objects(bytes, HEADER_OBJECT_LEN, end);

        for (number, bitrate) in &header.stream_bitrates {
            if let Some(stream) = header.streams.iter_mut().find(|s| s.number == *number) {
                stream.bitrate = Some(*bitrate);
            }
        }

        Some(header)
    }

    fn parse_objects(&mut self, bytes: &[u8], mut offset: usize, end: usize) {
        while offset + OBJECT_HEADER_LEN <= end {
            let Some(guid) = bytes.get(offset..offset + 16) else {
                break;
            };
            let Some(size) = bytes
                .le_u64(offset + 16)
                .and_then(|size| usize::try_from(size).ok())
            else {
                break;
            };
            let Some(next) = offset
                .checked_add(size)
                .filter(|next| size >= OBJECT_HEADER_LEN && *next <= end)
            else {
                trace!("ASF object at {offset} truncated or malformed");
                break;
            };

            let object = &bytes[offset..next];
            if guid == FILE_PROPERTIES {
                self.parse_file_properties(object);
            } else if guid == STREAM_PROPERTIES {
                if let Some(stream) = Self::parse_stream_properties(object) {
                    self.streams.push(stream);
                }
            } else if guid == STREAM_BITRATE_PROPERTIES {
                self.parse_stream_bitrates(object);
            } else if guid == HEADER_EXTENSION {
                self.parse_header_extension(object);
            }

            offset = next;
        }
    }

    fn parse_file_properties(&mut self, object: &[u8]) {
        self.play_duration = object.le_u64(64).unwrap_or_default();
        self.preroll_ms = object.le_u64(80).unwrap_or_default();
        self.broadcast = object.le_u32(88).is_some_and(|flags| flags & 1 != 0);
        self.max_bitrate = object.le_u32(100).filter(|bitrate| *bitrate > 0);
    }

    fn parse_stream_properties(object: &[u8]) -> Option<Stream> {
        let kind = match object.get(24..40)? {
            guid if guid == AUDIO_MEDIA => StreamKind::Audio,
            guid if guid == COMMAND_MEDIA => StreamKind::Command,
            _ => StreamKind::Other,
        };
        let number = object.le_u16(72)? & 0x7f;

        let mut stream = Stream {
            number,
            kind,
            codec: None,
            channels: None,
            samplerate: None,
            samplesize: None,
            bitrate: None,
        };

        if kind == StreamKind::Audio {
            // WAVEFORMATEX
            stream.codec = object.le_u16(78);
            stream.channels = object.le_u16(80);
            stream.samplerate = object.le_u32(82);
            stream.bitrate = object
                .le_u32(86)
                .filter(|bytes_per_sec| *bytes_per_sec > 0)
                .map(|bytes_per_sec| bytes_per_sec.saturating_mul(8));
            stream.samplesize = object.le_u16(92);
        }

        Some(stream)
    }

    fn parse_stream_bitrates(&mut self, object: &[u8]) {
        let count = object.le_u16(24).unwrap_or_default();
        for i in 0..usize::from(count) {
            let record = 26 + i * 6;
            let (Some(flags), Some(bitrate)) = (object.le_u16(record), object.le_u32(record + 2))
            else {
                break;
            };
            if bitrate > 0 {
                self.stream_bitrates.push((flags & 0x7f, bitrate));
            }
        }
    }

    /// Newer encoders only declare streams in extended stream properties
    /// nested in the header extension.
    fn parse_header_extension(&mut self, object: &[u8]) {
        const EXTENSION_DATA: usize = 46;

        let mut offset = EXTENSION_DATA;
        while offset + OBJECT_HEADER_LEN <= object.len() {
            let Some(next) = object
                .le_u64(offset + 16)
                .and_then(|size| usize::try_from(size).ok())
                .filter(|size| *size >= OBJECT_HEADER_LEN)
                .and_then(|size| offset.checked_add(size))
                .filter(|next| *next <= object.len())
            else {
                break;
            };

            if object[offset..offset + 16] == EXTENDED_STREAM_PROPERTIES {
                if let Some(stream) =
                    Self::parse_extended_stream_properties(&object[offset..next])
                {
                    if !self.streams.iter().any(|s| s.number == stream.number) {
                        self.streams.push(stream);
                    }
                }
            }

            offset = next;
        }
    }

    fn parse_extended_stream_properties(object: &[u8]) -> Option<Stream> {
        let data_bitrate = object.le_u32(40).filter(|bitrate| *bitrate > 0);
        let name_count = object.le_u16(84)?;
        let system_count = object.le_u16(86)?;

        let mut offset = 88;
        for _ in 0..name_count {
            offset += 4 + usize::from(object.le_u16(offset + 2)?);
        }
        for _ in 0..system_count {
            offset += 22 + usize::try_from(object.le_u32(offset + 18)?).ok()?;
        }

        let embedded = object.get(offset..)?;
        if embedded.get(..16)? != STREAM_PROPERTIES {
            return None;
        }

        let mut stream = Self::parse_stream_properties(embedded)?;
        if stream.bitrate.is_none() {
            stream.bitrate = data_bitrate;
        }
        Some(stream)
    }

    fn has_bitrate(&self) -> bool {
        self.max_bitrate.is_some()
            || !self.stream_bitrates.is_empty()
            || self.streams.iter().any(|stream| stream.bitrate.is_some())
    }

    fn duration(&self) -> Option<Duration> {
        if self.broadcast || self.play_duration == 0 {
            return None;
        }

        let millis = (self.play_duration / 10_000).checked_sub(self.preroll_ms)?;
        Some(Duration::from_millis(millis))
    }
}

/// Skips the MMS-over-HTTP chunking preamble, if any.
fn strip_chunking(bytes: &[u8]) -> &[u8] {
    if bytes.starts_with(CHUNK_MAGIC) {
        bytes.get(CHUNK_PREAMBLE_LEN..).unwrap_or_default()
    } else {
        bytes
    }
}

/// Bytes needed to tell an ASF header from anything else.
pub const SNIFF_LEN: usize = CHUNK_PREAMBLE_LEN + 16;

/// Whether `bytes` start with an ASF header, chunked or not.
///
/// Servers hand out the stream itself for `.asx` URLs more often than one
/// would like.
#[must_use]
pub fn is_header(bytes: &[u8]) -> bool {
    bytes.starts_with(CHUNK_MAGIC) || strip_chunking(bytes).starts_with(&HEADER)
}

/// Selects the stream with the highest bitrate not above `cap`, or the
/// lowest one if they all are.
fn select_stream<'a>(streams: &[&'a Stream], cap: Option<u32>) -> Option<&'a Stream> {
    let with_bitrate = || streams.iter().copied().filter(|s| s.bitrate.is_some());

    with_bitrate()
        .filter(|s| cap.is_none_or(|cap| s.bitrate.unwrap_or_default() <= cap))
        .max_by_key(|s| s.bitrate)
        .or_else(|| with_bitrate().min_by_key(|s| s.bitrate))
}

pub fn parse(bytes: &[u8], context: &ParseContext) -> Outcome {
    let bytes = strip_chunking(bytes);

    let header = match Header::parse(bytes) {
        Some(header) if header.has_bitrate() => header,
        _ => {
            return Outcome::Failed(Error::parse_failure(
                UNABLE_TO_PARSE,
                format!("no usable ASF header for {}", context.url),
            ));
        }
    };
    trace!("ASF header: {header:#?}");

    let command_stream = header
        .streams
        .iter()
        .find(|stream| stream.kind == StreamKind::Command)
        .map(|stream| stream.number);

    let playable: Vec<_> = header.streams.iter().filter(|s| s.is_playable()).collect();

    let mut info = FormatInfo {
        wma_command_stream: command_stream,
        duration: header.duration(),
        ..Default::default()
    };

    match select_stream(&playable, context.max_wma_bitrate) {
        Some(stream) => {
            debug!(
                "selected WMA stream #{} at {:?} bps for {}",
                stream.number, stream.bitrate, context.url
            );
            info.wma_stream = Some(stream.number);
            info.bitrate = stream.bitrate;
            info.samplerate = stream.samplerate;
            info.samplesize = stream.samplesize;
            info.channels = stream.channels;
        }
        None => {
            let stream = playable.first().map_or(1, |stream| stream.number);
            debug!("no WMA stream bitrates, defaulting to stream #{stream} for {}", context.url);
            info.wma_stream = Some(stream);
            info.bitrate = header.max_bitrate;
        }
    }

    Outcome::Done(info)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use url::Url;

    fn object(guid: [u8; 16], data: &[u8]) -> Vec<u8> {
        let mut object = guid.to_vec();
        object.extend_from_slice(&((data.len() + OBJECT_HEADER_LEN) as u64).to_le_bytes());
        object.extend_from_slice(data);
        object
    }

    fn audio_stream(number: u16, codec: u16, bytes_per_sec: u32) -> Vec<u8> {
        let mut data = AUDIO_MEDIA.to_vec();
        data.extend_from_slice(&[0; 16]); // error correction type
        data.extend_from_slice(&0u64.to_le_bytes()); // time offset
        data.extend_from_slice(&18u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&number.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&codec.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&44_100u32.to_le_bytes());
        data.extend_from_slice(&bytes_per_sec.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        object(STREAM_PROPERTIES, &data)
    }

    fn command_stream(number: u16) -> Vec<u8> {
        let mut data = COMMAND_MEDIA.to_vec();
        data.extend_from_slice(&[0; 16]);
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&number.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        object(STREAM_PROPERTIES, &data)
    }

    fn file_properties(play_duration: u64, preroll: u64, max_bitrate: u32) -> Vec<u8> {
        let mut data = vec![0; 16 + 8 + 8 + 8];
        data.extend_from_slice(&play_duration.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&preroll.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&max_bitrate.to_le_bytes());
        object(FILE_PROPERTIES, &data)
    }

    /// Builds an ASF header object around `objects`.
    pub(crate) fn header(objects: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = objects.concat();
        let mut header = HEADER.to_vec();
        header.extend_from_slice(&((body.len() + HEADER_OBJECT_LEN) as u64).to_le_bytes());
        header.extend_from_slice(&(objects.len() as u32).to_le_bytes());
        header.extend_from_slice(&[1, 2]);
        header.extend_from_slice(&body);
        header
    }

    /// A typical multi-bitrate radio header.
    pub(crate) fn radio_header() -> Vec<u8> {
        header(&[
            file_properties(0, 3000, 160_000),
            audio_stream(1, 0x0161, 4_000),
            audio_stream(2, 0x0161, 16_000),
            audio_stream(3, 0x0162, 8_000),
            command_stream(4),
        ])
    }

    fn context(url: &Url, cap: Option<u32>) -> ParseContext<'_> {
        ParseContext {
            url,
            content_length: None,
            header_bitrate: None,
            max_wma_bitrate: cap,
        }
    }

    fn done(outcome: Outcome) -> FormatInfo {
        match outcome {
            Outcome::Done(info) => info,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn selects_highest_playable_stream() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let info = done(parse(&radio_header(), &context(&url, None)));
        assert_eq!(info.wma_stream, Some(2));
        assert_eq!(info.bitrate, Some(128_000));
        assert_eq!(info.wma_command_stream, Some(4));
        assert_eq!(info.samplerate, Some(44_100));
    }

    #[test]
    fn respects_bitrate_cap() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let info = done(parse(&radio_header(), &context(&url, Some(64_000))));
        assert_eq!(info.wma_stream, Some(1));
        assert_eq!(info.bitrate, Some(32_000));
    }

    #[test]
    fn strips_chunking_preamble() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let mut bytes = b"$H\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00".to_vec();
        bytes.extend_from_slice(&radio_header());
        assert_eq!(done(parse(&bytes, &context(&url, None))).wma_stream, Some(2));
    }

    #[test]
    fn defaults_to_first_stream_without_stream_bitrates() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let bytes = header(&[file_properties(0, 0, 64_000), audio_stream(1, 0x0161, 0)]);
        let info = done(parse(&bytes, &context(&url, None)));
        assert_eq!(info.wma_stream, Some(1));
        assert_eq!(info.bitrate, Some(64_000));
    }

    #[test]
    fn duration_excludes_preroll() {
        let url = Url::parse("http://example.com/song.wma").unwrap();
        let bytes = header(&[
            file_properties(1_830_000_000, 3_000, 128_000),
            audio_stream(1, 0x0161, 16_000),
        ]);
        let info = done(parse(&bytes, &context(&url, None)));
        assert_eq!(info.duration, Some(Duration::from_secs(180)));
    }

    #[test]
    fn fails_without_bitrate() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let bytes = header(&[file_properties(0, 0, 0), audio_stream(1, 0x0161, 0)]);
        match parse(&bytes, &context(&url, None)) {
            Outcome::Failed(err) => assert_eq!(err.code(), UNABLE_TO_PARSE),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unplayable_codecs_default_to_first_stream() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let bytes = header(&[file_properties(0, 0, 96_000), audio_stream(2, 0x0162, 12_000)]);
        let info = done(parse(&bytes, &context(&url, None)));
        assert_eq!(info.wma_stream, Some(1));
        assert_eq!(info.bitrate, Some(96_000));
    }

    #[test]
    fn oversized_object_is_ignored() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let mut huge = file_properties(0, 0, 64_000);
        huge[16..24].copy_from_slice(&(u64::MAX - 10).to_le_bytes());
        let bytes = header(&[huge]);
        match parse(&bytes, &context(&url, None)) {
            Outcome::Failed(err) => assert_eq!(err.code(), UNABLE_TO_PARSE),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn oversized_extension_object_is_ignored() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        let mut nested = object(EXTENDED_STREAM_PROPERTIES, &[0; 8]);
        nested[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        let mut extension = vec![0; 22];
        extension.extend_from_slice(&nested);
        let bytes = header(&[
            file_properties(0, 0, 64_000),
            object(HEADER_EXTENSION, &extension),
        ]);
        assert_eq!(done(parse(&bytes, &context(&url, None))).bitrate, Some(64_000));
    }

    #[test]
    fn sniffs_header() {
        assert!(is_header(&radio_header()));
        assert!(is_header(b"$H\x00\x00"));
        assert!(!is_header(b"<ASX version=\"3.0\">"));
    }

    #[test]
    fn fails_on_garbage() {
        let url = Url::parse("http://example.com/radio.wma").unwrap();
        assert!(matches!(
            parse(b"<html></html>", &context(&url, None)),
            Outcome::Failed(_)
        ));
    }
}
