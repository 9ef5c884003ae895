//! Header parsers for the supported container formats.
//!
//! Every parser is a pure function from the bytes read so far (a
//! [`BufferState`]) plus response metadata (a [`ParseContext`]) to an
//! [`Outcome`]: read more, done, retry from an offset, or failed. The
//! scanner owns the network side and decides how many bytes to read before
//! asking, according to [`Parser::read_mode`].
//!
//! | Format | Read mode |
//! |---|---|
//! | WMA/ASF | 128 KiB, parsed once |
//! | AAC | 4 KiB, parsed once |
//! | Ogg | 64 bytes, parsed once |
//! | FLAC, WAV/AIFF, MP4 | parsed after every chunk until decided |
//! | MP3 | parsed after every chunk, 128 KiB budget extended past ID3v2 tags |

use std::time::Duration;

use url::Url;

use crate::{
    buffer::BufferState,
    error::Error,
    store::{InitialBlock, TrackRecord},
};

pub mod aac;
pub mod asf;
pub mod flac;
pub mod mp3;
pub mod mp4;
pub mod ogg;
pub mod wav;

/// What a parser decided after looking at the buffer.
#[derive(Debug)]
pub enum Outcome {
    /// Read the next chunk and ask again.
    NeedMore,

    /// Enough is known; disconnect.
    Done(FormatInfo),

    /// Reissue the request starting at this stream offset.
    Retry(u64),

    /// The stream cannot be used.
    Failed(Error),
}

/// Response metadata available to parsers.
#[derive(Clone, Debug)]
pub struct ParseContext<'a> {
    pub url: &'a Url,

    /// Length of the complete resource, if the server said.
    pub content_length: Option<u64>,

    /// Bitrate declared by Icecast/Shoutcast headers.
    pub header_bitrate: Option<u32>,

    /// Highest WMA stream bitrate to select.
    pub max_wma_bitrate: Option<u32>,
}

/// Decode parameters found in a stream header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FormatInfo {
    /// More specific content type than the one the stream was served as.
    pub content_type: Option<&'static str>,

    pub samplerate: Option<u32>,
    pub samplesize: Option<u16>,
    pub channels: Option<u16>,

    /// Average bitrate in bits per second.
    pub bitrate: Option<u32>,
    pub vbr: bool,
    pub duration: Option<Duration>,

    pub audio_offset: Option<u64>,
    pub audio_size: Option<u64>,
    pub block_align: Option<u32>,
    pub big_endian: Option<bool>,

    pub wma_stream: Option<u16>,
    pub wma_command_stream: Option<u16>,
    pub lossless: bool,

    pub initial_block: InitialBlock,
}

impl FormatInfo {
    /// Copies everything that was found onto `record`, leaving fields that
    /// were not found untouched.
    pub fn apply_to(self, record: &mut TrackRecord) {
        fn set<T>(field: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *field = value;
            }
        }

        if let Some(content_type) = self.content_type {
            record.content_type = Some(content_type.to_owned());
        }

        set(&mut record.samplerate, self.samplerate);
        set(&mut record.samplesize, self.samplesize);
        set(&mut record.channels, self.channels);
        set(&mut record.bitrate, self.bitrate);
        set(&mut record.duration, self.duration);
        set(&mut record.audio_offset, self.audio_offset);
        set(&mut record.audio_size, self.audio_size);
        set(&mut record.block_align, self.block_align);
        set(&mut record.big_endian, self.big_endian);
        set(&mut record.wma_stream, self.wma_stream);
        set(&mut record.wma_command_stream, self.wma_command_stream);

        record.vbr |= self.vbr;
        record.lossless |= self.lossless;
        if self.initial_block != InitialBlock::None {
            record.initial_block = self.initial_block;
        }
    }
}

/// How the scanner feeds a parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Read this many bytes, or up to the end of the body, then parse once.
    Bounded(usize),

    /// Parse after every chunk. The parser decides when it has enough,
    /// starting from this budget when one is given.
    Streaming(Option<usize>),
}

/// The parsers, one per container family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Parser {
    Asf,
    Aac,
    Flac,
    Wav,
    Mp4,
    Ogg,
    Mp3,
}

impl Parser {
    /// Picks the parser for a content type tag, if there is one.
    #[must_use]
    pub fn for_type(tag: &str) -> Option<Self> {
        let parser = match tag {
            "wma" => Self::Asf,
            "aac" => Self::Aac,
            "flc" => Self::Flac,
            "wav" | "aif" => Self::Wav,
            "mp4" | "alc" | "sls" => Self::Mp4,
            "ogg" | "ogf" | "ops" => Self::Ogg,
            "mp3" => Self::Mp3,
            _ => return None,
        };

        Some(parser)
    }

    #[must_use]
    pub fn read_mode(self) -> ReadMode {
        match self {
            Self::Asf => ReadMode::Bounded(asf::READ_LIMIT),
            Self::Aac => ReadMode::Bounded(aac::READ_LIMIT),
            Self::Ogg => ReadMode::Bounded(ogg::READ_LIMIT),
            Self::Mp3 => ReadMode::Streaming(Some(mp3::DEFAULT_BUDGET)),
            Self::Flac | Self::Wav | Self::Mp4 => ReadMode::Streaming(None),
        }
    }

    /// Whether the parser may ask for the request to be reissued at an
    /// offset.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        self == Self::Mp4
    }

    pub fn parse(self, state: &mut BufferState, context: &ParseContext) -> Outcome {
        match self {
            Self::Asf => asf::parse(state.bytes(), context),
            Self::Aac => aac::parse(state.bytes()),
            Self::Flac => flac::parse(state, context),
            Self::Wav => wav::parse(state, context),
            Self::Mp4 => mp4::parse(state, context),
            Self::Ogg => ogg::parse(state.bytes(), context),
            Self::Mp3 => mp3::parse(state, context),
        }
    }
}

/// Conservative bitrate estimate for compressed lossless audio.
#[must_use]
pub fn estimate_bitrate(samplerate: u32, samplesize: u16, channels: u16) -> u32 {
    let raw = u64::from(samplerate) * u64::from(samplesize) * u64::from(channels);
    u32::try_from(raw * 6 / 10).unwrap_or(u32::MAX)
}

/// Average bitrate of `size` bytes played over `duration`.
#[must_use]
pub fn bitrate_of(size: u64, duration: Duration) -> Option<u32> {
    let millis = duration.as_millis();
    if millis == 0 {
        return None;
    }

    u32::try_from(u128::from(size) * 8 * 1000 / millis).ok()
}

pub const ID3V2_HEADER_LEN: usize = 10;

/// Length of the MP3 ID3v2 tag at the start of `bytes`, header included.
///
/// The size is stored in four synchsafe bytes at offset 6, counting the
/// tag without its 10 byte header.
#[must_use]
pub fn id3v2_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < ID3V2_HEADER_LEN || &bytes[..3] != b"ID3" {
        return None;
    }

    let size = bytes[6..10]
        .iter()
        .fold(0usize, |size, byte| (size << 7) | usize::from(byte & 0x7f));
    Some(size + ID3V2_HEADER_LEN)
}

/// Big-endian readers over byte slices that return `None` when out of
/// bounds.
pub(crate) trait ReadBytes {
    fn u8_at(&self, offset: usize) -> Option<u8>;
    fn be_u16(&self, offset: usize) -> Option<u16>;
    fn be_u32(&self, offset: usize) -> Option<u32>;
    fn be_u64(&self, offset: usize) -> Option<u64>;
    fn le_u16(&self, offset: usize) -> Option<u16>;
    fn le_u32(&self, offset: usize) -> Option<u32>;
    fn le_u64(&self, offset: usize) -> Option<u64>;
}

/// Offsets past the end, however large, read as `None`.
impl ReadBytes for [u8] {
    fn u8_at(&self, offset: usize) -> Option<u8> {
        self.get(offset).copied()
    }

    fn be_u16(&self, offset: usize) -> Option<u16> {
        Some(u16::from_be_bytes(self.get(offset..)?.get(..2)?.try_into().ok()?))
    }

    fn be_u32(&self, offset: usize) -> Option<u32> {
        Some(u32::from_be_bytes(self.get(offset..)?.get(..4)?.try_into().ok()?))
    }

    fn be_u64(&self, offset: usize) -> Option<u64> {
        Some(u64::from_be_bytes(self.get(offset..)?.get(..8)?.try_into().ok()?))
    }

    fn le_u16(&self, offset: usize) -> Option<u16> {
        Some(u16::from_le_bytes(self.get(offset..)?.get(..2)?.try_into().ok()?))
    }

    fn le_u32(&self, offset: usize) -> Option<u32> {
        Some(u32::from_le_bytes(self.get(offset..)?.get(..4)?.try_into().ok()?))
    }

    fn le_u64(&self, offset: usize) -> Option<u64> {
        Some(u64::from_le_bytes(self.get(offset..)?.get(..8)?.try_into().ok()?))
    }
}
