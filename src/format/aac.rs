//! ADTS framed AAC.
//!
//! Only the sample rate is of interest here; decoders learn the rest from
//! the frames themselves. A stream without a recognizable ADTS header is
//! still played.

use super::{id3v2_len, FormatInfo, Outcome};

pub const READ_LIMIT: usize = 4096;

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AdtsHeader {
    samplerate: u32,
    channels: u16,
    frame_len: usize,
}

impl AdtsHeader {
    fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..6)?;

        // 12 bit syncword, layer always 0
        if header[0] != 0xff || header[1] & 0xf6 != 0xf0 {
            return None;
        }

        let samplerate = *SAMPLE_RATES.get(usize::from((header[2] >> 2) & 0x0f))?;
        let channels = u16::from(((header[2] & 0x01) << 2) | (header[3] >> 6));
        let frame_len = (usize::from(header[3] & 0x03) << 11)
            | (usize::from(header[4]) << 3)
            | usize::from(header[5] >> 5);

        // A frame cannot be shorter than its own header.
        if frame_len < 7 {
            return None;
        }

        Some(Self {
            samplerate,
            channels,
            frame_len,
        })
    }
}

/// Finds the first ADTS header that is followed by another one, or that
/// runs up to the end of the buffer.
fn find_header(bytes: &[u8]) -> Option<AdtsHeader> {
    let start = id3v2_len(bytes).unwrap_or_default();

    (start..bytes.len()).find_map(|offset| {
        let header = AdtsHeader::parse(&bytes[offset..])?;
        let next = offset + header.frame_len;
        if next + 6 > bytes.len() || AdtsHeader::parse(&bytes[next..]).is_some() {
            Some(header)
        } else {
            None
        }
    })
}

pub fn parse(bytes: &[u8]) -> Outcome {
    let Some(header) = find_header(bytes) else {
        warn!("no ADTS header in {} bytes, sample rate unknown", bytes.len());
        return Outcome::Done(FormatInfo::default());
    };

    // channel configuration 0 means it is signalled in-band
    let channels = (header.channels > 0).then_some(header.channels);
    trace!("ADTS: {} Hz, {channels:?} channels", header.samplerate);

    Outcome::Done(FormatInfo {
        samplerate: Some(header.samplerate),
        channels,
        ..Default::default()
    })
}
