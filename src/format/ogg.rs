//! Ogg sniffing.
//!
//! Ogg carries Vorbis, FLAC and Opus alike, and the player needs a
//! different decoder for each. The codec is identified from the magic bytes
//! at the start of the first packet, which begins right after the page
//! header and its segment table. Anything unrecognized is left as Vorbis.

use super::{estimate_bitrate, FormatInfo, Outcome, ParseContext, ReadBytes};

pub const READ_LIMIT: usize = 64;

const PAGE_HEADER_LEN: usize = 27;

/// Offset of the first packet in the first page.
fn payload_offset(bytes: &[u8]) -> usize {
    PAGE_HEADER_LEN + usize::from(bytes.u8_at(PAGE_HEADER_LEN - 1).unwrap_or_default())
}

/// Ogg FLAC mapping header followed by the native `fLaC` STREAMINFO block.
fn parse_flac(packet: &[u8]) -> Option<FormatInfo> {
    if packet.get(..5)? != b"\x7fFLAC" || packet.get(9..13)? != b"fLaC" {
        return None;
    }

    // STREAMINFO starts at 13 with a 4 byte block header, the packed sample
    // rate, channels and bits per sample follow 10 bytes into its data.
    let rate_hi = u32::from(packet.u8_at(27).unwrap_or_default());
    let rate_mid = u32::from(packet.u8_at(28).unwrap_or_default());
    let packed = packet.u8_at(29).unwrap_or_default();
    let bits_lo = packet.u8_at(30).unwrap_or_default();

    let samplerate = (rate_hi << 12) | (rate_mid << 4) | u32::from(packed >> 4);
    let channels = u16::from((packed >> 1) & 0x07) + 1;
    let samplesize = u16::from(((packed & 0x01) << 4) | (bits_lo >> 4)) + 1;

    Some(FormatInfo {
        content_type: Some("ogf"),
        samplerate: Some(samplerate),
        samplesize: Some(samplesize),
        channels: Some(channels),
        bitrate: Some(estimate_bitrate(samplerate, samplesize, channels)),
        lossless: true,
        ..Default::default()
    })
}

fn parse_opus(packet: &[u8]) -> Option<FormatInfo> {
    if packet.get(..8)? != b"OpusHead" {
        return None;
    }

    Some(FormatInfo {
        content_type: Some("ops"),
        channels: packet.u8_at(9).map(u16::from),
        samplerate: packet.le_u32(12),
        samplesize: Some(16),
        ..Default::default()
    })
}

pub fn parse(bytes: &[u8], context: &ParseContext) -> Outcome {
    let packet = bytes.get(payload_offset(bytes)..).unwrap_or_default();

    let info = parse_flac(packet)
        .or_else(|| parse_opus(packet))
        .unwrap_or_default();
    if let Some(content_type) = info.content_type {
        debug!("{} is Ogg {content_type}", context.url);
    }

    Outcome::Done(info)
}
