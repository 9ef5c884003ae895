//! Content type classification of remote responses.
//!
//! Stream servers are notoriously sloppy with `Content-Type`: playlists are
//! served as `text/html`, WMA streams as `text/plain` and just about
//! anything as `application/octet-stream`. The classifier maps the MIME type
//! to a canonical lowercase tag (`mp3`, `m3u`, `wma`, ...) and then corrects
//! it from the URL, but only where the MIME type is known to be unreliable.
//!
//! Icecast and Shoutcast servers additionally describe the stream in
//! non-standard `icy-*` and `ice-*` headers, see [`IcyInfo`].

use std::sync::LazyLock;

use regex_lite::Regex;
use url::Url;

use crate::http::Response;

/// MIME types and the tag they map to. Unknown types pass through as-is.
const MIME_TYPES: &[(&str, &str)] = &[
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/mpeg3", "mp3"),
    ("audio/mpg", "mp3"),
    ("audio/x-mpeg", "mp3"),
    ("audio/x-mp3", "mp3"),
    ("audio/aac", "aac"),
    ("audio/aacp", "aac"),
    ("audio/x-aac", "aac"),
    ("audio/mp4", "mp4"),
    ("audio/m4a", "mp4"),
    ("audio/x-m4a", "mp4"),
    ("video/mp4", "mp4"),
    ("audio/flac", "flc"),
    ("audio/x-flac", "flc"),
    ("audio/wav", "wav"),
    ("audio/wave", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/aiff", "aif"),
    ("audio/x-aiff", "aif"),
    ("application/ogg", "ogg"),
    ("audio/ogg", "ogg"),
    ("audio/x-ogg", "ogg"),
    ("audio/vorbis", "ogg"),
    ("audio/opus", "ops"),
    ("audio/x-ms-wma", "wma"),
    ("audio/asf", "wma"),
    ("application/vnd.ms.wms-hdr.asfv1", "wma"),
    ("application/x-mms-framed", "wma"),
    ("video/x-ms-asf", "asx"),
    ("audio/x-ms-wax", "asx"),
    ("video/x-ms-wvx", "asx"),
    ("audio/x-mpegurl", "m3u"),
    ("audio/mpegurl", "m3u"),
    ("application/x-mpegurl", "m3u"),
    ("application/vnd.apple.mpegurl", "m3u"),
    ("audio/x-scpls", "pls"),
    ("audio/scpls", "pls"),
    ("application/pls+xml", "pls"),
    ("application/vnd.ms-wpl", "wpl"),
    ("application/xspf+xml", "xspf"),
    ("text/x-opml", "opml"),
    ("text/x-opml+xml", "opml"),
    ("application/json", "json"),
    ("text/html", "html"),
    ("text/plain", "txt"),
    ("application/octet-stream", "octet-stream"),
];

/// File extensions and the tag they map to.
const EXTENSIONS: &[(&str, &str)] = &[
    ("mp3", "mp3"),
    ("mp2", "mp3"),
    ("aac", "aac"),
    ("m4a", "mp4"),
    ("m4b", "mp4"),
    ("mp4", "mp4"),
    ("flac", "flc"),
    ("flc", "flc"),
    ("wav", "wav"),
    ("aif", "aif"),
    ("aiff", "aif"),
    ("ogg", "ogg"),
    ("oga", "ogg"),
    ("opus", "ops"),
    ("wma", "wma"),
    ("asf", "wma"),
    ("asx", "asx"),
    ("wax", "asx"),
    ("wvx", "asx"),
    ("m3u", "m3u"),
    ("m3u8", "m3u"),
    ("pls", "pls"),
    ("wpl", "wpl"),
    ("xspf", "xspf"),
    ("opml", "opml"),
];

/// Extensions that override a `text/html` or `text/plain` response.
const TEXT_OVERRIDES: &[&str] = &["asx", "m3u", "pls", "wpl", "wma"];

const PLAYLIST_TYPES: &[&str] = &["m3u", "pls", "asx", "wpl", "xspf", "opml", "json"];

const AUDIO_TYPES: &[&str] = &[
    "mp3", "aac", "mp4", "alc", "sls", "flc", "wav", "aif", "ogg", "ogf", "ops", "wma",
];

static EXTENSION_SEARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.([a-z0-9]+)\b").expect("invalid extension pattern"));

/// Maps a MIME type to its tag, passing unknown types through lowercased.
///
/// Parameters such as `; charset=utf-8` are ignored, as are further values
/// of a comma-separated list.
#[must_use]
pub fn mime_to_type(mime: &str) -> String {
    let mime = mime
        .split([',', ';'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    MIME_TYPES
        .iter()
        .find(|(known, _)| *known == mime)
        .map_or(mime, |(_, tag)| (*tag).to_owned())
}

/// Returns the lowercased extension of the last path segment of `url`.
#[must_use]
pub fn url_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, extension) = segment.rsplit_once('.')?;
    if extension.is_empty() {
        None
    } else {
        Some(extension.to_ascii_lowercase())
    }
}

fn extension_to_type(extension: &str) -> Option<&'static str> {
    EXTENSIONS
        .iter()
        .find(|(known, _)| *known == extension)
        .map(|(_, tag)| *tag)
}

/// Maps the extension of `url` to a tag.
#[must_use]
pub fn type_from_url(url: &Url) -> Option<&'static str> {
    url_extension(url).and_then(|extension| extension_to_type(&extension))
}

/// Looks for any recognized extension anywhere in `url`.
fn search_url(url: &Url) -> Option<&'static str> {
    let haystack = url.as_str().to_ascii_lowercase();
    EXTENSION_SEARCH
        .captures_iter(&haystack)
        .filter_map(|captures| captures.get(1))
        .find_map(|extension| extension_to_type(extension.as_str()))
}

/// Resolves the canonical tag of a response.
///
/// * `content_type` - first value of the `Content-Type` header, if any
/// * `url` - the URL the response was served for
/// * `icy` - whether the response carried an `icy-name` header
///
/// Returns `None` when there is nothing to go by.
#[must_use]
pub fn classify(content_type: Option<&str>, url: &Url, icy: bool) -> Option<String> {
    let Some(mime) = content_type.filter(|mime| !mime.trim().is_empty()) else {
        // Shoutcast servers do not always bother with a content type.
        if icy {
            return Some("mp3".to_owned());
        }
        return type_from_url(url).map(str::to_owned);
    };

    let mut tag = mime_to_type(mime);
    let extension = url_extension(url);
    let extension = extension.as_deref();
    let is_text = |tag: &str| tag.contains("html") || tag.contains("txt");

    if tag == "mp3" || tag == "txt" {
        match extension {
            Some("aac") => tag = "aac".to_owned(),
            Some("m4a" | "mp4") => tag = "mp4".to_owned(),
            _ => {}
        }
    }

    if is_text(&tag) {
        if let Some(extension) = extension.filter(|ext| TEXT_OVERRIDES.contains(ext)) {
            tag = extension.to_owned();
        }
    }

    // Misconfigured servers serve M3U playlists as WMA.
    if tag == "wma" && extension == Some("m3u") {
        tag = "m3u".to_owned();
    }

    if is_text(&tag) {
        tag = "m3u".to_owned();
    }

    if tag.contains("octet-stream") {
        if let Some(found) = search_url(url) {
            tag = found.to_owned();
        }
    }

    Some(tag)
}

/// Whether `tag` names a playlist format.
#[must_use]
pub fn is_playlist(tag: &str) -> bool {
    PLAYLIST_TYPES.contains(&tag)
}

/// Whether `tag` names a playable audio format.
#[must_use]
pub fn is_audio(tag: &str) -> bool {
    AUDIO_TYPES.contains(&tag)
}

/// Stream description from Icecast/Shoutcast response headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IcyInfo {
    pub name: Option<String>,

    /// Bitrate in bits per second.
    pub bitrate: Option<u32>,
    pub samplerate: Option<u32>,
    pub channels: Option<u16>,
}

impl IcyInfo {
    /// Nominal Vorbis bitrates for `ice-quality` 0 through 10.
    pub const QUALITY_BITRATES: [u32; 11] = [
        64_000, 80_000, 96_000, 112_000, 128_000, 160_000, 192_000, 224_000, 256_000, 320_000,
        500_000,
    ];

    #[must_use]
    pub fn from_response(response: &Response) -> Self {
        let mut info = Self {
            name: response
                .header("icy-name")
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
            bitrate: response
                .header("icy-br")
                .or_else(|| response.header("x-audiocast-bitrate"))
                .and_then(Self::parse_kbps),
            ..Default::default()
        };

        if let Some(audio_info) = response.header("ice-audio-info") {
            info.merge_audio_info(audio_info);
        }

        info
    }

    /// Parses `128` or `128,128` as kilobits, passing through values that
    /// are already in bits.
    fn parse_kbps(value: &str) -> Option<u32> {
        let value: u32 = value.split(',').next()?.trim().parse().ok()?;
        match value {
            0 => None,
            1..1000 => Some(value * 1000),
            _ => Some(value),
        }
    }

    /// Merges `ice-bitrate=128;ice-channels=2;ice-samplerate=44100`.
    fn merge_audio_info(&mut self, audio_info: &str) {
        for pair in audio_info.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "ice-bitrate" | "bitrate" => {
                    if self.bitrate.is_none() {
                        self.bitrate = Self::parse_kbps(value);
                    }
                }
                "ice-quality" | "quality" => {
                    if self.bitrate.is_none() {
                        self.bitrate = Self::quality_bitrate(value);
                    }
                }
                "ice-samplerate" | "samplerate" => self.samplerate = value.parse().ok(),
                "ice-channels" | "channels" => self.channels = value.parse().ok(),
                _ => {}
            }
        }
    }

    fn quality_bitrate(value: &str) -> Option<u32> {
        let quality = value.parse::<f32>().ok()?;
        if !quality.is_finite() {
            return None;
        }

        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = quality.round().clamp(0.0, 10.0) as usize;
        Some(Self::QUALITY_BITRATES[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Chunks;
    use http::{HeaderMap, HeaderValue, StatusCode};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn tag(mime: Option<&str>, s: &str) -> Option<String> {
        classify(mime, &url(s), false)
    }

    #[test]
    fn text_types_take_extension() {
        for ext in ["asx", "m3u", "pls", "wpl", "wma"] {
            let u = format!("http://example.com/list.{ext}");
            assert_eq!(tag(Some("text/html"), &u).as_deref(), Some(ext));
            assert_eq!(tag(Some("text/plain"), &u).as_deref(), Some(ext));
        }
    }

    #[test]
    fn text_without_extension_defaults_to_m3u() {
        assert_eq!(
            tag(Some("text/html; charset=utf-8"), "http://example.com/listen").as_deref(),
            Some("m3u")
        );
    }

    #[test]
    fn mpeg_with_aac_or_mp4_extension() {
        assert_eq!(
            tag(Some("audio/mpeg"), "http://example.com/a.aac").as_deref(),
            Some("aac")
        );
        assert_eq!(
            tag(Some("text/plain"), "http://example.com/a.m4a").as_deref(),
            Some("mp4")
        );
    }

    #[test]
    fn wma_served_m3u() {
        assert_eq!(
            tag(Some("audio/x-ms-wma"), "http://example.com/list.m3u").as_deref(),
            Some("m3u")
        );
    }

    #[test]
    fn unambiguous_types_are_not_overridden() {
        assert_eq!(
            tag(Some("audio/mpeg"), "http://example.com/list.m3u").as_deref(),
            Some("mp3")
        );
    }

    #[test]
    fn octet_stream_searches_url() {
        assert_eq!(
            tag(
                Some("application/octet-stream"),
                "http://example.com/stream.ogg?session=1"
            )
            .as_deref(),
            Some("ogg")
        );
        assert_eq!(
            tag(Some("application/octet-stream"), "http://example.com/stream").as_deref(),
            Some("octet-stream")
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        assert_eq!(
            tag(Some("Audio/X-Unknown"), "http://example.com/a").as_deref(),
            Some("audio/x-unknown")
        );
    }

    #[test]
    fn icy_without_content_type_is_mp3() {
        assert_eq!(
            classify(None, &url("http://example.com/live"), true).as_deref(),
            Some("mp3")
        );
        assert_eq!(classify(None, &url("http://example.com/live"), false), None);
    }

    #[test]
    fn predicates() {
        assert!(is_playlist("pls"));
        assert!(!is_playlist("mp3"));
        assert!(is_audio("ops"));
        assert!(!is_audio("html"));
    }

    fn icy(headers: &[(&'static str, &'static str)]) -> IcyInfo {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        let response = Response::new(
            url("http://example.com/live"),
            StatusCode::OK,
            map,
            Chunks::default(),
        );
        IcyInfo::from_response(&response)
    }

    #[test]
    fn icy_bitrate_in_kbps() {
        let info = icy(&[("icy-br", "128,128"), ("icy-name", "Radio")]);
        assert_eq!(info.bitrate, Some(128_000));
        assert_eq!(info.name.as_deref(), Some("Radio"));
    }

    #[test]
    fn ice_audio_info() {
        let info = icy(&[(
            "ice-audio-info",
            "ice-samplerate=44100;ice-bitrate=96;ice-channels=2",
        )]);
        assert_eq!(info.bitrate, Some(96_000));
        assert_eq!(info.samplerate, Some(44_100));
        assert_eq!(info.channels, Some(2));
    }

    #[test]
    fn ice_quality_table() {
        assert_eq!(
            icy(&[("ice-audio-info", "ice-quality=0")]).bitrate,
            Some(64_000)
        );
        assert_eq!(
            icy(&[("ice-audio-info", "ice-quality=10.00")]).bitrate,
            Some(500_000)
        );
    }
}
