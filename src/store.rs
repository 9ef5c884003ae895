//! Track and playlist records, and the store that owns them.
//!
//! Records are identified by their URL. The scanner fetches or creates a
//! record when a resolution starts, fills it in as headers are parsed, and
//! deletes it again when the URL turns out to be unusable. A playlist is a
//! track record that additionally holds an ordered list of entry URLs.
//!
//! The store itself is a collaborator of the scanner: [`MemoryStore`] keeps
//! records in process memory and is what the command line and the tests
//! use, a player would plug in its library database instead.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use url::Url;

/// What a decoder should do to obtain the stream header it needs before
/// the first audio byte.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InitialBlock {
    /// The format needs no header block.
    #[default]
    None,

    /// Header bytes captured while scanning, to be reused as-is.
    Header(Bytes),

    /// The header could not be captured in a single pass and has to be
    /// derived again on every seek.
    Recompute,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackRecord {
    pub url: Url,
    pub title: Option<String>,
    pub content_type: Option<String>,

    /// Average bitrate in bits per second.
    pub bitrate: Option<u32>,
    pub vbr: bool,

    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub duration: Option<Duration>,

    pub samplerate: Option<u32>,
    pub samplesize: Option<u16>,
    pub channels: Option<u16>,
    pub block_align: Option<u32>,
    pub big_endian: Option<bool>,

    /// Byte offset of the first audio byte.
    pub audio_offset: Option<u64>,
    pub audio_size: Option<u64>,
    pub content_length: Option<u64>,

    /// Selected WMA stream and the stream carrying title updates.
    pub wma_stream: Option<u16>,
    pub wma_command_stream: Option<u16>,

    pub lossless: bool,

    #[serde(skip)]
    pub initial_block: InitialBlock,

    /// The URL this record replaced after a redirect.
    pub redir: Option<Url>,
    pub error: Option<String>,
}

impl TrackRecord {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            title: None,
            content_type: None,
            bitrate: None,
            vbr: false,
            duration: None,
            samplerate: None,
            samplesize: None,
            channels: None,
            block_align: None,
            big_endian: None,
            audio_offset: None,
            audio_size: None,
            content_length: None,
            wma_stream: None,
            wma_command_stream: None,
            lossless: false,
            initial_block: InitialBlock::None,
            redir: None,
            error: None,
        }
    }

    /// Whether the title is missing or merely the URL itself.
    #[must_use]
    pub fn has_placeholder_title(&self) -> bool {
        self.title
            .as_deref()
            .is_none_or(|title| title.is_empty() || title == self.url.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlaylistRecord {
    #[serde(flatten)]
    pub track: TrackRecord,

    /// Entry URLs in playlist order.
    pub entries: Vec<Url>,
}

pub trait Store: Send + Sync {
    /// Returns the record for `url`, creating an empty one if needed.
    fn fetch_or_create(&self, url: &Url) -> TrackRecord;

    fn get(&self, url: &Url) -> Option<TrackRecord>;

    /// Writes `record` back, creating it if it was deleted in the meantime.
    fn update(&self, record: &TrackRecord);

    /// Deletes the record and, for playlists, its entry list.
    fn delete(&self, url: &Url);

    /// Returns the record for `url` together with its entries, if it has
    /// been made a playlist.
    fn playlist(&self, url: &Url) -> Option<PlaylistRecord>;

    /// Makes the record for `url` a playlist with `entries`.
    fn set_entries(&self, url: &Url, entries: Vec<Url>);

    /// Substitutes `old` by `new` in the entries of `playlist`, keeping
    /// its position.
    fn replace_entry(&self, playlist: &Url, old: &Url, new: &Url) {
        if let Some(record) = self.playlist(playlist) {
            let entries = record
                .entries
                .into_iter()
                .map(|entry| if entry == *old { new.clone() } else { entry })
                .collect();
            self.set_entries(playlist, entries);
        }
    }
}

#[derive(Debug)]
struct Stored {
    track: TrackRecord,
    entries: Option<Vec<Url>>,
}

/// Record store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Url, Stored>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn fetch_or_create(&self, url: &Url) -> TrackRecord {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(url.clone())
            .or_insert_with(|| Stored {
                track: TrackRecord::new(url.clone()),
                entries: None,
            })
            .track
            .clone()
    }

    fn get(&self, url: &Url) -> Option<TrackRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(url).map(|stored| stored.track.clone())
    }

    fn update(&self, record: &TrackRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&record.url) {
            Some(stored) => stored.track = record.clone(),
            None => {
                records.insert(
                    record.url.clone(),
                    Stored {
                        track: record.clone(),
                        entries: None,
                    },
                );
            }
        }
    }

    fn delete(&self, url: &Url) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.remove(url).is_some() {
            trace!("deleted record {url}");
        }
    }

    fn playlist(&self, url: &Url) -> Option<PlaylistRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = records.get(url)?;
        let entries = stored.entries.clone()?;
        Some(PlaylistRecord {
            track: stored.track.clone(),
            entries,
        })
    }

    fn set_entries(&self, url: &Url, entries: Vec<Url>) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(url.clone())
            .or_insert_with(|| Stored {
                track: TrackRecord::new(url.clone()),
                entries: None,
            })
            .entries = Some(entries);
    }
}
