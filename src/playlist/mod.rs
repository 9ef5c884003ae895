//! Playlist expansion.
//!
//! Every entry of a playlist is resolved in a task of its own, entry `i`
//! starting `i` stagger units after the first so that the first entry wins
//! when servers are equally fast. The playlist resolves as soon as one
//! entry turns out to be playable; the other entries keep resolving in the
//! background and their results end up in the store. Only when every
//! entry has failed does the playlist fail, with the last error seen.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use url::Url;

use crate::{
    cache::icon_key,
    content_type::is_audio,
    error::{Error, Result},
    scanner::{Resolved, ScanRequest, Scanner, MAX_DEPTH},
    store::{PlaylistRecord, Store, TrackRecord},
};

pub mod feed;
pub mod parse;

pub use parse::Entry;

/// Completion state shared by the entry tasks of one playlist.
struct Race {
    playlist: Url,
    scanned: usize,
    total: usize,

    /// Set once the playlist has been reported.
    ready: bool,
    last_error: Option<Error>,
    tx: Option<oneshot::Sender<Result<PlaylistRecord>>>,
}

impl Race {
    fn report(&mut self, result: Result<PlaylistRecord>) {
        if let Some(tx) = self.tx.take() {
            // The receiver is gone when the caller stopped waiting.
            let _ = tx.send(result);
        }
    }
}

/// Stores `entries` as the entries of the playlist `record`, then resolves
/// them until the first playable one.
pub(crate) async fn resolve(
    scanner: &Scanner,
    request: &ScanRequest,
    record: TrackRecord,
    entries: Vec<Entry>,
) -> Result<Resolved> {
    let store = scanner.store();
    let playlist = record.url.clone();

    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let url = match playlist.join(&entry.url) {
            Ok(url) if scanner.registry().is_remote(&url) => url,
            Ok(_) | Err(_) => {
                debug!("skipping playlist entry {} of {playlist}", entry.url);
                continue;
            }
        };

        if let Some(icon) = entry.icon {
            let icon = playlist.join(&icon).map_or(icon, String::from);
            scanner.cache().set(&icon_key(url.as_str()), icon);
        }

        children.push((url, entry.title));
    }

    if children.is_empty() {
        store.delete(&playlist);
        return Err(Error::playlist_empty(format!(
            "no playlist items found in {playlist}"
        )));
    }

    store.update(&record);
    store.set_entries(&playlist, children.iter().map(|(url, _)| url.clone()).collect());

    let (tx, rx) = oneshot::channel();
    let race = Arc::new(Mutex::new(Race {
        playlist: playlist.clone(),
        scanned: 0,
        total: children.len(),
        ready: false,
        last_error: None,
        tx: Some(tx),
    }));

    let stagger = scanner.config().stagger;
    for (i, (url, title)) in children.into_iter().enumerate() {
        let delay = stagger.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
        let child = request.child(&url).with_title(title).with_delay(delay);

        let scanner = scanner.clone();
        let race = Arc::clone(&race);
        tokio::spawn(async move {
            // A scan that panics still counts as a failed entry.
            let result = match tokio::spawn(scanner.resolve(child)).await {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("scan of {url} aborted: {e}"))),
            };
            let mut race = race.lock().unwrap_or_else(PoisonError::into_inner);
            completed(scanner.store().as_ref(), &mut race, &url, result);
        });
    }

    // Only the entry tasks may keep the sender alive.
    drop(race);
    let playlist = rx.await??;
    info!(
        "resolved playlist {} with {} entries",
        playlist.track.url,
        playlist.entries.len()
    );
    Ok(Resolved::Playlist(playlist))
}

/// Accounts for the entry `entry` having resolved to `result`.
fn completed(store: &dyn Store, race: &mut Race, entry: &Url, result: Result<Resolved>) {
    race.scanned += 1;

    match result {
        Ok(resolved) => {
            if resolved.url() != entry {
                trace!("{entry} of {} is now {}", race.playlist, resolved.url());
                store.replace_entry(&race.playlist, entry, resolved.url());
            }

            if !race.ready {
                if let Some(track) = playable(store, &resolved) {
                    race.ready = true;
                    let result = adopt(store, &race.playlist, &track);
                    race.report(result);
                }
            }
        }
        Err(e) => {
            debug!("entry {entry} of {} failed: {e}", race.playlist);
            race.last_error = Some(e);
        }
    }

    if !race.ready && race.scanned == race.total {
        warn!("no playable entry in {}", race.playlist);
        store.delete(&race.playlist);

        let error = race.last_error.take().unwrap_or_else(|| {
            Error::playlist_empty(format!("no playable items in {}", race.playlist))
        });
        race.report(Err(error));
    }
}

fn is_playable(track: &TrackRecord) -> bool {
    track.error.is_none() && track.content_type.as_deref().is_some_and(is_audio)
}

/// Returns the track that would be played first for `resolved`.
fn playable(store: &dyn Store, resolved: &Resolved) -> Option<TrackRecord> {
    match resolved {
        Resolved::Track(track) => is_playable(track).then(|| track.clone()),
        Resolved::Playlist(playlist) => next_playable(store, &playlist.track.url, 1),
    }
}

/// Walks nested playlists in the store for the first playable track.
fn next_playable(store: &dyn Store, url: &Url, depth: usize) -> Option<TrackRecord> {
    if depth >= MAX_DEPTH {
        return None;
    }

    match store.playlist(url) {
        Some(playlist) => playlist
            .entries
            .iter()
            .find_map(|entry| next_playable(store, entry, depth + 1)),
        None => store.get(url).filter(is_playable),
    }
}

/// Copies what the playlist is missing from its first playable track and
/// returns the refreshed playlist.
fn adopt(store: &dyn Store, url: &Url, track: &TrackRecord) -> Result<PlaylistRecord> {
    let mut playlist = store
        .playlist(url)
        .ok_or_else(|| Error::internal(format!("playlist {url} disappeared")))?;

    let record = &mut playlist.track;
    if record.bitrate.is_none() {
        record.bitrate = track.bitrate;
    }
    if record.has_placeholder_title() && !track.has_placeholder_title() {
        record.title.clone_from(&track.title);
    }
    store.update(record);

    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn audio(s: &str, bitrate: u32) -> TrackRecord {
        let mut track = TrackRecord::new(url(s));
        track.content_type = Some("mp3".to_owned());
        track.bitrate = Some(bitrate);
        track.title = Some(format!("Track at {bitrate}"));
        track
    }

    fn race(store: &MemoryStore, entries: &[&str]) -> (Race, oneshot::Receiver<Result<PlaylistRecord>>) {
        let playlist = url("http://a.example/list.m3u");
        store.fetch_or_create(&playlist);
        store.set_entries(&playlist, entries.iter().map(|entry| url(entry)).collect());

        let (tx, rx) = oneshot::channel();
        let race = Race {
            playlist,
            scanned: 0,
            total: entries.len(),
            ready: false,
            last_error: None,
            tx: Some(tx),
        };
        (race, rx)
    }

    #[test]
    fn first_playable_entry_wins() {
        let store = MemoryStore::new();
        let (mut race, mut rx) = race(&store, &["http://a.example/1", "http://a.example/2"]);

        let track = audio("http://a.example/1", 128_000);
        store.update(&track);
        completed(&store, &mut race, &url("http://a.example/1"), Ok(Resolved::Track(track)));

        let playlist = rx.try_recv().unwrap().unwrap();
        assert_eq!(playlist.track.bitrate, Some(128_000));
        assert_eq!(playlist.track.title.as_deref(), Some("Track at 128000"));

        completed(
            &store,
            &mut race,
            &url("http://a.example/2"),
            Err(Error::transport("refused")),
        );
        assert!(store.playlist(&url("http://a.example/list.m3u")).is_some());
    }

    #[test]
    fn redirected_entries_are_spliced() {
        let store = MemoryStore::new();
        let (mut race, mut rx) = race(&store, &["http://a.example/1", "http://a.example/2"]);

        let track = audio("http://cdn.example/1", 64_000);
        store.update(&track);
        completed(&store, &mut race, &url("http://a.example/1"), Ok(Resolved::Track(track)));

        let playlist = rx.try_recv().unwrap().unwrap();
        assert_eq!(
            playlist.entries,
            vec![url("http://cdn.example/1"), url("http://a.example/2")]
        );
    }

    #[test]
    fn fails_with_last_error_when_nothing_plays() {
        let store = MemoryStore::new();
        let (mut race, mut rx) = race(&store, &["http://a.example/1", "http://a.example/2"]);

        let mut page = TrackRecord::new(url("http://a.example/1"));
        page.content_type = Some("html".to_owned());
        completed(&store, &mut race, &url("http://a.example/1"), Ok(Resolved::Track(page)));
        assert!(rx.try_recv().is_err());

        completed(
            &store,
            &mut race,
            &url("http://a.example/2"),
            Err(Error::transport("refused")),
        );
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
        assert!(store.get(&url("http://a.example/list.m3u")).is_none());
    }

    #[test]
    fn nested_playlists_are_walked() {
        let store = MemoryStore::new();
        let inner = url("http://a.example/inner.pls");
        store.fetch_or_create(&inner);
        store.set_entries(&inner, vec![url("http://a.example/dead"), url("http://a.example/live")]);
        store.update(&audio("http://a.example/live", 96_000));

        let found = next_playable(&store, &inner, 1).unwrap();
        assert_eq!(found.url, url("http://a.example/live"));
    }
}
