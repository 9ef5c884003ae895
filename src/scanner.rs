//! Resolution of remote URLs into tracks and playlists.
//!
//! A [`Scanner`] takes a [`ScanRequest`] through these steps:
//! 1. Validate the URL and the playlist nesting depth
//! 2. Fetch or create the record for the URL
//! 3. Let a protocol handler take over, or short-circuit URLs that are
//!    known to be audio without asking the network
//! 4. Request the URL, follow redirects and classify the response
//! 5. Read just enough of the body to either parse the audio header or
//!    expand the playlist
//!
//! Records of URLs that turn out to be unusable are deleted before the
//! error is returned. Every request resolves exactly once, to either a
//! [`Resolved`] value or an [`Error`].
//!
//! # Example
//!
//! ```ignore
//! let scanner = Scanner::new(config, transport, store, cache, Registry::new());
//! match scanner.resolve(ScanRequest::new("http://radio.example.com/listen.pls")).await? {
//!     Resolved::Track(track) => println!("{} at {:?} bps", track.url, track.bitrate),
//!     Resolved::Playlist(playlist) => println!("{} entries", playlist.entries.len()),
//! }
//! ```

use std::{fmt, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    auth::BasicAuth,
    buffer::BufferState,
    cache::Cache,
    config::Config,
    content_type::{classify, is_playlist, type_from_url, IcyInfo},
    error::{Error, ErrorKind, Result},
    format::{asf, Outcome, ParseContext, Parser, ReadMode},
    http::{Response, Transport},
    playlist::{self, parse},
    redirect::{is_material_redirect, is_mms, Fetcher},
    registry::Registry,
    store::{InitialBlock, PlaylistRecord, Store, TrackRecord},
};

/// Playlists nested this deep are not expanded.
pub const MAX_DEPTH: usize = 7;

/// One URL to resolve.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub url: String,

    /// Playlist nesting level, zero for URLs resolved on their own.
    pub depth: usize,

    /// Title to give a new record, such as the one a playlist declared.
    pub title: Option<String>,

    /// Time to wait before the request is sent.
    pub delay: Duration,

    /// Cancelled when the caller is no longer interested.
    pub cancel: CancellationToken,
}

impl ScanRequest {
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            title: None,
            delay: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A request for an entry of the playlist this request resolved to.
    /// Cancelling this request cancels the child as well.
    #[must_use]
    pub fn child(&self, url: &Url) -> Self {
        Self {
            url: url.to_string(),
            depth: self.depth + 1,
            title: None,
            delay: Duration::ZERO,
            cancel: self.cancel.child_token(),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("{} was abandoned", self.url)));
        }

        Ok(())
    }

    /// Sleeps for `duration` unless cancelled first.
    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => self.check_cancelled(),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// What a URL resolved to.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resolved {
    Track(TrackRecord),
    Playlist(PlaylistRecord),
}

impl Resolved {
    #[must_use]
    pub fn track(&self) -> &TrackRecord {
        match self {
            Self::Track(track) => track,
            Self::Playlist(playlist) => &playlist.track,
        }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.track().url
    }
}

struct Inner {
    config: Config,
    fetcher: Fetcher,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    registry: Registry,
}

/// Resolves remote URLs. Cloning is cheap and clones share everything.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<Inner>,
}

impl Scanner {
    #[must_use]
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        registry: Registry,
    ) -> Self {
        let fetcher = Fetcher::new(transport, Arc::clone(&cache), config.max_redirects);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                store,
                cache,
                registry,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.inner.cache
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Resolves `request` into a track or a playlist.
    ///
    /// Playlists resolve as soon as their first playable entry does. The
    /// other entries keep resolving in the background.
    ///
    /// # Errors
    ///
    /// * `NoUrl` or `InvalidUrl` when the URL cannot be scanned
    /// * `NestedTooDeep` when playlists nest [`MAX_DEPTH`] levels deep
    /// * `Transport` when the server cannot be reached
    /// * `ParseFailure` when the stream header is unusable
    /// * `PlaylistEmpty` when no playlist entry could be resolved
    /// * `Cancelled` when the request was cancelled
    pub fn resolve(&self, request: ScanRequest) -> BoxFuture<'static, Result<Resolved>> {
        let scanner = self.clone();
        Box::pin(async move { scanner.scan(request).await })
    }

    fn validate(&self, request: &ScanRequest) -> Result<Url> {
        let raw = request.url.trim();
        if raw.is_empty() {
            return Err(Error::no_url("empty url"));
        }

        let url = Url::parse(raw).map_err(|e| Error::invalid_url(format!("{raw}: {e}")))?;
        if !self.inner.registry.is_remote(&url) {
            return Err(Error::invalid_url(format!("{url} is not a remote url")));
        }

        if request.depth >= MAX_DEPTH {
            return Err(Error::nested_too_deep(format!(
                "{url} is nested {} playlists deep",
                request.depth
            )));
        }

        Ok(url)
    }

    async fn scan(&self, request: ScanRequest) -> Result<Resolved> {
        let url = self.validate(&request)?;
        request.check_cancelled()?;

        let store = self.store();
        let mut record = store.fetch_or_create(&url);
        if record.title.is_none() || (record.has_placeholder_title() && request.title.is_some()) {
            record.title = Some(request.title.clone().unwrap_or_else(|| url.to_string()));
            store.update(&record);
        }

        if let Some(handler) = self.inner.registry.handler(url.scheme()) {
            if handler.has_custom_scan() {
                debug!("{} handler scans {url}", url.scheme());
                return handler.scan(self, request).await;
            }

            if handler.is_audio(&url) {
                record.content_type = Some(type_from_url(&url).unwrap_or("mp3").to_owned());
                return self.succeed(&request, record, false).await;
            }
        }

        if is_mms(&url) && !self.config().mms_direct_streaming {
            record.content_type = Some("wma".to_owned());
            return self.succeed(&request, record, false).await;
        }

        if !request.delay.is_zero() {
            trace!("delaying {url} by {:?}", request.delay);
            request.pause(request.delay).await?;
        }

        let response = match self.inner.fetcher.fetch(&url, None).await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_failed(record, e)),
        };
        request.check_cancelled()?;
        trace!("{response:#?}");

        let mut record = self.follow_redirect(record, &response.url);
        let has_credentials = BasicAuth::from_url(&url).is_some();

        let icy = IcyInfo::from_response(&response);
        let tag = classify(
            response.header(CONTENT_TYPE),
            &response.url,
            icy.name.is_some(),
        );
        debug!("{} is {}", record.url, tag.as_deref().unwrap_or("of unknown type"));

        record.content_type.clone_from(&tag);
        record.content_length = response.total_length();
        set_if_some(&mut record.bitrate, icy.bitrate);
        set_if_some(&mut record.samplerate, icy.samplerate);
        set_if_some(&mut record.channels, icy.channels);
        if let Some(name) = icy.name {
            if record.has_placeholder_title() {
                record.title = Some(name);
            }
        }

        let Some(tag) = tag else {
            return self.succeed(&request, record, has_credentials).await;
        };

        if is_playlist(&tag) {
            return self
                .scan_playlist(&request, record, response, &tag, has_credentials)
                .await;
        }

        match Parser::for_type(&tag) {
            Some(parser) => {
                let state = BufferState::new(self.budget(parser));
                let outcome = self
                    .read_header(&request, &mut record, response, parser, state, icy.bitrate)
                    .await?;
                self.conclude(&request, record, outcome, has_credentials)
                    .await
            }
            None => {
                trace!("no header parser for {tag}");
                self.succeed(&request, record, has_credentials).await
            }
        }
    }

    /// Moves `record` to the URL that was served, if that is a different
    /// stream.
    fn follow_redirect(&self, record: TrackRecord, served: &Url) -> TrackRecord {
        if !is_material_redirect(&record.url, served) {
            return record;
        }

        let store = self.store();
        let mut redirected = store.fetch_or_create(served);
        debug!("{} moved to {served}", record.url);

        redirected.redir = Some(record.url.clone());
        if redirected.has_placeholder_title() && !record.has_placeholder_title() {
            redirected.title = record.title;
        } else if redirected.title.is_none() {
            redirected.title = Some(served.to_string());
        }

        store.delete(&record.url);
        store.update(&redirected);
        redirected
    }

    fn budget(&self, parser: Parser) -> usize {
        match parser.read_mode() {
            ReadMode::Bounded(limit) | ReadMode::Streaming(Some(limit)) => limit,
            ReadMode::Streaming(None) => self.config().max_header_bytes,
        }
    }

    /// Feeds the body to `parser` until it decides, retrying from an offset
    /// at most once.
    async fn read_header(
        &self,
        request: &ScanRequest,
        record: &mut TrackRecord,
        mut response: Response,
        parser: Parser,
        mut state: BufferState,
        header_bitrate: Option<u32>,
    ) -> Result<Outcome> {
        let url = record.url.clone();
        let mut retried = false;

        loop {
            let context = ParseContext {
                url: &url,
                content_length: record.content_length,
                header_bitrate,
                max_wma_bitrate: self.config().max_wma_bitrate,
            };

            let outcome = match self.feed(request, &mut response, parser, &mut state, &context).await
            {
                Ok(outcome) => outcome,
                Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
                Err(e) => return Err(self.transport_failed(record.clone(), e)),
            };

            // Disconnect: the parser has seen all it needs.
            drop(response);

            match outcome {
                Outcome::Retry(offset) if parser.is_retryable() && !retried => {
                    request.check_cancelled()?;
                    debug!("reading {url} again from byte {offset}");

                    response = match self.inner.fetcher.fetch(&url, Some(offset)).await {
                        Ok(response) => response,
                        Err(e) => return Err(self.transport_failed(record.clone(), e)),
                    };
                    if record.content_length.is_none() {
                        record.content_length = response.total_length();
                    }

                    state = BufferState::at_offset(offset, self.budget(parser));
                    retried = true;
                }
                Outcome::Retry(offset) => {
                    return Ok(Outcome::Failed(Error::new(
                        ErrorKind::ParseFailure,
                        format!("{url} asks to be read again from byte {offset}"),
                    )));
                }
                Outcome::Done(mut info) => {
                    if retried {
                        info.initial_block = InitialBlock::Recompute;
                    }
                    return Ok(Outcome::Done(info));
                }
                outcome => return Ok(outcome),
            }
        }
    }

    /// Reads chunks into `state` and parses them according to the read
    /// mode of `parser`. Never returns `NeedMore`.
    async fn feed(
        &self,
        request: &ScanRequest,
        response: &mut Response,
        parser: Parser,
        state: &mut BufferState,
        context: &ParseContext<'_>,
    ) -> Result<Outcome> {
        let mode = parser.read_mode();

        loop {
            request.check_cancelled()?;

            match response.chunk().await? {
                Some(chunk) => state.push(&chunk),
                None => state.finish(),
            }

            if mode == ReadMode::Streaming(None) && state.is_exhausted() {
                debug!(
                    "no {parser:?} header in the first {} bytes of {}",
                    state.len(),
                    context.url
                );
                state.finish();
            }

            let ready = match mode {
                ReadMode::Bounded(_) => state.is_exhausted() || state.is_eof(),
                ReadMode::Streaming(_) => true,
            };
            if !ready {
                continue;
            }

            match parser.parse(state, context) {
                Outcome::NeedMore if state.is_eof() => {
                    return Ok(Outcome::Failed(Error::new(
                        ErrorKind::ParseFailure,
                        format!("{} ended before its {parser:?} header", context.url),
                    )));
                }
                Outcome::NeedMore => {}
                outcome => return Ok(outcome),
            }
        }
    }

    /// Turns the final parser outcome into the result of the scan.
    async fn conclude(
        &self,
        request: &ScanRequest,
        mut record: TrackRecord,
        outcome: Outcome,
        has_credentials: bool,
    ) -> Result<Resolved> {
        match outcome {
            Outcome::Done(info) => {
                info.apply_to(&mut record);
                clamp_audio_size(&mut record);
                self.succeed(request, record, has_credentials).await
            }
            Outcome::Failed(e) => {
                warn!("{} is unusable: {e}", record.url);
                self.store().delete(&record.url);
                Err(e)
            }
            Outcome::NeedMore | Outcome::Retry(_) => {
                self.store().delete(&record.url);
                Err(Error::internal(format!(
                    "header of {} left undecided",
                    record.url
                )))
            }
        }
    }

    /// Reads a playlist body and resolves its entries.
    async fn scan_playlist(
        &self,
        request: &ScanRequest,
        mut record: TrackRecord,
        mut response: Response,
        tag: &str,
        has_credentials: bool,
    ) -> Result<Resolved> {
        let mut state = BufferState::new(self.config().max_header_bytes);
        let mut sniffed = false;
        let mut is_stream = false;

        while !state.is_exhausted() {
            match response.chunk().await {
                Ok(Some(chunk)) => state.push(&chunk),
                Ok(None) => break,
                Err(e) => return Err(self.transport_failed(record, e)),
            }

            if !sniffed && state.len() >= asf::SNIFF_LEN {
                sniffed = true;
                // Windows Media servers answer playlist URLs with the stream.
                is_stream = tag == "asx" && asf::is_header(state.bytes());
                if is_stream {
                    state.set_budget(asf::READ_LIMIT);
                }
            }
        }
        state.finish();
        drop(response);

        if !sniffed {
            is_stream = tag == "asx" && asf::is_header(state.bytes());
        }
        if is_stream {
            debug!("{} is a WMA stream, not a playlist", record.url);
            record.content_type = Some("wma".to_owned());

            let url = record.url.clone();
            let context = ParseContext {
                url: &url,
                content_length: record.content_length,
                header_bitrate: None,
                max_wma_bitrate: self.config().max_wma_bitrate,
            };
            let outcome = Parser::Asf.parse(&mut state, &context);
            return self
                .conclude(request, record, outcome, has_credentials)
                .await;
        }

        let body = String::from_utf8_lossy(state.bytes());
        let tag = parse::detect(tag, &body);
        record.content_type = Some(tag.to_owned());

        let entries = parse::read(tag, &body);
        debug!("{} lists {} entries", record.url, entries.len());
        playlist::resolve(self, request, record, entries).await
    }

    /// Records a failed request on `record` and passes the error on.
    fn transport_failed(&self, mut record: TrackRecord, error: Error) -> Error {
        warn!("{}: {error}", record.url);
        record.error = Some(error.to_string());
        self.store().update(&record);
        error
    }

    async fn succeed(
        &self,
        request: &ScanRequest,
        mut record: TrackRecord,
        has_credentials: bool,
    ) -> Result<Resolved> {
        if has_credentials {
            // Servers allowing a single connection per account need the
            // scan connection closed before playback connects.
            request.pause(self.config().stagger).await?;
        }

        record.error = None;
        self.store().update(&record);
        info!(
            "resolved {} as {}",
            record.url,
            record.content_type.as_deref().unwrap_or("unknown")
        );
        Ok(Resolved::Track(record))
    }
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

fn set_if_some<T>(field: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *field = value;
    }
}

/// Limits the audio size to what the server says it has.
fn clamp_audio_size(record: &mut TrackRecord) {
    if let (Some(offset), Some(size), Some(total)) =
        (record.audio_offset, record.audio_size, record.content_length)
    {
        if offset.saturating_add(size) > total {
            let clamped = total.saturating_sub(offset);
            warn!(
                "{} declares {size} audio bytes at {offset} but has {total} bytes, using {clamped}",
                record.url
            );
            record.audio_size = Some(clamped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        cache::MemoryCache,
        format::mp4::tests::{aac_moov, ftyp},
        http::{Chunks, Request},
        store::MemoryStore,
    };
    use async_trait::async_trait;
    use http::{
        header::{CONTENT_LENGTH, RANGE},
        HeaderMap, HeaderValue, StatusCode,
    };

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(&self, request: Request) -> Result<Response> {
            panic!("unexpected request for {}", request.url);
        }
    }

    fn scanner(config: Config) -> (Scanner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scanner = Scanner::new(
            config,
            Arc::new(Unreachable),
            store.clone(),
            Arc::new(MemoryCache::default()),
            Registry::new(),
        );
        (scanner, store)
    }

    #[tokio::test]
    async fn rejects_bad_urls() {
        let (scanner, store) = scanner(Config::default());

        let err = scanner.resolve(ScanRequest::new("  ")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoUrl);

        let err = scanner.resolve(ScanRequest::new("not a url")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUrl);

        let err = scanner
            .resolve(ScanRequest::new("file:///music/song.mp3"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_URL");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn depth_limit() {
        let (scanner, store) = scanner(Config::default());
        let request = ScanRequest::new("http://radio.example.com/live").with_depth(MAX_DEPTH);
        let err = scanner.resolve(request).await.unwrap_err();
        assert_eq!(err.code(), "NESTED_TOO_DEEP");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn mms_without_direct_streaming() {
        let config = Config {
            mms_direct_streaming: false,
            ..Default::default()
        };
        let (scanner, _) = scanner(config);
        let resolved = scanner
            .resolve(ScanRequest::new("mms://media.example.com/live").with_title(Some("Live".to_owned())))
            .await
            .unwrap();
        let track = resolved.track();
        assert_eq!(track.content_type.as_deref(), Some("wma"));
        assert_eq!(track.title.as_deref(), Some("Live"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (scanner, _) = scanner(Config::default());
        let request = ScanRequest::new("http://radio.example.com/live");
        request.cancel.cancel();
        let err = scanner.resolve(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn child_requests_nest() {
        let parent = ScanRequest::new("http://a.example/list.pls").with_depth(2);
        let child = parent.child(&Url::parse("http://a.example/1.mp3").unwrap());
        assert_eq!(child.depth, 3);

        parent.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    /// Serves an MP4 file whose media data precedes its metadata.
    struct MdatFirst {
        head: Vec<u8>,
        moov_at: u64,
        requests: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl Transport for MdatFirst {
        async fn send(&self, request: Request) -> Result<Response> {
            let range = request.headers.get(RANGE).cloned();
            self.requests.lock().unwrap().push(request.clone());

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mp4"));
            let body = match range {
                None => {
                    let total = self.moov_at + aac_moov().len() as u64;
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
                    self.head.clone()
                }
                Some(range) => {
                    assert_eq!(range, format!("bytes={}-", self.moov_at).as_str());
                    aac_moov()
                }
            };

            Ok(Response::new(
                request.url,
                StatusCode::OK,
                headers,
                [body].into_iter().collect::<Chunks>(),
            ))
        }
    }

    #[tokio::test]
    async fn mp4_is_read_again_behind_media_data() {
        let mut head = ftyp();
        let mdat_at = head.len() as u64;
        head.extend_from_slice(&1_000_000u32.to_be_bytes());
        head.extend_from_slice(b"mdat");
        head.extend_from_slice(&[0; 256]);

        let transport = Arc::new(MdatFirst {
            head,
            moov_at: mdat_at + 1_000_000,
            requests: Mutex::default(),
        });
        let scanner = Scanner::new(
            Config::default(),
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
            Registry::new(),
        );

        let resolved = scanner
            .resolve(ScanRequest::new("http://a.example/song.m4a"))
            .await
            .unwrap();
        let track = resolved.track();
        assert_eq!(track.content_type.as_deref(), Some("mp4"));
        assert_eq!(track.bitrate, Some(128_000));
        assert_eq!(track.initial_block, InitialBlock::Recompute);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].headers.get(RANGE).is_none());
        assert!(requests[1].headers.get(RANGE).is_some());
    }

    #[test]
    fn audio_size_is_clamped() {
        let mut record = TrackRecord::new(Url::parse("http://a.example/1.m4a").unwrap());
        record.audio_offset = Some(1000);
        record.audio_size = Some(10_000);
        record.content_length = Some(5000);
        clamp_audio_size(&mut record);
        assert_eq!(record.audio_size, Some(4000));
    }
}
