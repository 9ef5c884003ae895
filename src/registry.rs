//! Protocol handlers for URL schemes beyond plain HTTP.
//!
//! Streaming services usually have URL schemes of their own. A handler
//! registered for such a scheme makes its URLs remote, and may either take
//! over scanning entirely or declare that its URLs are audio, which skips
//! the network round trip.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use url::Url;

use crate::{
    error::{Error, Result},
    scanner::{Resolved, ScanRequest, Scanner},
};

/// Schemes that are always scanned over the network.
const REMOTE_SCHEMES: [&str; 4] = ["http", "https", "mms", "mmsh"];

#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Whether [`ProtocolHandler::scan`] replaces the scanner for URLs of
    /// this scheme.
    fn has_custom_scan(&self) -> bool {
        false
    }

    /// Resolves `request` in place of the scanner.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler fails with. The default implementation
    /// returns an `Internal` error.
    async fn scan(&self, _scanner: &Scanner, request: ScanRequest) -> Result<Resolved> {
        Err(Error::internal(format!(
            "no custom scan for {}",
            request.url
        )))
    }

    /// Whether `url` is known to be audio without looking at it.
    fn is_audio(&self, _url: &Url) -> bool {
        false
    }
}

/// Protocol handlers by URL scheme.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `scheme`, replacing any previous one.
    pub fn register<H>(&mut self, scheme: &str, handler: H)
    where
        H: ProtocolHandler + 'static,
    {
        self.handlers
            .insert(scheme.to_ascii_lowercase(), Arc::new(handler));
    }

    #[must_use]
    pub fn handler(&self, scheme: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(scheme).cloned()
    }

    /// Whether `url` can be resolved remotely.
    #[must_use]
    pub fn is_remote(&self, url: &Url) -> bool {
        REMOTE_SCHEMES.contains(&url.scheme()) || self.handlers.contains_key(url.scheme())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
