//! HTTP transport for remote scanning.
//!
//! The scanner only needs a narrow slice of HTTP: send a `GET` with some
//! headers, look at the response headers, then pull the body chunk by chunk
//! until it has seen enough. That contract is the [`Transport`] trait so
//! that the engine can be driven by something other than the network.
//!
//! [`Client`] implements it on top of `reqwest::Client` and adds:
//! * Request rate limiting, so expanding a large playlist does not flood
//!   the servers it points to
//! * Consistent timeouts and `User-Agent`
//! * No automatic redirects: the redirect adapter follows them itself to
//!   rewrite schemes and re-apply headers
//!
//! Dropping a [`Response`] disconnects.
//!
//! # Example
//!
//! ```ignore
//! use remote_scan::http::{Client, Request, Transport};
//!
//! let client = Client::new(&config)?;
//! let mut response = client.send(Request::new(url)).await?;
//! while let Some(chunk) = response.chunk().await? {
//!     // ...
//! }
//! ```

use std::{collections::VecDeque, fmt, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota};
use http::{
    header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION},
    HeaderMap, HeaderName, StatusCode,
};
use reqwest::{self, redirect, Method};
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// An outgoing `GET` request.
#[derive(Clone, Debug)]
pub struct Request {
    pub url: Url,
    pub headers: HeaderMap,
}

impl Request {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }
}

/// A response body that is read incrementally.
#[async_trait]
pub trait Body: Send {
    /// Returns the next chunk of the body, or `None` at its end.
    async fn chunk(&mut self) -> Result<Option<Bytes>>;
}

/// A body served from memory, one chunk at a time.
#[derive(Clone, Debug, Default)]
pub struct Chunks(VecDeque<Bytes>);

impl<T: Into<Bytes>> FromIterator<T> for Chunks {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl Body for Chunks {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.0.pop_front())
    }
}

/// Response headers plus a body that has not been read yet.
pub struct Response {
    /// The URL that was requested.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Box<dyn Body>,
}

impl Response {
    pub fn new<B>(url: Url, status: StatusCode, headers: HeaderMap, body: B) -> Self
    where
        B: Body + 'static,
    {
        Self {
            url,
            status,
            headers,
            body: Box::new(body),
        }
    }

    /// Returns the next chunk of the body, or `None` at its end.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection fails mid-body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Returns the first value of a header, if it is valid text.
    #[must_use]
    pub fn header<K>(&self, name: K) -> Option<&str>
    where
        K: TryInto<HeaderName>,
    {
        let name = name.try_into().ok()?;
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    }

    /// Returns the `Content-Length` of this response.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH)?.parse().ok()
    }

    /// Returns the length of the complete resource.
    ///
    /// For partial responses this is the total from `Content-Range`,
    /// otherwise the `Content-Length`.
    #[must_use]
    pub fn total_length(&self) -> Option<u64> {
        if self.status == StatusCode::PARTIAL_CONTENT {
            if let Some(total) = self
                .header(CONTENT_RANGE)
                .and_then(|range| range.rsplit_once('/'))
                .and_then(|(_, total)| total.parse().ok())
            {
                return Some(total);
            }
        }

        self.content_length()
    }

    /// Returns the `Location` of a redirect response.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        if self.status.is_redirection() {
            self.header(LOCATION)
        } else {
            None
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Issues requests for the scanner.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns as soon as the response headers are in.
    ///
    /// Redirects are returned as-is and not followed.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error if the request could not be sent.
    async fn send(&self, request: Request) -> Result<Response>;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    inner: reqwest::Client,

    /// Rate limiter to be a good citizen towards stream servers.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a new client from the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * HTTP client creation fails
    /// * The rate limit is zero
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .redirect(redirect::Policy::none())
            .user_agent(&config.user_agent);

        let burst = NonZeroU32::new(config.requests_per_second)
            .ok_or_else(|| Error::internal("requests per second is zero"))?;
        let quota = Quota::per_second(burst).allow_burst(burst);

        Ok(Self {
            inner: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }
}

#[async_trait]
impl Transport for Client {
    async fn send(&self, request: Request) -> Result<Response> {
        // No need to await with jitter because the level of concurrency is low.
        self.rate_limiter.until_ready().await;

        let mut http_request = reqwest::Request::new(Method::GET, request.url.clone());
        *http_request.headers_mut() = request.headers;
        trace!("GET {}: {:#?}", request.url, http_request.headers());

        let response = self.inner.execute(http_request).await?;
        trace!("{} {}: {:#?}", response.status(), request.url, response.headers());

        Ok(Response::new(
            request.url,
            response.status(),
            response.headers().clone(),
            ReqwestBody(response),
        ))
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl Body for ReqwestBody {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.0.chunk().await.map_err(Into::into)
    }
}
