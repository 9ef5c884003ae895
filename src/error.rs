//! Error handling for remote scanning.
//!
//! Provides a unified error type whose kinds mirror the ways a remote
//! resolution can fail, with mapping from underlying library errors to
//! the appropriate kind.
//!
//! # Error Categories
//!
//! * Request validation: no URL, unsupported URL, nested too deep
//! * Transport: connect failures, HTTP status errors, timeouts
//! * Content: unparsable headers, playlists without items
//! * Control flow: cancelled by the caller, internal invariants
//!
//! Every error carries a symbolic code (see [`Error::code`]) that callers
//! can surface alongside the human readable text.
//!
//! # Example
//!
//! ```rust
//! use remote_scan::error::{Error, Result};
//!
//! fn check(depth: usize) -> Result<()> {
//!     if depth >= 7 {
//!         return Err(Error::nested_too_deep(format!("depth {depth}")));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind, code and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Format-specific code overriding the one of `kind`
    code: Option<&'static str>,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns the symbolic code of this error.
    ///
    /// This is the format-specific code when one was given at
    /// construction (for example `ASF_UNABLE_TO_PARSE`), otherwise the
    /// code of the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code.unwrap_or_else(|| self.kind.code())
    }
}

/// Standard result type for scanning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of a remote resolution.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The request carried an empty URL.
    #[error("no url")]
    NoUrl,

    /// The URL could not be parsed or uses no remote scheme.
    #[error("invalid url")]
    InvalidUrl,

    /// Playlists nested beyond the maximum depth.
    #[error("playlists nested too deep")]
    NestedTooDeep,

    /// Network, connect or HTTP status failure.
    #[error("transport error")]
    Transport,

    /// Headers of a known format could not be parsed.
    #[error("unable to parse")]
    ParseFailure,

    /// A playlist yielded no usable entries.
    #[error("no playlist items found")]
    PlaylistEmpty,

    /// The caller abandoned the scan.
    #[error("scan was cancelled")]
    Cancelled,

    /// An internal invariant did not hold.
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// Symbolic code surfaced to callers.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::NoUrl => "NO_URL",
            Self::InvalidUrl => "INVALID_URL",
            Self::NestedTooDeep => "NESTED_TOO_DEEP",
            Self::Transport => "TRANSPORT_ERROR",
            Self::ParseFailure => "PARSE_FAILURE",
            Self::PlaylistEmpty => "PLAYLIST_NO_ITEMS_FOUND",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            code: None,
            error: error.into(),
        }
    }

    /// Creates an error for a request without URL.
    pub fn no_url<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NoUrl, error)
    }

    /// Creates an error for an unparsable URL or a URL with an
    /// unsupported scheme.
    pub fn invalid_url<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidUrl, error)
    }

    /// Creates an error for playlists nested beyond the depth limit.
    pub fn nested_too_deep<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NestedTooDeep, error)
    }

    /// Creates an error for network failures.
    ///
    /// Use when:
    /// * The connection could not be established
    /// * The server answered with a non-success status
    /// * A read timed out or the body was cut off
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Transport, error)
    }

    /// Creates an error for headers that could not be parsed, with a
    /// format-specific code.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use remote_scan::error::Error;
    /// let err = Error::parse_failure("ASF_UNABLE_TO_PARSE", "no bitrate");
    /// assert_eq!(err.code(), "ASF_UNABLE_TO_PARSE");
    /// ```
    pub fn parse_failure<E>(code: &'static str, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: ErrorKind::ParseFailure,
            code: Some(code),
            error: error.into(),
        }
    }

    /// Creates an error for playlists without usable entries.
    pub fn playlist_empty<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::PlaylistEmpty, error)
    }

    /// Creates an error for scans abandoned by the caller.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for internal errors.
    ///
    /// Use for unexpected internal errors that shouldn't occur during
    /// normal operation.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Malformed data maps to `ParseFailure`, everything else happened on the
/// wire and maps to `Transport`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            InvalidData => Self::parse_failure(ErrorKind::ParseFailure.code(), err),
            Interrupted => Self::cancelled(err),
            _ => Self::transport(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// * Builder errors -> `Internal`
/// * Everything else -> `Transport`
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::internal(err);
        }

        Self::transport(err)
    }
}

/// Converts URL parsing errors to `InvalidUrl`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_url(e.to_string())
    }
}

/// Converts JSON errors to `ParseFailure`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::ParseFailure, err)
    }
}

/// Converts configuration file errors to `Internal`.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Converts invalid header errors to `Internal`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts timeout errors to `Transport`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::transport(e.to_string())
    }
}

/// Converts a dropped completion signal to `Internal`.
impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts integer parsing errors to `ParseFailure`.
impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::new(ErrorKind::ParseFailure, e.to_string())
    }
}
