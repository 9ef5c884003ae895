//! Session GUIDs for streaming-metadata negotiation.
//!
//! Windows Media servers expect every client session to identify itself
//! with a GUID in a `Pragma: xClientGUID={...}` request header. This module
//! wraps `uuid::Uuid` with fast random generation and the braced notation
//! these servers use.
//!
//! # Example
//! ```
//! # use remote_scan::uuid::Uuid;
//! let guid = Uuid::fast_v4();
//! let pragma = format!("no-cache,xClientGUID={}", guid.braced());
//! ```

use crate::error::Error;
use std::{fmt, ops::Deref, str::FromStr};

/// A wrapper around `uuid::Uuid` that provides additional functionality.
///
/// This type implements `Deref` to `uuid::Uuid`, allowing transparent access to all
/// methods of the underlying UUID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(pub uuid::Uuid);

impl Deref for Uuid {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Uuid {
    /// Generates a new random UUID v4 using a fast random number generator.
    ///
    /// Session GUIDs only need to be unique, not unpredictable, so
    /// `fastrand` is used instead of a cryptographically secure generator.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }

    /// Formats the UUID in braces, as in `{550e8400-e29b-41d4-a716-446655440000}`.
    #[must_use]
    pub fn braced(&self) -> String {
        self.0.braced().to_string()
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parses a UUID string using the underlying `uuid::Uuid` `FromStr` implementation.
///
/// # Errors
/// Returns a `ParseFailure` if the string is not a valid UUID.
impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s)
            .map(Self)
            .map_err(|e| Error::new(crate::error::ErrorKind::ParseFailure, e))
    }
}
