//! String-keyed cache shared with the rest of the player.
//!
//! The scanner only uses it to carry a stream's artwork over to the URL it
//! was redirected to, and to remember artwork declared by playlist feeds.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

/// Cache key under which the artwork of `url` is stored.
#[must_use]
pub fn icon_key(url: &str) -> String {
    format!("icon:{url}")
}

/// Cache kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
    }
}
