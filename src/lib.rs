//! Resolves remote URLs into playable audio streams or expanded playlists.
//!
//! Start with [`scanner::Scanner`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod content_type;
pub mod error;
pub mod format;
pub mod http;
pub mod playlist;
pub mod redirect;
pub mod registry;
pub mod scanner;
pub mod store;
pub mod uuid;
