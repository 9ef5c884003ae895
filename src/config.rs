use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::error::{Error, Result};

#[serde_as]
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    pub user_agent: String,

    /// Connect and read timeout of every request.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,

    /// Unit of delay between sibling playlist entries, and before reporting
    /// success for URLs carrying credentials.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stagger: Duration,

    /// Highest WMA stream bitrate to select, in bits per second.
    pub max_wma_bitrate: Option<u32>,

    /// Whether `mms://` URLs are streamed directly. When disabled they are
    /// assumed to be WMA without probing the network.
    pub mms_direct_streaming: bool,

    pub max_redirects: usize,

    /// Ceiling on bytes read while looking for FLAC, WAV or MP4 headers.
    pub max_header_bytes: usize,

    pub requests_per_second: u32,
}

impl Config {
    /// Configuration files are tiny; anything bigger is not one.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Loads the configuration from a TOML file. Missing keys take their
    /// default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is too large, cannot be read or is not
    /// valid TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::internal(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        trace!("configuration: {config:#?}");

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        // Mimic the product token layout of common desktop players, some
        // stream servers refuse empty or library-looking user agents.
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");

        Self {
            app_name,
            app_version,
            user_agent,
            timeout: Duration::from_secs(15),
            stagger: Duration::from_secs(1),
            max_wma_bitrate: None,
            mms_direct_streaming: true,
            max_redirects: 10,
            max_header_bytes: 4 * 1024 * 1024,
            requests_per_second: 20,
        }
    }
}
