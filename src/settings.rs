//! Runtime settings for binary save and load.
//!
//! Settings are read with the `config` crate from an optional
//! `constructbin.toml` next to the working directory, overridden by
//! `CONSTRUCTBIN_*` environment variables (e.g. `CONSTRUCTBIN_VERIFY_CHECKSUM=false`).

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

pub const SETTINGS_FILE: &str = "constructbin";
pub const ENV_PREFIX: &str = "CONSTRUCTBIN";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Check the blake3 trailer before anything in the image is trusted.
    pub verify_checksum: bool,
    /// Require every section to consume exactly its byte-count prefix.
    pub strict_lengths: bool,
    /// Images larger than this are rejected before parsing.
    pub max_image_bytes: u64,
    /// Default tracing filter used by the binary when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            strict_lengths: true,
            max_image_bytes: 64 * 1024 * 1024,
            log_filter: String::from("info"),
        }
    }
}

impl Settings {
    /// Loads settings from `constructbin.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(SETTINGS_FILE)
    }
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }
}
