//! Command line and settings-file handling.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default bound on the number of cached nodes.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Default prefix prepended to relative translator names.
pub const DEFAULT_TRANSLATOR_PREFIX: &str = "/hurd/";

/// Default bound on translator startup, in seconds.
pub const DEFAULT_TRANSLATOR_TIMEOUT_SECS: u64 = 60;

/// Provides namespace-based translator selection. You can dynamically
/// obtain the file `file` translated by translator `x` using the
/// syntax: `file,,x`.
#[derive(Debug, Parser)]
#[command(name = "nsmux", version)]
pub struct Args {
    /// The maximal number of nodes in the node cache
    #[arg(short = 'c', long = "cache-size", value_name = "SIZE")]
    pub cache_size: Option<usize>,

    /// Read settings from this TOML file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The directory to mirror
    #[arg(value_name = "DIR")]
    pub dir: String,
}

/// Tunables accepted from the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Bound on the number of cached nodes.
    pub cache_size: usize,
    /// Prefix prepended to relative translator names.
    pub translator_prefix: String,
    /// Bound on translator startup.
    pub translator_timeout_secs: u64,
    /// Forward write and unlink requests to the underlying filesystem.
    pub delegate_writes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            translator_prefix: DEFAULT_TRANSLATOR_PREFIX.to_owned(),
            translator_timeout_secs: DEFAULT_TRANSLATOR_TIMEOUT_SECS,
            delegate_writes: false,
        }
    }
}

/// Resolved startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The directory to mirror. May contain backslash-escaped slashes
    /// in its last component.
    pub dir: String,
    pub settings: Settings,
}

impl Config {
    /// Merge the settings file (if any) with command line overrides.
    pub fn resolve(args: Args) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(Error::from)?;
                toml::from_str::<Settings>(&text).map_err(|_| Error::BadPort)?
            }
            None => Settings::default(),
        };
        if let Some(size) = args.cache_size {
            settings.cache_size = size;
        }

        let mut dir = args.dir;
        // a single trailing slash is decoration, not part of the name
        if dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }

        Ok(Self { dir, settings })
    }

    /// Convenience constructor used by tests and embedders.
    pub fn with_dir(dir: impl Into<String>) -> Self {
        Self { dir: dir.into(), settings: Settings::default() }
    }

    /// Bound on translator startup as a [`Duration`].
    pub fn translator_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.translator_timeout_secs)
    }
}
