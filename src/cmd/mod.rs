//! Command-line entry points.

use std::time::Duration;

use clap::Args;

use crate::{
    cache::{DEFAULT_MAX_ENTRIES, TranslationCache},
    prelude::*,
};

pub mod cache;
pub mod translate;
pub mod validate;

/// Name of our folder under the user's cache directory.
const CACHE_DIR_NAME: &str = "manga-scaler";

/// Translation cache options, shared by every subcommand that touches it.
#[derive(Debug, Clone, Args)]
pub struct CacheOpts {
    /// Where to keep the translation cache. Defaults to
    /// `$XDG_CACHE_HOME/manga-scaler` or `~/.cache/manga-scaler`.
    #[clap(long)]
    pub cache_dir: Option<PathBuf>,

    /// Translations older than this many days are swept from the cache.
    #[clap(long, default_value = "7")]
    pub cache_max_age_days: u64,

    /// The most translations to keep. The oldest are dropped first.
    #[clap(long, default_value_t = DEFAULT_MAX_ENTRIES)]
    pub cache_max_entries: usize,

    /// Don't read or write the translation cache.
    #[clap(long)]
    pub no_cache: bool,
}

impl CacheOpts {
    /// The maximum age of a cache entry.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_days.saturating_mul(24 * 60 * 60))
    }

    /// The cache directory we'll actually use.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir(
                std::env::var_os("XDG_CACHE_HOME").map(PathBuf::from),
                std::env::var_os("HOME").map(PathBuf::from),
            ),
        }
    }

    /// Open the persistent cache, or return `None` with `--no-cache`.
    pub async fn open(&self) -> Result<Option<TranslationCache>> {
        if self.no_cache {
            return Ok(None);
        }
        let dir = self.resolved_cache_dir();
        let cache = TranslationCache::open(&dir, self.cache_max_entries).await?;
        Ok(Some(cache))
    }
}

/// Pick a cache directory from `$XDG_CACHE_HOME` and `$HOME`.
fn default_cache_dir(xdg_cache_home: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = xdg_cache_home.filter(|dir| dir.is_absolute()) {
        dir.join(CACHE_DIR_NAME)
    } else if let Some(home) = home.filter(|dir| !dir.as_os_str().is_empty()) {
        home.join(".cache").join(CACHE_DIR_NAME)
    } else {
        PathBuf::from(".manga-scaler-cache")
    }
}
