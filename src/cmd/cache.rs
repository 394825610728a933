//! The `cache` subcommand.

use clap::{Args, Subcommand};

use crate::{cache::TranslationCache, prelude::*, ui::Ui};

use super::CacheOpts;

/// Options for `cache`.
#[derive(Debug, Args)]
pub struct CacheCmdOpts {
    #[clap(subcommand)]
    pub action: CacheAction,

    #[clap(flatten)]
    pub cache: CacheOpts,
}

/// What to do to the cache.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum CacheAction {
    /// Show where the cache lives and how big it is.
    Stats,
    /// Remove translations older than `--cache-max-age-days`.
    Evict,
    /// Remove every translation.
    Clear,
}

/// Inspect or maintain the translation cache.
#[instrument(level = "debug", skip_all, fields(action = ?opts.action))]
pub async fn cmd_cache(ui: &Ui, opts: &CacheCmdOpts) -> Result<()> {
    let dir = opts.cache.resolved_cache_dir();
    let cache = TranslationCache::open(&dir, opts.cache.cache_max_entries).await?;
    match opts.action {
        CacheAction::Stats => {
            ui.display_message("🗃️", &format!("{}: {}", dir.display(), cache.stats()));
        }
        CacheAction::Evict => {
            let removed = cache.evict_older_than(opts.cache.max_age());
            cache.save().await?;
            ui.display_message(
                "🧹",
                &format!("Removed {removed} stale translations, {} left", cache.len()),
            );
        }
        CacheAction::Clear => {
            let removed = cache.len();
            cache.clear();
            cache.save().await?;
            ui.display_message("🧹", &format!("Removed {removed} translations"));
        }
    }
    Ok(())
}
