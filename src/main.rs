use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cache;
mod cmd;
mod compose;
mod cpu_limit;
mod job;
mod ocr;
mod page;
mod pipeline;
mod prelude;
mod rate_limit;
mod regions;
mod retry;
mod scan;
#[cfg(test)]
mod test_support;
mod translate;
mod ui;

/// Translate folders of manga pages in bulk.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The OpenAI key to use with `--translator openai`.
  - XDG_CACHE_HOME (optional): Parent of the default cache directory.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Translate a chapter folder, or a series folder of chapters.
    Translate(cmd::translate::TranslateOpts),
    /// Check that a folder can be translated, without translating it.
    Validate(cmd::validate::ValidateOpts),
    /// Inspect or maintain the translation cache.
    Cache(cmd::cache::CacheCmdOpts),
}

impl Cmd {
    /// Do we have a batch worth drawing progress bars for?
    fn shows_progress(&self) -> bool {
        matches!(self, Cmd::Translate(_))
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if !opts.subcmd.shows_progress() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Translate(opts) => {
            cmd::translate::cmd_translate(&ui, opts).await?;
        }
        Cmd::Validate(opts) => {
            cmd::validate::cmd_validate(&ui, opts).await?;
        }
        Cmd::Cache(opts) => {
            cmd::cache::cmd_cache(&ui, opts).await?;
        }
    }
    Ok(())
}
