//! The `validate` subcommand.

use clap::Args;

use crate::{prelude::*, scan, ui::Ui};

/// Options for `validate`.
#[derive(Debug, Args)]
pub struct ValidateOpts {
    /// A chapter folder, or a series folder containing chapter folders.
    pub input: PathBuf,
}

/// Check an input folder and say where its output would go.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_validate(ui: &Ui, opts: &ValidateOpts) -> Result<()> {
    let input = opts.input.clone();
    let validated =
        crate::async_utils::blocking::spawn_blocking_propagating_panics(move || {
            scan::validate(&input)
        })
        .await?;
    ui.display_message(
        "✅",
        &format!(
            "{} is a {}; output will be written to {}",
            validated.input.display(),
            validated.kind,
            validated.output.display()
        ),
    );
    Ok(())
}
