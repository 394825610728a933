//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline code stays readable because the awkward parts (blocking
//! work, atomic file output, checking on child processes) live here.

use std::{pin::Pin, sync::LazyLock};

use regex::Regex;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod blocking;
pub mod io;

/// A boxed future which may borrow data for `'a`.
pub type BoxedFuture<'a, Output> = Pin<Box<dyn Future<Output = Output> + Send + 'a>>;

/// A background task which must be joined to learn whether it succeeded.
pub struct JoinWorker {
    future: BoxedFuture<'static, Result<()>>,
}

impl JoinWorker {
    /// Wrap a [`JoinHandle`]. Panics in the task become errors on join.
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `debug`. Standard error
/// may optionally be checked against a regex, for tools which print errors
/// but still exit successfully.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stderr,
        "Standard error from command",
    );

    if output.status.success() {
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
