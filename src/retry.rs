//! Support utilities for [`keen_retry`]'s retry API.
//!
//! Translation engines are usually remote services. We retry errors which
//! are known to go away on their own (rate limits, overloaded gateways,
//! timeouts) and give up immediately on everything else.

use std::{error, fmt};

use async_openai::error::OpenAIError;
use keen_retry::{ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// A [`RetryResult`] for a single attempt at calling a remote engine.
pub type EngineRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if $crate::retry::IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Export the macro within the crate as if it were a normal symbol.
pub(crate) use try_potentially_transient;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T>(error: anyhow::Error) -> EngineRetryResult<T> {
    RetryResult::Fatal { input: (), error }
}

/// Build a [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T>(error: anyhow::Error) -> EngineRetryResult<T> {
    RetryResult::Transient { input: (), error }
}

/// Collapse a finished retry sequence into a plain [`Result`], keeping the
/// final error.
pub(crate) fn resolved_into_result<T>(
    result: ResolvedResult<(), (), T, anyhow::Error>,
) -> Result<T> {
    match result {
        ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp { fatal_error, .. }
        | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been
/// observed in the wild and shown to be transient. This keeps us from doing
/// long exponential backoffs on errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, DNS hiccups and the like. `reqwest` doesn't
            // expose enough detail to tell these apart.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ]
        .contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => err
                .r#type
                .as_deref()
                .is_some_and(|kind| kind.contains("rate_limit") || kind.contains("overloaded")),
            _ => false,
        }
    }
}

/// An error from an engine call which may also have timed out.
#[derive(Debug)]
pub enum EngineError<E> {
    /// The engine itself failed.
    Native(E),

    /// We gave up waiting.
    Timeout,
}

impl<E> IsKnownTransient for EngineError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            EngineError::Native(err) => err.is_known_transient(),
            // Overloaded servers often recover.
            EngineError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for EngineError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Native(err) => write!(f, "translation engine error: {err}"),
            EngineError::Timeout => write!(f, "translation request timed out"),
        }
    }
}

impl<E> error::Error for EngineError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            EngineError::Native(err) => Some(err),
            EngineError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        let err: EngineError<OpenAIError> = EngineError::Timeout;
        assert!(err.is_known_transient());
        let err = EngineError::Native(OpenAIError::InvalidArgument("bad".to_owned()));
        assert!(!err.is_known_transient());
    }

    #[test]
    fn resolved_results_keep_final_error() {
        let ok: ResolvedResult<(), (), u32, anyhow::Error> = ResolvedResult::Ok {
            reported_input: (),
            output: 3,
        };
        assert_eq!(resolved_into_result(ok).unwrap(), 3);

        let fatal: ResolvedResult<(), (), u32, anyhow::Error> = ResolvedResult::Fatal {
            input: (),
            error: anyhow!("nope"),
        };
        assert_eq!(resolved_into_result(fatal).unwrap_err().to_string(), "nope");
    }
}
