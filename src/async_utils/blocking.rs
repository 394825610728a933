//! Running CPU-heavy work (image decoding, compositing, directory walks)
//! without stalling the async executor.

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
///
/// A panic while decoding a page is a bug, not a per-image failure, so we
/// re-raise it on the calling task instead of turning it into an error.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are only cancelled when the runtime shuts down.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value_from_worker_thread() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn re_raises_panics() {
        spawn_blocking_propagating_panics(|| panic!("boom")).await
    }
}
