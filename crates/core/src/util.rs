use std::future::Future;

/// Run a blocking closure on the blocking thread pool.
///
/// Panics in the closure are resumed on the calling task.
pub(crate) fn asyncify<F, R>(f: F) -> impl Future<Output = R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    async move {
        match task.await {
            Ok(r) => r,
            Err(e) => match e.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(e) => panic!("blocking task cancelled: {e}"),
            },
        }
    }
}
