use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::PipelineError;

/// Create a linked completer and pending future
pub fn completion<T>() -> (Completer<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Pending { rx })
}

/// Resolves the matching [`Pending`] future
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<Result<T, PipelineError>>,
}

impl<T> Completer<T> {
    pub fn resolve(self, result: Result<T, PipelineError>) {
        // the caller may have stopped waiting
        let _ = self.tx.send(result);
    }
}

/// Future resolving once with the outcome of a callback-based call.
///
/// Dropping a `Pending` stops waiting for the outcome but does not cancel
/// the underlying operation. If the completer is dropped without resolving,
/// e.g. because the pipeline stopped, the future resolves to
/// [`PipelineError::Shutdown`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, PipelineError>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T, PipelineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(PipelineError::Shutdown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_with_result() {
        let (completer, pending) = completion::<u16>();
        completer.resolve(Ok(200));
        assert_eq!(pending.await, Ok(200));
    }

    #[tokio::test]
    async fn test_dropped_completer_resolves_to_shutdown() {
        let (completer, pending) = completion::<()>();
        drop(completer);
        assert_eq!(pending.await, Err(PipelineError::Shutdown));
    }

    #[tokio::test]
    async fn test_resolving_after_caller_left_is_harmless() {
        let (completer, pending) = completion::<()>();
        drop(pending);
        completer.resolve(Err(PipelineError::Timeout));
    }
}
