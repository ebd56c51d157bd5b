//! `.await` support for [`Deferred`].

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{Deferred, SubscribeMode};

/// Future resolving to the first value of a [`Deferred`], or `None` if the
/// instance is canceled or abandoned before delivering one.
///
/// Awaiting takes the primary handler slot. An instance that already has a
/// handler resolves to `None` at once and is left untouched.
///
/// Dropping the future before it resolves cancels the instance.
///
/// # Examples
///
/// ```rust
/// use deferral::Deferred;
///
/// #[tokio::main]
/// async fn main() {
///     let deferred = Deferred::<u16>::manual();
///     let completer = deferred.completer();
///     tokio::spawn(async move { completer.complete(8080) });
///
///     assert_eq!(deferred.await, Some(8080));
/// }
/// ```
pub struct DeferredFuture<T: Clone + Send + 'static> {
    receiver: oneshot::Receiver<T>,
    deferred: Option<Deferred<T>>,
}

impl<T: Clone + Send + 'static> IntoFuture for Deferred<T> {
    type Output = Option<T>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        let subscribed = self.try_subscribe(SubscribeMode::RETAINED, move |value| {
            if let Some(sender) = sender.take() {
                let _ = sender.send(value);
            }
        });
        if let Err(error) = subscribed {
            tracing::warn!(%error, "awaiting a deferred that already has a handler");
        }
        DeferredFuture {
            receiver,
            deferred: Some(self),
        }
    }
}

// =============================================================================
// Future Implementation
// =============================================================================

impl<T: Clone + Send + 'static> Future for DeferredFuture<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(context) {
            Poll::Ready(outcome) => {
                this.deferred = None;
                Poll::Ready(outcome.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Clone + Send + 'static> Drop for DeferredFuture<T> {
    fn drop(&mut self) {
        if let Some(deferred) = self.deferred.take() {
            deferred.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for DeferredFuture<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DeferredFuture")
            .field("resolved", &self.deferred.is_none())
            .finish()
    }
}
