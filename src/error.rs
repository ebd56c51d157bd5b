//! Contract-violation errors.
//!
//! These errors describe bugs in the calling code (subscribing twice, completing
//! an instance nobody listens to, ...). They are returned by the `try_*` family of
//! methods; the plain methods panic with the same message.
//!
//! Domain failures are never reported through this type. They travel as ordinary
//! `Result<V, E>` payloads of a `Deferred<Result<V, E>>`.

use thiserror::Error;

/// Errors raised when a `Deferred`, `PendingCache` or wait helper is misused.
///
/// # Examples
///
/// ```rust
/// use deferral::{Deferred, DeferredError, SubscribeMode};
///
/// let deferred = Deferred::<i32>::manual();
/// deferred.subscribe(SubscribeMode::WEAK, |_| {});
///
/// assert_eq!(
///     deferred.try_subscribe(SubscribeMode::WEAK, |_| {}),
///     Err(DeferredError::DoubleSubscription)
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DeferredError {
    /// A one-shot instance received a second handler while the first is attached.
    #[error("deferred was subscribed twice; a one-shot instance accepts a single handler")]
    DoubleSubscription,

    /// `complete` was called on an instance that was never subscribed or started.
    #[error("deferred was completed before anyone subscribed to it")]
    NoSubscriber,

    /// `complete` was called on a one-shot instance that already delivered its value.
    #[error("one-shot deferred was completed more than once")]
    AlreadyCompleted,

    /// `PendingCache::complete` was called with nothing in flight.
    #[error("pending cache has no in-flight operation to complete")]
    NoInFlightOperation,

    /// `PendingCache::request` was called on a cache built without a generator.
    #[error("pending cache has no stored generator")]
    NoGenerator,

    /// The synchronous wait helper was given a zero timeout.
    #[error("wait timeout must be greater than zero")]
    InvalidTimeout,

    /// A `PendingCache` generator re-entered the same cache on the same thread.
    #[error("pending cache generator re-entered its own cache")]
    ReentrantGeneration,
}
