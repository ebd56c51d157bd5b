//! The deferred-value cell.
//!
//! A [`Deferred<T>`] stands for a value of type `T` that becomes available
//! later, once (one-shot) or repeatedly (repeatable). It owns two actions:
//!
//! - `start`, run lazily the first time anyone subscribes; it receives a
//!   [`Completer`] that the producer uses to deliver the value
//! - `stop`, run when a started instance is canceled or dropped before it
//!   completes; it releases whatever `start` acquired
//!
//! # Lifecycle
//!
//! ```text
//! Idle --subscribe--> Pending --complete--> Completed   (one-shot)
//!                        |   \--complete--> Pending      (repeatable)
//!                        \----cancel/drop--> Canceled
//! ```
//!
//! # Ownership
//!
//! The subscriber chooses a [`Retention`]:
//!
//! - [`Retention::Retained`]: the instance owns itself while pending and survives
//!   every caller handle being dropped, until it completes or is canceled
//! - [`Retention::Weak`]: only caller handles keep it alive; dropping the last one
//!   abandons the work (`stop` runs, nothing is delivered)
//!
//! The [`Completer`] handed to `start` never keeps the instance alive.
//!
//! # Examples
//!
//! ```rust
//! use deferral::{Deferred, SubscribeMode};
//! use std::sync::{Arc, Mutex};
//!
//! let received = Arc::new(Mutex::new(None));
//! let sink = Arc::clone(&received);
//!
//! let deferred = Deferred::from_fn(|| 21).map(|value| value * 2);
//! deferred.subscribe(SubscribeMode::RETAINED, move |value| {
//!     *sink.lock().unwrap() = Some(value);
//! });
//!
//! assert_eq!(*received.lock().unwrap(), Some(42));
//! ```

#[cfg(feature = "async")]
mod future;
mod payload;
mod result;
mod state;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::error::DeferredError;
use crate::scheduler::SharedScheduler;

#[cfg(feature = "async")]
pub use future::DeferredFuture;
pub(crate) use state::Shared;

/// Whether a pending instance keeps itself alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Retention {
    /// The instance owns itself until it completes or is canceled.
    #[default]
    Retained,
    /// Only caller handles keep the instance alive.
    Weak,
}

/// Whether the primary handler is cleared after the first delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Repeat {
    /// Deliver once, then finalize.
    #[default]
    Once,
    /// Keep delivering until canceled or dropped.
    Repeatable,
}

/// Retention and repeat policy chosen at subscription time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubscribeMode {
    /// Lifetime policy while pending.
    pub retention: Retention,
    /// One-shot or repeatable delivery.
    pub repeat: Repeat,
}

impl SubscribeMode {
    /// One-shot, self-retained. The default.
    pub const RETAINED: Self = Self::new(Retention::Retained, Repeat::Once);
    /// One-shot, owned by caller handles only.
    pub const WEAK: Self = Self::new(Retention::Weak, Repeat::Once);
    /// Repeatable, self-retained.
    pub const REPEATABLE: Self = Self::new(Retention::Retained, Repeat::Repeatable);
    /// Repeatable, owned by caller handles only.
    pub const REPEATABLE_WEAK: Self = Self::new(Retention::Weak, Repeat::Repeatable);

    /// Builds a mode from its two policies.
    #[must_use]
    pub const fn new(retention: Retention, repeat: Repeat) -> Self {
        Self { retention, repeat }
    }
}

/// Observable lifecycle phase of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredState {
    /// Nobody subscribed yet; `start` has not run.
    Idle,
    /// Started and waiting for a value (repeatable instances stay here).
    Pending,
    /// A one-shot instance delivered its value.
    Completed,
    /// Canceled or abandoned; nothing will be delivered.
    Canceled,
}

/// How two instances compare for equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Identity {
    /// Equal only to itself.
    #[default]
    Instance,
    /// Equal to every instance carrying the same key.
    Key(Arc<str>),
}

/// A value of type `T` that becomes available later.
///
/// Cloning a `Deferred` clones the handle; both handles refer to the same
/// instance.
///
/// Payloads are `Clone` because one value may be observed by several
/// consumers (hooks, derived instances, fan-out waiters).
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

/// Producer-side handle handed to the `start` action.
///
/// A completer does not keep its instance alive: completing an instance that
/// was abandoned is a silent no-op.
pub struct Completer<T> {
    shared: Weak<Shared<T>>,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Creates an instance whose work is `start`, run on first subscription.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferral::{Deferred, DeferredState, SubscribeMode};
    ///
    /// let deferred = Deferred::new(|completer| completer.complete("done"));
    /// assert_eq!(deferred.state(), DeferredState::Idle);
    ///
    /// deferred.one_way(SubscribeMode::WEAK);
    /// assert_eq!(deferred.state(), DeferredState::Completed);
    /// ```
    pub fn new<S>(start: S) -> Self
    where
        S: FnOnce(Completer<T>) + Send + 'static,
    {
        Self::from_shared(Arc::new(Shared::new(Box::new(start), None)))
    }

    /// Creates an instance with both a start and a stop action.
    ///
    /// `stop` runs at most once: when the started instance is canceled, or
    /// dropped while still pending.
    pub fn with_stop<S, P>(start: S, stop: P) -> Self
    where
        S: FnOnce(Completer<T>) + Send + 'static,
        P: FnOnce() + Send + 'static,
    {
        Self::from_shared(Arc::new(Shared::new(Box::new(start), Some(Box::new(stop)))))
    }

    /// Creates an instance that completes with `producer()` as soon as it is
    /// subscribed.
    pub fn from_fn<F>(producer: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::new(move |completer| completer.deliver(producer()))
    }

    /// Creates an instance that completes with `value` as soon as it is
    /// subscribed.
    pub fn ready(value: T) -> Self {
        Self::from_fn(move || value)
    }

    /// Creates an instance with no start action, completed from outside
    /// through [`complete`](Self::complete) or a [`completer`](Self::completer).
    pub fn manual() -> Self {
        Self::new(|_| {})
    }

    pub(crate) const fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Registers `handler` as the primary completion handler and starts the
    /// work if it has not started yet.
    ///
    /// Subscribing to a completed one-shot instance delivers its value to
    /// `handler` immediately. Subscribing to a canceled instance does nothing.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::DoubleSubscription`] if a handler is already
    /// attached.
    pub fn subscribe<F>(&self, mode: SubscribeMode, handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        if let Err(error) = self.try_subscribe(mode, handler) {
            panic!("{error}");
        }
    }

    /// Fallible form of [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::DoubleSubscription`] if a handler is already
    /// attached.
    pub fn try_subscribe<F>(&self, mode: SubscribeMode, handler: F) -> Result<(), DeferredError>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.shared.subscribe(mode, Box::new(handler))
    }

    /// Subscribes with a handler that ignores the value.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::DoubleSubscription`] if a handler is already
    /// attached.
    pub fn one_way(&self, mode: SubscribeMode) {
        self.subscribe(mode, |_| {});
    }

    /// Delivers `value` to the before-complete hooks, the primary handler,
    /// derived instances and finally the deferred hooks, in that order.
    ///
    /// Completing a canceled instance is a no-op.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::NoSubscriber`] if nobody subscribed yet, or
    /// [`DeferredError::AlreadyCompleted`] if a one-shot instance already
    /// completed.
    pub fn complete(&self, value: T) {
        if let Err(error) = self.try_complete(value) {
            panic!("{error}");
        }
    }

    /// Fallible form of [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::NoSubscriber`] or
    /// [`DeferredError::AlreadyCompleted`].
    pub fn try_complete(&self, value: T) -> Result<(), DeferredError> {
        self.shared.complete(value)
    }

    /// Cancels the instance: runs `stop` (if the work started), drops every
    /// handler and hook, and releases self-retention.
    ///
    /// Canceling twice, or canceling a completed one-shot instance, does
    /// nothing.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> DeferredState {
        self.shared.state()
    }

    /// Whether the work started and no final outcome has been reached.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == DeferredState::Pending
    }

    /// A producer-side handle to this instance.
    #[must_use]
    pub fn completer(&self) -> Completer<T> {
        Completer::from_shared(&self.shared)
    }

    /// Appends a hook that observes each value before the primary handler.
    ///
    /// Hooks registered after a one-shot instance completed observe the stored
    /// value immediately.
    pub fn before_complete_hook<F>(&self, hook: F) -> &Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.shared.add_before(Box::new(hook));
        self
    }

    /// Appends a hook that observes each value after the primary handler and
    /// every derived instance.
    ///
    /// Hooks registered after a one-shot instance completed observe the stored
    /// value immediately.
    pub fn deferred_hook<F>(&self, hook: F) -> &Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.shared.add_after(Box::new(hook));
        self
    }

    /// Routes deliveries through `scheduler`.
    ///
    /// `complete` still validates synchronously; hooks and handlers run from a
    /// job submitted with [`Scheduler::run_async`](crate::scheduler::Scheduler::run_async).
    #[must_use]
    pub fn deliver_on(self, scheduler: SharedScheduler) -> Self {
        self.shared.core.lock().scheduler = Some(scheduler);
        self
    }

    /// Gives the instance an explicit identity key.
    ///
    /// Instances with equal keys compare and hash equal.
    #[must_use]
    pub fn keyed(self, key: impl Into<Arc<str>>) -> Self {
        self.shared.core.lock().identity = Identity::Key(key.into());
        self
    }

    /// The explicit identity key, if any.
    #[must_use]
    pub fn key(&self) -> Option<Arc<str>> {
        match self.identity() {
            Identity::Key(key) => Some(key),
            Identity::Instance => None,
        }
    }

    /// How this instance compares to others.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.shared.core.lock().identity.clone()
    }

    pub(crate) fn with_identity(self, identity: Identity) -> Self {
        self.shared.core.lock().identity = identity;
        self
    }

    /// Combinator entry point: observes every value without taking the primary
    /// handler slot, starting the work if needed. `on_cancel` runs if this
    /// instance is canceled first.
    pub(crate) fn attach<L, C>(&self, listener: L, on_cancel: C)
    where
        L: FnMut(T) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.shared.attach(Box::new(listener), Box::new(on_cancel));
    }

    pub(crate) fn on_cancel<C>(&self, hook: C)
    where
        C: FnOnce() + Send + 'static,
    {
        self.shared.add_cancel_hook(Box::new(hook));
    }

    pub(crate) fn begin(&self) {
        self.shared.begin();
    }
}

impl<T: Clone + Send + 'static> Completer<T> {
    fn from_shared(shared: &Arc<Shared<T>>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// Delivers `value` if the instance is still alive.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::NoSubscriber`] or
    /// [`DeferredError::AlreadyCompleted`]; see [`Deferred::complete`].
    pub fn complete(&self, value: T) {
        if let Err(error) = self.try_complete(value) {
            panic!("{error}");
        }
    }

    /// Fallible form of [`complete`](Self::complete). Completing an abandoned
    /// instance returns `Ok(())` without delivering anything.
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::NoSubscriber`] or
    /// [`DeferredError::AlreadyCompleted`].
    pub fn try_complete(&self, value: T) -> Result<(), DeferredError> {
        match self.shared.upgrade() {
            Some(shared) => shared.complete(value),
            None => {
                tracing::trace!("completion of an abandoned deferred ignored");
                Ok(())
            }
        }
    }

    /// Cancels the instance if it is still alive.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel();
        }
    }

    /// Whether the instance is still alive and able to deliver.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            matches!(shared.state(), DeferredState::Idle | DeferredState::Pending)
        })
    }

    /// Upgrades to an owning handle while the instance is alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Deferred<T>> {
        self.shared.upgrade().map(Deferred::from_shared)
    }

    /// Internal delivery used by combinators: a value that arrives after the
    /// target finalized (a repeatable source feeding a one-shot instance) is
    /// dropped.
    pub(crate) fn deliver(&self, value: T) {
        if let Err(error) = self.try_complete(value) {
            tracing::debug!(%error, "late value dropped");
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return true;
        }
        let left = self.shared.core.lock().identity.clone();
        let right = other.shared.core.lock().identity.clone();
        match (left, right) {
            (Identity::Key(left), Identity::Key(right)) => left == right,
            _ => false,
        }
    }
}

impl<T> Eq for Deferred<T> {}

impl<T> Hash for Deferred<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let identity = self.shared.core.lock().identity.clone();
        match identity {
            Identity::Key(key) => key.hash(state),
            Identity::Instance => Arc::as_ptr(&self.shared).hash(state),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        formatter
            .debug_struct("Deferred")
            .field("state", &core.phase)
            .field("identity", &core.identity)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Completer")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}
