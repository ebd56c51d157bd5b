//! Specialization for `Deferred<Result<V, E>>`.
//!
//! Domain failures are ordinary payloads. These combinators transform the
//! success or failure side and never swallow a failure unless asked to
//! (`recover*`, `ok`).

use super::{Completer, Deferred, SubscribeMode};
use crate::combinator::zip_ok;

impl<V, E> Deferred<Result<V, E>>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// An instance that succeeds with `value` once subscribed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferral::{Deferred, SubscribeMode};
    ///
    /// let answer = Deferred::<Result<i32, String>>::success(42);
    /// answer.on_success(SubscribeMode::RETAINED, |value| assert_eq!(value, 42));
    /// ```
    pub fn success(value: V) -> Self {
        Self::ready(Ok(value))
    }

    /// An instance that fails with `error` once subscribed.
    pub fn failure(error: E) -> Self {
        Self::ready(Err(error))
    }

    /// Transforms the success value; failures pass through unchanged.
    pub fn map_ok<W, F>(&self, mut transform: F) -> Deferred<Result<W, E>>
    where
        W: Clone + Send + 'static,
        F: FnMut(V) -> W + Send + 'static,
    {
        self.map(move |result| result.map(&mut transform))
    }

    /// Transforms the failure; successes pass through unchanged.
    pub fn map_err<G, F>(&self, mut transform: F) -> Deferred<Result<V, G>>
    where
        G: Clone + Send + 'static,
        F: FnMut(E) -> G + Send + 'static,
    {
        self.map(move |result| result.map_err(&mut transform))
    }

    /// Turns every failure into a success computed from the error.
    pub fn recover<F>(&self, mut fallback: F) -> Deferred<V>
    where
        F: FnMut(E) -> V + Send + 'static,
    {
        self.map(move |result| result.unwrap_or_else(&mut fallback))
    }

    /// Turns every failure into `value`.
    pub fn recover_value(&self, value: V) -> Deferred<V> {
        self.map(move |result| result.unwrap_or_else(|_| value.clone()))
    }

    /// Turns every failure into the value `fallback` produces.
    pub fn recover_with<F>(&self, mut fallback: F) -> Deferred<V>
    where
        F: FnMut() -> V + Send + 'static,
    {
        self.map(move |result| result.unwrap_or_else(|_| fallback()))
    }

    /// Success as `Some`, failure as `None`.
    pub fn ok(&self) -> Deferred<Option<V>> {
        self.map(Result::ok)
    }

    /// Keeps only whether the operation succeeded.
    pub fn discard_ok(&self) -> Deferred<Result<(), E>> {
        self.map_ok(|_| ())
    }

    /// Subscribes a handler that only sees successes.
    ///
    /// Takes the primary handler slot, like [`subscribe`](Self::subscribe).
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::DoubleSubscription`](crate::DeferredError::DoubleSubscription)
    /// if a handler is already attached.
    pub fn on_success<F>(&self, mode: SubscribeMode, mut handler: F)
    where
        F: FnMut(V) + Send + 'static,
    {
        self.subscribe(mode, move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        });
    }

    /// Subscribes a handler that only sees failures.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::DoubleSubscription`](crate::DeferredError::DoubleSubscription)
    /// if a handler is already attached.
    pub fn on_failure<F>(&self, mode: SubscribeMode, mut handler: F)
    where
        F: FnMut(E) + Send + 'static,
    {
        self.subscribe(mode, move |result| {
            if let Err(error) = result {
                handler(error);
            }
        });
    }

    /// Sequences a fallible continuation after a success.
    ///
    /// A failure completes the result directly; `continuation` is not called.
    pub fn and_then_ok<W, F>(&self, continuation: F) -> Deferred<Result<W, E>>
    where
        W: Clone + Send + 'static,
        F: FnOnce(V) -> Deferred<Result<W, E>> + Send + 'static,
    {
        self.flat_map(move |result| match result {
            Ok(value) => continuation(value),
            Err(error) => Deferred::failure(error),
        })
    }

    /// Pairs two fallible instances with short-circuit. See [`zip_ok`].
    pub fn zip_ok<W>(&self, other: &Deferred<Result<W, E>>) -> Deferred<Result<(V, W), E>>
    where
        W: Clone + Send + 'static,
    {
        zip_ok(self, other)
    }
}

impl<V, E> Completer<Result<V, E>>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Completes with `Ok(value)`.
    ///
    /// # Panics
    ///
    /// See [`Completer::complete`].
    pub fn succeed(&self, value: V) {
        self.complete(Ok(value));
    }

    /// Completes with `Err(error)`.
    ///
    /// # Panics
    ///
    /// See [`Completer::complete`].
    pub fn fail(&self, error: E) {
        self.complete(Err(error));
    }
}
