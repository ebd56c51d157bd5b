//! Payload-shape helpers: unit payloads and collections of optional values.

use super::Deferred;

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Forgets the value, keeping only the completion signal.
    pub fn discard(&self) -> Deferred<()> {
        self.map(|_| ())
    }
}

impl Deferred<()> {
    /// A unit instance that completes as soon as it is subscribed.
    #[must_use]
    pub fn done() -> Self {
        Self::ready(())
    }
}

impl<T: Clone + Send + 'static> Deferred<Vec<Option<T>>> {
    /// Drops the `None` entries, keeping the order of the rest.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferral::{Deferred, SubscribeMode};
    ///
    /// Deferred::ready(vec![Some(1), None, Some(3)])
    ///     .compact()
    ///     .subscribe(SubscribeMode::RETAINED, |values| assert_eq!(values, vec![1, 3]));
    /// ```
    pub fn compact(&self) -> Deferred<Vec<T>> {
        self.map(|values| values.into_iter().flatten().collect())
    }
}

impl<T, E> Deferred<Result<Vec<Option<T>>, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// [`compact`](Deferred::compact) applied to the success side.
    pub fn compact_ok(&self) -> Deferred<Result<Vec<T>, E>> {
        self.map_ok(|values| values.into_iter().flatten().collect())
    }
}
