//! Combinators deriving new [`Deferred`] instances from existing ones.
//!
//! A derived instance does not copy its source. It attaches to it:
//!
//! - subscribing the derived instance starts the source (once, shared with every
//!   other derivation of the same source)
//! - canceling or abandoning the derived instance cancels the source
//! - canceling the source cancels the derived instance
//!
//! Derived instances inherit the source's [`Identity`](crate::Identity).
//!
//! # Examples
//!
//! ```rust
//! use deferral::{Deferred, SubscribeMode};
//! use std::sync::{Arc, Mutex};
//!
//! let user = Deferred::ready(7_u32);
//! let profile = user.and_then(|id| Deferred::ready(format!("user-{id}")));
//!
//! let seen = Arc::new(Mutex::new(None));
//! let sink = Arc::clone(&seen);
//! profile.subscribe(SubscribeMode::RETAINED, move |pair| *sink.lock().unwrap() = Some(pair));
//!
//! assert_eq!(*seen.lock().unwrap(), Some((7, "user-7".to_string())));
//! ```

mod zip;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::deferred::{Completer, Deferred};

pub use zip::{zip, zip_all, zip_all_ok, zip_ok, zip_with, zip3};

/// Builds an instance fed by every value `source` produces.
///
/// `on_value` receives each source value and the derived instance's completer.
pub(crate) fn derive<T, U, F>(source: &Deferred<T>, mut on_value: F) -> Deferred<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(T, &Completer<U>) + Send + 'static,
{
    let upstream = source.clone();
    let owned = source.clone();
    Deferred::with_stop(
        move |completer: Completer<U>| {
            let on_cancel = completer.clone();
            upstream.attach(
                move |value| on_value(value, &completer),
                move || on_cancel.cancel(),
            );
        },
        move || owned.cancel(),
    )
    .with_identity(source.identity())
}

/// Second stage of a sequencing combinator.
///
/// The continuation runs at most once; later requests reuse the stored stage.
enum Stage<F, U> {
    Waiting(F),
    Generating,
    Running(Deferred<U>),
    Canceled,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Transforms every value with `transform`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferral::{Deferred, SubscribeMode};
    ///
    /// let length = Deferred::ready("deferral").map(str::len);
    /// length.subscribe(SubscribeMode::RETAINED, |value| assert_eq!(value, 8));
    /// ```
    pub fn map<U, F>(&self, mut transform: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        derive(self, move |value, completer| completer.deliver(transform(value)))
    }

    /// Runs `continuation` with this instance's value and completes with both
    /// values once the returned instance completes.
    ///
    /// The continuation runs at most once. If this instance is repeatable, later
    /// values are paired with the same second stage.
    ///
    /// Canceling the result cancels whichever stage is active.
    pub fn and_then<U, F>(&self, continuation: F) -> Deferred<(T, U)>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let stage = Arc::new(Mutex::new(Stage::Waiting(continuation)));
        let active = Arc::clone(&stage);

        let sequenced = derive(self, move |first: T, completer: &Completer<(T, U)>| {
            let Some(second) = Self::second_stage(&active, first.clone()) else {
                return;
            };
            let target = completer.clone();
            let on_cancel = completer.clone();
            second.attach(
                move |value| target.deliver((first.clone(), value)),
                move || on_cancel.cancel(),
            );
        });

        sequenced.on_cancel(move || {
            let previous = std::mem::replace(&mut *stage.lock(), Stage::Canceled);
            if let Stage::Running(second) = previous {
                second.cancel();
            }
        });
        sequenced
    }

    /// Fetches the memoized second stage, running the continuation on first use.
    ///
    /// The continuation runs outside the stage lock. Source deliveries are
    /// serialized, so no second caller can observe the gap.
    fn second_stage<U, F>(stage: &Mutex<Stage<F, U>>, first: T) -> Option<Deferred<U>>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U>,
    {
        let continuation = {
            let mut guard = stage.lock();
            match &*guard {
                Stage::Running(second) => return Some(second.clone()),
                Stage::Generating | Stage::Canceled => return None,
                Stage::Waiting(_) => {}
            }
            match std::mem::replace(&mut *guard, Stage::Generating) {
                Stage::Waiting(continuation) => continuation,
                _ => return None,
            }
        };

        let second = continuation(first);
        let mut guard = stage.lock();
        if matches!(*guard, Stage::Canceled) {
            drop(guard);
            second.cancel();
            return None;
        }
        *guard = Stage::Running(second.clone());
        Some(second)
    }

    /// Continues with the instance `continuation` returns.
    ///
    /// Shares the memoized sequencing of [`and_then`](Self::and_then): the
    /// continuation runs at most once.
    pub fn flat_map<U, F>(&self, continuation: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        self.and_then(continuation).map(|(_, second)| second)
    }

    /// Pairs this instance with `other`. See [`zip`].
    pub fn zip<U>(&self, other: &Deferred<U>) -> Deferred<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        zip(self, other)
    }
}
