//! Request coalescing.
//!
//! A [`PendingCache`] holds at most one in-flight [`Deferred`]. While it is in
//! flight every request gets a fan-out instance wired to the shared result,
//! and the generator is not invoked again. Once the in-flight instance
//! completes or is canceled the cache clears itself, and the next request
//! generates afresh.
//!
//! # Examples
//!
//! ```rust
//! use deferral::{Deferred, PendingCache, SubscribeMode};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let calls = Arc::new(AtomicUsize::new(0));
//! let cache = PendingCache::new();
//!
//! let requests: Vec<_> = (0..5)
//!     .map(|_| {
//!         let calls = Arc::clone(&calls);
//!         cache.current(move || {
//!             calls.fetch_add(1, Ordering::SeqCst);
//!             Deferred::<u32>::manual()
//!         })
//!     })
//!     .collect();
//! for request in &requests {
//!     request.subscribe(SubscribeMode::RETAINED, |value| assert_eq!(value, 7));
//! }
//!
//! cache.complete(7);
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! assert!(!cache.is_pending());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::deferred::Deferred;
use crate::error::DeferredError;

type Generator<T> = Box<dyn FnMut() -> Deferred<T> + Send>;

/// Slot holding the in-flight instance.
enum Slot<T> {
    Empty,
    /// A generator is running outside the lock on `thread`.
    Generating { thread: ThreadId },
    InFlight { deferred: Deferred<T>, generation: u64 },
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
    generation: AtomicU64,
    generator: Option<Mutex<Generator<T>>>,
}

/// Coalesces concurrent requests onto one in-flight [`Deferred`].
///
/// Cloning the cache clones the handle; clones share the slot.
pub struct PendingCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> PendingCache<T> {
    /// Creates an empty cache without a stored generator.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an empty cache that generates with `generator` on
    /// [`request`](Self::request).
    #[must_use]
    pub fn with_generator<G>(generator: G) -> Self
    where
        G: FnMut() -> Deferred<T> + Send + 'static,
    {
        Self::build(Some(Mutex::new(Box::new(generator))))
    }

    fn build(generator: Option<Mutex<Generator<T>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Empty),
                settled: Condvar::new(),
                generation: AtomicU64::new(0),
                generator,
            }),
        }
    }

    /// Returns the in-flight instance, generating it with `generator` if the
    /// cache is empty.
    ///
    /// The caller that triggers generation receives the in-flight instance
    /// itself; every later caller receives a fan-out instance that completes
    /// with the same value. A fan-out starts the in-flight instance if nobody
    /// has yet, and is canceled when the in-flight instance is. Canceling a
    /// fan-out leaves the in-flight instance running; its hooks stay
    /// registered there until that instance settles, holding only a weak
    /// completer each.
    ///
    /// If another thread is generating, this call waits for it to finish.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::ReentrantGeneration`] if called from inside
    /// this cache's own generator.
    pub fn current<G>(&self, generator: G) -> Deferred<T>
    where
        G: FnOnce() -> Deferred<T>,
    {
        match self.try_current(generator) {
            Ok(deferred) => deferred,
            Err(error) => panic!("{error}"),
        }
    }

    /// Fallible form of [`current`](Self::current).
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::ReentrantGeneration`] if called from inside this
    /// cache's own generator.
    pub fn try_current<G>(&self, generator: G) -> Result<Deferred<T>, DeferredError>
    where
        G: FnOnce() -> Deferred<T>,
    {
        let this_thread = thread::current().id();
        {
            let mut slot = self.inner.slot.lock();
            loop {
                let shared = match &*slot {
                    Slot::InFlight { deferred, .. } => Some(deferred.clone()),
                    Slot::Generating { thread } if *thread == this_thread => {
                        return Err(DeferredError::ReentrantGeneration);
                    }
                    Slot::Generating { .. } => None,
                    Slot::Empty => break,
                };
                match shared {
                    Some(shared) => {
                        drop(slot);
                        tracing::trace!("pending cache fan-out");
                        return Ok(fan_out(shared));
                    }
                    None => self.inner.settled.wait(&mut slot),
                }
            }
            *slot = Slot::Generating { thread: this_thread };
        }

        let guard = GenerationGuard { inner: &self.inner };
        let deferred = generator();
        guard.install(deferred.clone());
        Ok(deferred)
    }

    /// [`current`](Self::current) using the stored generator.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::NoGenerator`] or
    /// [`DeferredError::ReentrantGeneration`].
    pub fn request(&self) -> Deferred<T> {
        match self.try_request() {
            Ok(deferred) => deferred,
            Err(error) => panic!("{error}"),
        }
    }

    /// Fallible form of [`request`](Self::request).
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::NoGenerator`] if the cache was built with
    /// [`new`](Self::new), or [`DeferredError::ReentrantGeneration`].
    pub fn try_request(&self) -> Result<Deferred<T>, DeferredError> {
        let Some(generator) = self.inner.generator.as_ref() else {
            return Err(DeferredError::NoGenerator);
        };
        self.try_current(|| {
            let mut produce = generator.lock();
            (*produce)()
        })
    }

    /// Completes the in-flight instance with `value` and clears the cache.
    ///
    /// # Panics
    ///
    /// Panics with [`DeferredError::NoInFlightOperation`] if nothing is in
    /// flight, or with the in-flight instance's own completion error.
    pub fn complete(&self, value: T) {
        if let Err(error) = self.try_complete(value) {
            panic!("{error}");
        }
    }

    /// Fallible form of [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// Returns [`DeferredError::NoInFlightOperation`] if nothing is in flight,
    /// or the error of [`Deferred::try_complete`].
    pub fn try_complete(&self, value: T) -> Result<(), DeferredError> {
        let (deferred, generation) = match &*self.inner.slot.lock() {
            Slot::InFlight {
                deferred,
                generation,
            } => (deferred.clone(), *generation),
            Slot::Empty | Slot::Generating { .. } => return Err(DeferredError::NoInFlightOperation),
        };
        deferred.try_complete(value)?;
        self.inner.clear(generation);
        Ok(())
    }

    /// Cancels the in-flight instance and clears the cache. Does nothing when
    /// the cache is empty.
    pub fn cancel(&self) {
        let previous = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::InFlight { deferred, .. } => Some(deferred),
                generating @ Slot::Generating { .. } => {
                    *slot = generating;
                    None
                }
                Slot::Empty => None,
            }
        };
        if let Some(deferred) = previous {
            tracing::debug!("pending cache canceled");
            deferred.cancel();
        }
    }

    /// Whether an instance is in flight (or being generated).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Empty)
    }
}

impl<V, E> PendingCache<Result<V, E>>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Completes the in-flight instance with `Ok(value)`.
    ///
    /// # Panics
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_ok(&self, value: V) {
        self.complete(Ok(value));
    }

    /// Completes the in-flight instance with `Err(error)`.
    ///
    /// # Panics
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_err(&self, error: E) {
        self.complete(Err(error));
    }
}

impl PendingCache<()> {
    /// Completes the in-flight unit instance.
    ///
    /// # Panics
    ///
    /// See [`complete`](Self::complete).
    pub fn complete_unit(&self) {
        self.complete(());
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    /// Empties the slot if it still holds `generation`.
    fn clear(&self, generation: u64) {
        let previous = {
            let mut slot = self.slot.lock();
            let current = matches!(
                &*slot,
                Slot::InFlight { generation: held, .. } if *held == generation
            );
            current.then(|| std::mem::replace(&mut *slot, Slot::Empty))
        };
        if previous.is_some() {
            tracing::debug!(generation, "pending cache cleared");
        }
    }
}

/// Resets a `Generating` slot if the generator unwinds.
struct GenerationGuard<'a, T: Clone + Send + 'static> {
    inner: &'a Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> GenerationGuard<'_, T> {
    fn install(self, deferred: Deferred<T>) {
        let inner = self.inner;
        std::mem::forget(self);

        let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *inner.slot.lock() = Slot::InFlight {
            deferred: deferred.clone(),
            generation,
        };
        inner.settled.notify_all();
        tracing::debug!(generation, "pending cache generated");

        let weak: Weak<Inner<T>> = Arc::downgrade(inner);
        deferred.before_complete_hook(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.clear(generation);
            }
        });
        let weak = Arc::downgrade(inner);
        deferred.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.clear(generation);
            }
        });
    }
}

impl<T: Clone + Send + 'static> Drop for GenerationGuard<'_, T> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Generating { .. }) {
            *slot = Slot::Empty;
        }
        drop(slot);
        self.inner.settled.notify_all();
    }
}

/// A lightweight instance completing with the shared instance's next value.
///
/// The hooks added to `shared` are not removed when the fan-out is canceled.
/// They are released with `shared`'s other hooks once it completes or is
/// canceled.
fn fan_out<T: Clone + Send + 'static>(shared: Deferred<T>) -> Deferred<T> {
    Deferred::new(move |completer| {
        let on_cancel = completer.clone();
        shared.deferred_hook(move |value| completer.deliver(value.clone()));
        shared.on_cancel(move || on_cancel.cancel());
        shared.begin();
    })
}

impl<T: Clone + Send + 'static> Default for PendingCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PendingCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for PendingCache<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.lock() {
            Slot::Empty => "empty",
            Slot::Generating { .. } => "generating",
            Slot::InFlight { .. } => "in-flight",
        };
        formatter
            .debug_struct("PendingCache")
            .field("state", &state)
            .field("has_generator", &self.inner.generator.is_some())
            .finish()
    }
}
