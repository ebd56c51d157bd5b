//! Blocking wait for a [`Deferred`].
//!
//! The only place in the crate that parks a thread. Use it at the edges
//! (tests, command-line entry points, bridging into synchronous APIs), never
//! from inside a handler or on a scheduler thread that the awaited instance
//! needs in order to complete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::deferred::{Deferred, SubscribeMode};
use crate::error::DeferredError;

enum Outcome<T> {
    Waiting,
    Completed(T),
    Canceled,
}

struct Signal<T> {
    outcome: Mutex<Outcome<T>>,
    settled: Condvar,
}

impl<T> Signal<T> {
    /// Records the first outcome; later ones are ignored.
    fn settle(&self, outcome: Outcome<T>) {
        let mut slot = self.outcome.lock();
        if matches!(*slot, Outcome::Waiting) {
            *slot = outcome;
            self.settled.notify_all();
        }
    }
}

/// Subscribes to `deferred` and blocks until it delivers a value, returning it.
///
/// With `timeout` set, gives up after that long and returns `on_timeout()`
/// instead. `None` waits indefinitely. A canceled instance also yields
/// `on_timeout()`.
///
/// The subscription is self-retained and takes the primary handler slot.
///
/// # Panics
///
/// Panics with [`DeferredError::InvalidTimeout`] for a zero timeout, or
/// [`DeferredError::DoubleSubscription`] if `deferred` already has a handler.
///
/// # Examples
///
/// ```rust
/// use deferral::{Deferred, await_result};
/// use std::thread;
/// use std::time::Duration;
///
/// let deferred = Deferred::<u8>::manual();
/// let completer = deferred.completer();
///
/// let worker = thread::spawn(move || {
///     thread::sleep(Duration::from_millis(10));
///     completer.complete(5);
/// });
///
/// assert_eq!(await_result(&deferred, Some(Duration::from_secs(5)), || 0), 5);
/// worker.join().unwrap();
///
/// let never = Deferred::<u8>::manual();
/// assert_eq!(await_result(&never, Some(Duration::from_millis(10)), || 0), 0);
/// ```
pub fn await_result<T, F>(deferred: &Deferred<T>, timeout: Option<Duration>, on_timeout: F) -> T
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T,
{
    match try_await_result(deferred, timeout, on_timeout) {
        Ok(value) => value,
        Err(error) => panic!("{error}"),
    }
}

/// Fallible form of [`await_result`].
///
/// # Errors
///
/// Returns [`DeferredError::InvalidTimeout`] for a zero timeout, or
/// [`DeferredError::DoubleSubscription`] if `deferred` already has a handler.
pub fn try_await_result<T, F>(
    deferred: &Deferred<T>,
    timeout: Option<Duration>,
    on_timeout: F,
) -> Result<T, DeferredError>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T,
{
    if timeout.is_some_and(|timeout| timeout.is_zero()) {
        return Err(DeferredError::InvalidTimeout);
    }

    let signal = Arc::new(Signal {
        outcome: Mutex::new(Outcome::Waiting),
        settled: Condvar::new(),
    });
    let sink = Arc::clone(&signal);
    deferred.try_subscribe(SubscribeMode::RETAINED, move |value| {
        sink.settle(Outcome::Completed(value));
    })?;
    let sink = Arc::clone(&signal);
    deferred.on_cancel(move || sink.settle(Outcome::Canceled));

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let outcome = {
        let mut slot = signal.outcome.lock();
        loop {
            if !matches!(*slot, Outcome::Waiting) {
                break std::mem::replace(&mut *slot, Outcome::Canceled);
            }
            match deadline {
                Some(deadline) => {
                    if signal.settled.wait_until(&mut slot, deadline).timed_out()
                        && matches!(*slot, Outcome::Waiting)
                    {
                        break Outcome::Waiting;
                    }
                }
                None => signal.settled.wait(&mut slot),
            }
        }
    };

    match outcome {
        Outcome::Completed(value) => Ok(value),
        Outcome::Canceled => {
            tracing::debug!("awaited deferred was canceled");
            Ok(on_timeout())
        }
        Outcome::Waiting => {
            tracing::debug!(?timeout, "wait for deferred timed out");
            Ok(on_timeout())
        }
    }
}
