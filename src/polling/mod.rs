//! Bounded-retry polling.
//!
//! A [`PollingEngine`] repeatedly generates an attempt, inspects its result,
//! and either schedules another attempt through a [`Scheduler`] or delivers the
//! result as final.
//!
//! Per attempt:
//!
//! 1. generate a fresh [`Deferred`] and wait for its value
//! 2. report the value to the `on_response` observer
//! 3. re-attempt after the configured delay if the budget allows it
//!    (`remaining retries > 0` or `elapsed < minimum_waiting_time`) and
//!    `should_repeat(value)` holds
//! 4. otherwise deliver the value
//!
//! Exactly one attempt is in flight at a time. Canceling the returned instance
//! cancels the current attempt, and scheduled re-attempts that fire afterwards
//! do nothing.
//!
//! # Examples
//!
//! ```rust
//! use deferral::polling::{PollingConfig, PollingEngine};
//! use deferral::scheduler::ManualScheduler;
//! use deferral::{Deferred, SubscribeMode};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let polls = Arc::new(AtomicU32::new(0));
//! let counter = Arc::clone(&polls);
//!
//! let status = PollingEngine::new(
//!     scheduler.clone(),
//!     move || Deferred::ready(counter.fetch_add(1, Ordering::SeqCst) + 1),
//!     PollingConfig::default().with_retry_count(10),
//! )
//! .should_repeat(|ready_after: &u32| *ready_after < 3)
//! .start();
//!
//! status.subscribe(SubscribeMode::RETAINED, |value| assert_eq!(value, 3));
//! scheduler.advance(Duration::from_secs(10));
//! assert_eq!(polls.load(Ordering::SeqCst), 3);
//! ```

mod config;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::deferred::{Completer, Deferred};
use crate::scheduler::SharedScheduler;

pub use config::{Backoff, PollingConfig};

type Generator<T> = Box<dyn FnMut() -> Deferred<T> + Send>;
type Predicate<T> = Box<dyn FnMut(&T) -> bool + Send>;
type Observer<T> = Box<dyn FnMut(&T) + Send>;
type Finalizer<T> = Box<dyn FnMut(T) -> T + Send>;

/// Builder and driver of a polling loop.
pub struct PollingEngine<T> {
    scheduler: SharedScheduler,
    config: PollingConfig,
    behavior: Behavior<T>,
}

/// User callbacks of one engine.
struct Behavior<T> {
    generator: Generator<T>,
    should_repeat: Predicate<T>,
    on_response: Option<Observer<T>>,
    finalize: Option<Finalizer<T>>,
}

/// Mutable progress of a started engine.
struct Progress<T> {
    target: Option<Completer<T>>,
    current: Option<Deferred<T>>,
    attempt: u32,
    remaining: u32,
    started_at: Option<Instant>,
    canceled: bool,
    /// An attempt loop is running on some frame.
    attempting: bool,
    /// Another attempt was requested while `attempting` was set.
    rearm: bool,
}

/// A started engine, shared between the returned instance and scheduled jobs.
struct Run<T> {
    scheduler: SharedScheduler,
    config: PollingConfig,
    behavior: Mutex<Behavior<T>>,
    progress: Mutex<Progress<T>>,
}

/// What an attempt's result leads to.
enum Verdict<T> {
    Repeat { retry: u32 },
    Deliver(T),
    Ignore,
}

impl<T: Clone + Send + 'static> PollingEngine<T> {
    /// Creates an engine that generates attempts with `generator` and schedules
    /// re-attempts on `scheduler`.
    ///
    /// By default no result is repeated; install a predicate with
    /// [`should_repeat`](Self::should_repeat).
    pub fn new<G>(scheduler: SharedScheduler, generator: G, config: PollingConfig) -> Self
    where
        G: FnMut() -> Deferred<T> + Send + 'static,
    {
        Self {
            scheduler,
            config,
            behavior: Behavior {
                generator: Box::new(generator),
                should_repeat: Box::new(|_| false),
                on_response: None,
                finalize: None,
            },
        }
    }

    /// Re-attempts while `predicate` holds (and the budget allows it).
    #[must_use]
    pub fn should_repeat<P>(mut self, predicate: P) -> Self
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        self.behavior.should_repeat = Box::new(predicate);
        self
    }

    /// Observes every attempt's result, final or not.
    #[must_use]
    pub fn on_response<O>(mut self, observer: O) -> Self
    where
        O: FnMut(&T) + Send + 'static,
    {
        self.behavior.on_response = Some(Box::new(observer));
        self
    }

    /// The configuration this engine runs with.
    #[must_use]
    pub const fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Consumes the engine and returns the instance that delivers the final
    /// result. The first attempt is generated when that instance is
    /// subscribed.
    pub fn start(self) -> Deferred<T> {
        let remaining = self.config.effective_retry_count();
        let run = Arc::new(Run {
            scheduler: self.scheduler,
            config: self.config,
            behavior: Mutex::new(self.behavior),
            progress: Mutex::new(Progress {
                target: None,
                current: None,
                attempt: 0,
                remaining,
                started_at: None,
                canceled: false,
                attempting: false,
                rearm: false,
            }),
        });

        let starter = Arc::clone(&run);
        Deferred::with_stop(
            move |completer| {
                {
                    let mut progress = starter.progress.lock();
                    progress.target = Some(completer);
                    progress.started_at = Some(starter.scheduler.now());
                }
                starter.attempt();
            },
            move || run.cancel(),
        )
    }
}

impl<V, E> PollingEngine<Result<V, E>>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Maps a final failure through `transform` before delivery.
    ///
    /// Only the delivered result is mapped; `should_repeat` and `on_response`
    /// see the raw failure.
    #[must_use]
    pub fn map_final_error<F>(mut self, mut transform: F) -> Self
    where
        F: FnMut(E) -> E + Send + 'static,
    {
        self.behavior.finalize = Some(Box::new(move |result: Result<V, E>| result.map_err(&mut transform)));
        self
    }
}

impl<T: Clone + Send + 'static> Run<T> {
    /// Runs attempts until none is requested.
    ///
    /// A scheduler that runs jobs inline calls back into `attempt` from inside
    /// `settle`. That nested request only sets `rearm`, and the outer frame
    /// picks it up here, so the stack stays flat however many attempts run.
    fn attempt(self: &Arc<Self>) {
        {
            let mut progress = self.progress.lock();
            if progress.attempting {
                progress.rearm = true;
                return;
            }
            progress.attempting = true;
        }
        loop {
            self.attempt_once();
            let mut progress = self.progress.lock();
            if progress.rearm && !progress.canceled {
                progress.rearm = false;
                continue;
            }
            progress.rearm = false;
            progress.attempting = false;
            break;
        }
    }

    /// Generates and subscribes the next attempt.
    fn attempt_once(self: &Arc<Self>) {
        let number = {
            let mut progress = self.progress.lock();
            if progress.canceled {
                return;
            }
            progress.attempt += 1;
            progress.attempt
        };

        let deferred = (self.behavior.lock().generator)();
        {
            let mut progress = self.progress.lock();
            if progress.canceled {
                drop(progress);
                deferred.cancel();
                return;
            }
            progress.current = Some(deferred.clone());
        }
        tracing::debug!(attempt = number, "polling attempt started");

        let on_result = Arc::downgrade(self);
        let on_cancel = Arc::downgrade(self);
        deferred.attach(
            move |value| {
                if let Some(run) = on_result.upgrade() {
                    run.settle(number, value);
                }
            },
            move || {
                if let Some(run) = on_cancel.upgrade() {
                    run.attempt_canceled(number);
                }
            },
        );
    }

    fn settle(self: &Arc<Self>, number: u32, value: T) {
        let verdict = self.judge(number, value);
        match verdict {
            Verdict::Repeat { retry } => {
                let delay = self.config.delay_for(retry);
                tracing::debug!(attempt = number, ?delay, "polling re-attempt scheduled");
                let run: Weak<Self> = Arc::downgrade(self);
                self.scheduler.run_after(
                    delay,
                    Box::new(move || {
                        if let Some(run) = run.upgrade() {
                            run.attempt();
                        }
                    }),
                );
            }
            Verdict::Deliver(value) => {
                let target = {
                    let mut progress = self.progress.lock();
                    progress.current = None;
                    progress.target.take()
                };
                tracing::debug!(attempts = number, "polling finished");
                if let Some(target) = target {
                    target.deliver(value);
                }
            }
            Verdict::Ignore => {}
        }
    }

    /// Decides whether `value` ends the loop.
    fn judge(&self, number: u32, value: T) -> Verdict<T> {
        let (can_repeat, retry) = {
            let progress = self.progress.lock();
            if progress.canceled || progress.attempt != number || progress.target.is_none() {
                return Verdict::Ignore;
            }
            let elapsed = progress
                .started_at
                .map(|started_at| self.scheduler.now().saturating_duration_since(started_at))
                .unwrap_or_default();
            let within_floor = self
                .config
                .minimum_waiting_time
                .is_some_and(|minimum| elapsed < minimum);
            (progress.remaining > 0 || within_floor, number - 1)
        };

        let mut behavior = self.behavior.lock();
        if let Some(observer) = behavior.on_response.as_mut() {
            observer(&value);
        }
        if can_repeat && (behavior.should_repeat)(&value) {
            drop(behavior);
            let mut progress = self.progress.lock();
            progress.remaining = progress.remaining.saturating_sub(1);
            progress.current = None;
            return Verdict::Repeat { retry };
        }
        match behavior.finalize.as_mut() {
            Some(finalize) => Verdict::Deliver(finalize(value)),
            None => Verdict::Deliver(value),
        }
    }

    /// An attempt canceled by its producer ends the loop.
    fn attempt_canceled(&self, number: u32) {
        let target = {
            let mut progress = self.progress.lock();
            if progress.canceled || progress.attempt != number {
                return;
            }
            progress.canceled = true;
            progress.current = None;
            progress.target.take()
        };
        tracing::debug!(attempt = number, "polling attempt canceled; stopping");
        if let Some(target) = target {
            target.cancel();
        }
    }

    fn cancel(&self) {
        let current = {
            let mut progress = self.progress.lock();
            if progress.canceled {
                return;
            }
            progress.canceled = true;
            progress.target = None;
            progress.current.take()
        };
        tracing::debug!("polling canceled");
        if let Some(current) = current {
            current.cancel();
        }
    }
}

impl<T> fmt::Debug for PollingEngine<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PollingEngine")
            .field("config", &self.config)
            .field("has_on_response", &self.behavior.on_response.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{DeferredState, SubscribeMode};
    use crate::scheduler::{Immediate, ManualScheduler};
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[fixture]
    fn scheduler() -> Arc<ManualScheduler> {
        Arc::new(ManualScheduler::new())
    }

    /// Generator returning ready attempts numbered from 1.
    fn numbered(counter: &Arc<AtomicU32>) -> impl FnMut() -> Deferred<u32> + Send + 'static {
        let counter = Arc::clone(counter);
        move || Deferred::ready(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn capture(deferred: &Deferred<u32>) -> Arc<Mutex<Option<u32>>> {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        deferred.subscribe(SubscribeMode::RETAINED, move |value| *sink.lock() = Some(value));
        seen
    }

    #[rstest]
    fn test_retry_budget_bounds_attempts(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(3),
        )
        .should_repeat(|_| true)
        .start();

        let seen = capture(&polled);
        while scheduler.run_next() {}

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock(), Some(4));
    }

    #[rstest]
    fn test_stops_when_predicate_is_satisfied(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(10),
        )
        .should_repeat(|value| *value < 2)
        .start();

        let seen = capture(&polled);
        while scheduler.run_next() {}

        assert_eq!(*seen.lock(), Some(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_zero_retry_count_is_raised_to_one(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(0),
        )
        .should_repeat(|_| true)
        .start();

        let seen = capture(&polled);
        while scheduler.run_next() {}

        assert_eq!(*seen.lock(), Some(2));
    }

    #[rstest]
    fn test_minimum_waiting_time_extends_polling(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default()
                .with_retry_count(1)
                .with_idle_interval(Duration::from_secs(1))
                .with_minimum_waiting_time(Duration::from_secs(5)),
        )
        .should_repeat(|_| true)
        .start();

        let seen = capture(&polled);
        while scheduler.run_next() {}

        // Attempts land at t = 0, 1, 2, 3, 4, 5; the one at t = 5 is no longer
        // under the floor and the budget is spent.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(*seen.lock(), Some(6));
        assert_eq!(scheduler.elapsed(), Duration::from_secs(5));
    }

    #[rstest]
    fn test_floor_keeps_polling_after_first_slow_attempt(scheduler: Arc<ManualScheduler>) {
        let slot: Arc<Mutex<Option<Completer<u32>>>> = Arc::new(Mutex::new(None));
        let store = Arc::clone(&slot);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let polled = PollingEngine::new(
            scheduler.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let store = Arc::clone(&store);
                Deferred::new(move |completer| *store.lock() = Some(completer))
            },
            PollingConfig::default()
                .with_retry_count(1)
                .with_minimum_waiting_time(Duration::from_secs(5)),
        )
        .should_repeat(|_| true)
        .start();
        let _seen = capture(&polled);

        scheduler.advance(Duration::from_secs(1));
        let first = slot.lock().take().expect("first attempt");
        first.complete(0);
        scheduler.advance(Duration::from_secs(1));
        let second = slot.lock().take().expect("second attempt");
        second.complete(0);

        assert_eq!(scheduler.pending_jobs(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_on_response_sees_every_attempt(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let responses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&responses);
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(2),
        )
        .should_repeat(|_| true)
        .on_response(move |value| sink.lock().push(*value))
        .start();

        let _seen = capture(&polled);
        while scheduler.run_next() {}

        assert_eq!(*responses.lock(), vec![1, 2, 3]);
    }

    #[rstest]
    fn test_cancel_stops_scheduling(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(5),
        )
        .should_repeat(|_| true)
        .start();
        let seen = capture(&polled);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        polled.cancel();
        while scheduler.run_next() {}

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), None);
        assert_eq!(polled.state(), DeferredState::Canceled);
    }

    #[rstest]
    fn test_cancel_cancels_current_attempt(scheduler: Arc<ManualScheduler>) {
        let attempt = Deferred::<u32>::manual();
        let handle = attempt.clone();
        let polled = PollingEngine::new(scheduler, move || handle.clone(), PollingConfig::default()).start();
        polled.one_way(SubscribeMode::WEAK);
        assert_eq!(attempt.state(), DeferredState::Pending);

        polled.cancel();

        assert_eq!(attempt.state(), DeferredState::Canceled);
    }

    #[rstest]
    fn test_map_final_error_rewrites_terminal_failure(scheduler: Arc<ManualScheduler>) {
        let polled = PollingEngine::new(
            scheduler.clone(),
            || Deferred::<Result<u8, String>>::failure("not ready".to_string()),
            PollingConfig::default().with_retry_count(2),
        )
        .should_repeat(Result::is_err)
        .map_final_error(|error| format!("timed out: {error}"))
        .start();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        polled.subscribe(SubscribeMode::RETAINED, move |value| *sink.lock() = Some(value));
        while scheduler.run_next() {}

        assert_eq!(*seen.lock(), Some(Err("timed out: not ready".to_string())));
    }

    #[rstest]
    fn test_backoff_spaces_attempts(scheduler: Arc<ManualScheduler>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            scheduler.clone(),
            numbered(&attempts),
            PollingConfig::default()
                .with_retry_count(3)
                .with_idle_interval(Duration::from_secs(1))
                .with_backoff(Backoff::new(2.0, Duration::from_secs(60))),
        )
        .should_repeat(|_| true)
        .start();
        let _seen = capture(&polled);

        while scheduler.run_next() {}

        assert_eq!(scheduler.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[rstest]
    fn test_inline_scheduler_runs_long_budget_without_nesting() {
        let attempts = Arc::new(AtomicU32::new(0));
        let polled = PollingEngine::new(
            Arc::new(Immediate),
            numbered(&attempts),
            PollingConfig::default().with_retry_count(100_000),
        )
        .should_repeat(|_| true)
        .start();

        let seen = capture(&polled);

        assert_eq!(*seen.lock(), Some(100_001));
        assert_eq!(attempts.load(Ordering::SeqCst), 100_001);
        assert_eq!(polled.state(), DeferredState::Completed);
    }

    #[rstest]
    fn test_inline_scheduler_honors_minimum_waiting_time() {
        let attempts = Arc::new(AtomicU32::new(0));
        let began = Instant::now();
        let polled = PollingEngine::new(
            Arc::new(Immediate),
            numbered(&attempts),
            PollingConfig::default()
                .with_retry_count(1)
                .with_minimum_waiting_time(Duration::from_millis(50)),
        )
        .should_repeat(|_| true)
        .start();

        let seen = capture(&polled);

        assert!(began.elapsed() >= Duration::from_millis(50));
        assert!(attempts.load(Ordering::SeqCst) > 2);
        assert_eq!(*seen.lock(), Some(attempts.load(Ordering::SeqCst)));
    }
}
