//! Tokio-backed scheduler.
//!
//! Jobs are spawned onto a runtime through its [`Handle`]. When constructed with
//! [`TokioScheduler::current`] inside a runtime, the caller's runtime is reused so
//! that tracing spans and runtime metrics stay attached to the caller's context.

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;

use super::{Scheduler, Work};

/// Adapter that runs jobs on a Tokio runtime.
///
/// - `run_now` runs the job inline on the calling thread
/// - `run_async` spawns a task that runs the job
/// - `run_after` spawns a task that sleeps for the delay, then runs the job
///
/// # Examples
///
/// ```rust
/// use deferral::scheduler::{Scheduler, TokioScheduler};
///
/// #[tokio::main]
/// async fn main() {
///     let scheduler = TokioScheduler::current().expect("inside a runtime");
///     let (sender, receiver) = tokio::sync::oneshot::channel();
///     scheduler.run_async(Box::new(move || {
///         let _ = sender.send(42);
///     }));
///     assert_eq!(receiver.await, Ok(42));
/// }
/// ```
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Wraps an explicit runtime handle.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is currently running on.
    ///
    /// Returns `None` outside of a Tokio runtime.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// The wrapped runtime handle.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Scheduler for TokioScheduler {
    fn run_now(&self, work: Work) {
        work();
    }

    fn run_async(&self, work: Work) {
        self.handle.spawn(async move { work() });
    }

    fn run_after(&self, delay: Duration, work: Work) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            work();
        });
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokioScheduler")
            .field("flavor", &self.handle.runtime_flavor())
            .finish()
    }
}
