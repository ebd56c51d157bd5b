//! Execution contexts.
//!
//! Nothing in this crate spawns threads. Whenever work has to run later (a
//! polling re-attempt, a delivery hopped onto another context) it is handed to a
//! [`Scheduler`], which decides where and when the closure actually runs.
//!
//! Three implementations ship with the crate:
//!
//! - [`Immediate`]: runs every job inline on the calling thread
//! - [`ManualScheduler`]: deterministic virtual-time queue, driven explicitly
//! - `TokioScheduler` (feature `async`): spawns onto a Tokio runtime
//!
//! # Examples
//!
//! ```rust
//! use deferral::scheduler::{ManualScheduler, Scheduler};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//!
//! let scheduler = ManualScheduler::new();
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&fired);
//!
//! scheduler.run_after(Duration::from_secs(2), Box::new(move || flag.store(true, Ordering::SeqCst)));
//! scheduler.advance(Duration::from_secs(1));
//! assert!(!fired.load(Ordering::SeqCst));
//!
//! scheduler.advance(Duration::from_secs(1));
//! assert!(fired.load(Ordering::SeqCst));
//! ```

mod manual;
#[cfg(feature = "async")]
mod tokio_runtime;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use manual::ManualScheduler;
#[cfg(feature = "async")]
pub use tokio_runtime::TokioScheduler;

/// A unit of work handed to a [`Scheduler`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A minimal "run now / run later / run after a delay" service.
///
/// All three methods are fire-and-forget: they return nothing and the caller
/// never observes when (or whether) the job ran.
pub trait Scheduler: Send + Sync {
    /// Runs `work` on this context, synchronously if the context allows it.
    fn run_now(&self, work: Work);

    /// Runs `work` on this context at some later point.
    fn run_async(&self, work: Work);

    /// Runs `work` on this context once `delay` has elapsed.
    fn run_after(&self, delay: Duration, work: Work);

    /// The clock this scheduler measures delays against.
    ///
    /// Virtual-time schedulers override this so that elapsed-time checks made by
    /// callers agree with the scheduler's notion of "now".
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn run_now(&self, work: Work) {
        (**self).run_now(work);
    }

    fn run_async(&self, work: Work) {
        (**self).run_async(work);
    }

    fn run_after(&self, delay: Duration, work: Work) {
        (**self).run_after(delay, work);
    }

    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Runs every job inline on the calling thread.
///
/// `run_after` ignores its delay. Use [`ManualScheduler`] when delays matter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn run_now(&self, work: Work) {
        work();
    }

    fn run_async(&self, work: Work) {
        work();
    }

    fn run_after(&self, _delay: Duration, work: Work) {
        work();
    }
}

/// Shared, type-erased scheduler handle used throughout the crate.
pub type SharedScheduler = Arc<dyn Scheduler>;
