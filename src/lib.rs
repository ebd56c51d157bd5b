//! # deferral
//!
//! Callback-driven deferred values for Rust: a lazily started, cancelable
//! cell that delivers a value once (or repeatedly) to a subscriber, plus the
//! machinery built on top of it.
//!
//! ## Overview
//!
//! - **Deferred**: [`Deferred<T>`] with lazy start, explicit stop, retained or
//!   weak ownership, one-shot or repeatable delivery and ordered hooks
//! - **Combinators**: `map`, `and_then`, `flat_map`, [`zip`], [`zip_all`] and
//!   their fail-fast `Result` variants
//! - **Pending cache**: [`PendingCache`] coalesces concurrent requests onto one
//!   in-flight operation
//! - **Polling**: [`polling::PollingEngine`] re-issues an operation until a
//!   predicate is satisfied or the retry budget is spent
//! - **Scheduling**: the [`scheduler::Scheduler`] seam, with a deterministic
//!   [`scheduler::ManualScheduler`] for tests
//! - **Blocking wait**: [`await_result`] for synchronous call sites
//!
//! ## Feature Flags
//!
//! - `pending`: the pending-operation cache (default)
//! - `polling`: the polling engine (default)
//! - `wait`: the blocking wait helper (default)
//! - `async`: Tokio scheduler and `.await` support for [`Deferred`]
//! - `serde`: `Serialize`/`Deserialize` for polling configuration
//! - `full`: Enable all features
//!
//! ## Example
//!
//! ```rust
//! use deferral::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//!
//! let total = zip(&Deferred::ready(2), &Deferred::ready(3)).map(|(left, right)| left + right);
//! total.subscribe(SubscribeMode::RETAINED, move |value| sink.lock().unwrap().push(value));
//!
//! assert_eq!(*seen.lock().unwrap(), vec![5]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Note: Disabling redundant_closure_for_method_calls due to clippy 0.1.92 panic bug
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use deferral::prelude::*;
/// ```
pub mod prelude {
    pub use crate::combinator::{zip, zip_all, zip_all_ok, zip_ok, zip_with, zip3};
    pub use crate::deferred::{Completer, Deferred, DeferredState, Repeat, Retention, SubscribeMode};
    pub use crate::error::DeferredError;
    pub use crate::scheduler::{Scheduler, SharedScheduler};

    #[cfg(feature = "pending")]
    pub use crate::pending::PendingCache;

    #[cfg(feature = "polling")]
    pub use crate::polling::{PollingConfig, PollingEngine};

    #[cfg(feature = "wait")]
    pub use crate::wait::{await_result, try_await_result};
}

pub mod combinator;
pub mod deferred;
pub mod error;
pub mod scheduler;

#[cfg(feature = "pending")]
pub mod pending;

#[cfg(feature = "polling")]
pub mod polling;

#[cfg(feature = "wait")]
pub mod wait;

pub use combinator::{zip, zip_all, zip_all_ok, zip_ok, zip_with, zip3};
#[cfg(feature = "async")]
pub use deferred::DeferredFuture;
pub use deferred::{Completer, Deferred, DeferredState, Identity, Repeat, Retention, SubscribeMode};
pub use error::DeferredError;

#[cfg(feature = "pending")]
pub use pending::PendingCache;

#[cfg(feature = "wait")]
pub use wait::{await_result, try_await_result};
