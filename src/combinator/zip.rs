//! Aggregation combinators.
//!
//! Results are always laid out by input position, never by arrival order.
//! Inputs start only when the aggregate is subscribed; canceling the
//! aggregate cancels every input.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::deferred::{Completer, Deferred};

/// Values collected so far by a pair zip.
struct Pair<A, B> {
    first: Option<A>,
    second: Option<B>,
}

impl<A, B> Pair<A, B> {
    const fn new() -> Self {
        Self {
            first: None,
            second: None,
        }
    }

    fn take_ready(&mut self) -> Option<(A, B)> {
        if self.first.is_some() && self.second.is_some() {
            self.first.take().zip(self.second.take())
        } else {
            None
        }
    }
}

/// Values collected so far by a collection zip.
struct Slots<T> {
    values: Vec<Option<T>>,
    missing: usize,
    failed: bool,
}

impl<T> Slots<T> {
    fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat_with(|| None).take(len).collect(),
            missing: len,
            failed: false,
        }
    }

    /// Stores `value` at `index` and hands out the full row once every slot is
    /// filled. A repeated value for a filled slot replaces it.
    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.values[index].replace(value).is_none() {
            self.missing -= 1;
        }
        if self.missing > 0 {
            return None;
        }
        self.missing = self.values.len();
        Some(self.values.iter_mut().filter_map(Option::take).collect())
    }
}

/// Builds an aggregate that starts `wire` on subscription and cancels every
/// input when it is canceled or abandoned.
fn aggregate<T, F>(cancel_inputs: Vec<Box<dyn Fn() + Send>>, wire: F) -> Deferred<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(Completer<T>) + Send + 'static,
{
    Deferred::with_stop(wire, move || {
        for cancel in &cancel_inputs {
            cancel();
        }
    })
}

fn canceler<T: Clone + Send + 'static>(input: &Deferred<T>) -> Box<dyn Fn() + Send> {
    let input = input.clone();
    Box::new(move || input.cancel())
}

/// Completes with both values once `first` and `second` have each produced one.
///
/// The pair is `(A, B)` regardless of which input completes first. Canceling
/// either input cancels the result.
///
/// # Examples
///
/// ```rust
/// use deferral::{Deferred, SubscribeMode, zip};
///
/// let count = Deferred::<i32>::manual();
/// let flag = Deferred::<bool>::manual();
/// let zipped = zip(&count, &flag);
/// zipped.subscribe(SubscribeMode::RETAINED, |pair| assert_eq!(pair, (1, true)));
///
/// flag.complete(true);
/// count.complete(1);
/// ```
pub fn zip<A, B>(first: &Deferred<A>, second: &Deferred<B>) -> Deferred<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let inputs = (first.clone(), second.clone());
    aggregate(vec![canceler(first), canceler(second)], move |completer| {
        let (first, second) = inputs;
        let pair = Arc::new(Mutex::new(Pair::new()));

        let (slots, target, on_cancel) = (Arc::clone(&pair), completer.clone(), completer.clone());
        first.attach(
            move |value| {
                let ready = {
                    let mut slots = slots.lock();
                    slots.first = Some(value);
                    slots.take_ready()
                };
                if let Some(both) = ready {
                    target.deliver(both);
                }
            },
            move || on_cancel.cancel(),
        );

        let (target, on_cancel) = (completer.clone(), completer);
        second.attach(
            move |value| {
                let ready = {
                    let mut slots = pair.lock();
                    slots.second = Some(value);
                    slots.take_ready()
                };
                if let Some(both) = ready {
                    target.deliver(both);
                }
            },
            move || on_cancel.cancel(),
        );
    })
}

/// Zips two instances and combines their values with `combine`.
pub fn zip_with<A, B, C, F>(first: &Deferred<A>, second: &Deferred<B>, mut combine: F) -> Deferred<C>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    F: FnMut(A, B) -> C + Send + 'static,
{
    zip(first, second).map(move |(a, b)| combine(a, b))
}

/// Zips three instances into a flat tuple.
pub fn zip3<A, B, C>(first: &Deferred<A>, second: &Deferred<B>, third: &Deferred<C>) -> Deferred<(A, B, C)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
{
    zip(&zip(first, second), third).map(|((a, b), c)| (a, b, c))
}

/// Completes with every input's value, in input order.
///
/// An empty collection completes with an empty vector as soon as it is
/// subscribed. Canceling the result cancels every input; canceling any input
/// cancels the result.
pub fn zip_all<T, I>(inputs: I) -> Deferred<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Deferred<T>>,
{
    let inputs: Vec<Deferred<T>> = inputs.into_iter().collect();
    if inputs.is_empty() {
        return Deferred::ready(Vec::new());
    }

    let cancelers = inputs.iter().map(canceler).collect();
    aggregate(cancelers, move |completer| {
        let slots = Arc::new(Mutex::new(Slots::new(inputs.len())));
        for (index, input) in inputs.into_iter().enumerate() {
            let (slots, target, on_cancel) = (Arc::clone(&slots), completer.clone(), completer.clone());
            input.attach(
                move |value| {
                    let ready = slots.lock().fill(index, value);
                    if let Some(row) = ready {
                        target.deliver(row);
                    }
                },
                move || on_cancel.cancel(),
            );
        }
    })
}

/// Result-typed pair zip with short-circuit.
///
/// Completes with `Ok((a, b))` once both succeed. The first failure observed
/// completes the result immediately and cancels the other input.
///
/// # Examples
///
/// ```rust
/// use deferral::{Deferred, DeferredState, SubscribeMode, zip_ok};
///
/// let fails = Deferred::<Result<i32, &str>>::failure("E1");
/// let never = Deferred::<Result<bool, &str>>::manual();
/// let zipped = zip_ok(&fails, &never);
/// zipped.subscribe(SubscribeMode::RETAINED, |result| assert_eq!(result, Err("E1")));
///
/// assert_eq!(never.state(), DeferredState::Canceled);
/// ```
pub fn zip_ok<A, B, E>(
    first: &Deferred<Result<A, E>>,
    second: &Deferred<Result<B, E>>,
) -> Deferred<Result<(A, B), E>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let inputs = (first.clone(), second.clone());
    aggregate(vec![canceler(first), canceler(second)], move |completer| {
        let (first, second) = inputs;
        let state = Arc::new(Mutex::new((Pair::new(), false)));
        let (first_sibling, second_sibling) = (first.completer(), second.completer());

        let (shared, target, on_cancel) = (Arc::clone(&state), completer.clone(), completer.clone());
        first.attach(
            move |result: Result<A, E>| {
                let outcome = {
                    let mut guard = shared.lock();
                    let (pair, failed) = &mut *guard;
                    settle(failed, result, |value| {
                        pair.first = Some(value);
                        pair.take_ready()
                    })
                };
                deliver_or_cancel(outcome, &target, [&second_sibling]);
            },
            move || on_cancel.cancel(),
        );

        let (target, on_cancel) = (completer.clone(), completer);
        second.attach(
            move |result: Result<B, E>| {
                let outcome = {
                    let mut guard = state.lock();
                    let (pair, failed) = &mut *guard;
                    settle(failed, result, |value| {
                        pair.second = Some(value);
                        pair.take_ready()
                    })
                };
                deliver_or_cancel(outcome, &target, [&first_sibling]);
            },
            move || on_cancel.cancel(),
        );
    })
}

/// Collection form of [`zip_ok`]: `Ok` with every success in input order, or
/// the first failure observed, after which every other input is canceled.
pub fn zip_all_ok<T, E, I>(inputs: I) -> Deferred<Result<Vec<T>, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    I: IntoIterator<Item = Deferred<Result<T, E>>>,
{
    let inputs: Vec<Deferred<Result<T, E>>> = inputs.into_iter().collect();
    if inputs.is_empty() {
        return Deferred::ready(Ok(Vec::new()));
    }

    let cancelers = inputs.iter().map(canceler).collect();
    aggregate(cancelers, move |completer| {
        let slots = Arc::new(Mutex::new(Slots::new(inputs.len())));
        let siblings: Arc<Vec<Completer<Result<T, E>>>> =
            Arc::new(inputs.iter().map(Deferred::completer).collect());

        for (index, input) in inputs.into_iter().enumerate() {
            let (slots, siblings) = (Arc::clone(&slots), Arc::clone(&siblings));
            let (target, on_cancel) = (completer.clone(), completer.clone());
            input.attach(
                move |result| {
                    let outcome = {
                        let mut guard = slots.lock();
                        let mut failed = guard.failed;
                        let outcome = settle(&mut failed, result, |value| guard.fill(index, value));
                        guard.failed = failed;
                        outcome
                    };
                    let others = siblings
                        .iter()
                        .enumerate()
                        .filter(|(position, _)| *position != index)
                        .map(|(_, sibling)| sibling);
                    deliver_or_cancel(outcome, &target, others);
                },
                move || on_cancel.cancel(),
            );
        }
    })
}

/// Applies one input result to the shared short-circuit state.
///
/// Returns the aggregate outcome to deliver, if any. After the first failure
/// every later result is ignored.
fn settle<V, R, E>(
    failed: &mut bool,
    result: Result<V, E>,
    store: impl FnOnce(V) -> Option<R>,
) -> Option<Result<R, E>> {
    if *failed {
        return None;
    }
    match result {
        Ok(value) => store(value).map(Ok),
        Err(error) => {
            *failed = true;
            Some(Err(error))
        }
    }
}

/// Delivers an aggregate outcome; a failure also cancels the given inputs.
fn deliver_or_cancel<'a, R, E, S>(
    outcome: Option<Result<R, E>>,
    target: &Completer<Result<R, E>>,
    siblings: impl IntoIterator<Item = &'a Completer<S>>,
) where
    R: Clone + Send + 'static,
    E: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    let Some(outcome) = outcome else {
        return;
    };
    let failure = outcome.is_err();
    target.deliver(outcome);
    if failure {
        tracing::debug!("zip short-circuited on failure; canceling remaining inputs");
        for sibling in siblings {
            sibling.cancel();
        }
    }
}
