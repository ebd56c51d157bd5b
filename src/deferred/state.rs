//! Internal state machine behind every [`Deferred`](super::Deferred).
//!
//! # Locking discipline
//!
//! Each instance owns one non-reentrant `parking_lot::Mutex`. It guards the
//! phase transition and the hook lists only; user code (start/stop actions,
//! handlers, hooks) always runs after the guard is dropped. A `complete` that
//! arrives while a delivery is running (from another thread, or re-entrantly
//! from inside a hook) is queued and delivered by the active deliverer, so
//! deliveries on one instance never overlap and keep call order.
//!
//! # Invariants
//!
//! - `start` is `Some` only while the phase is `Idle`
//! - `retained` is `Some` only while the phase is `Pending`
//! - once the phase is `Completed` or `Canceled` no hook is stored; late
//!   registrations are replayed from `memo` (completed) or dropped (canceled)
//! - a `Completed` instance whose value is still queued can be canceled; the
//!   queued value is then never delivered
//! - while a final round is pending or running, a second `subscribe` fails
//!   with `DoubleSubscription`; a first one made then is replayed after the
//!   round

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Completer, DeferredState, Identity, Repeat, Retention, SubscribeMode};
use crate::error::DeferredError;
use crate::scheduler::SharedScheduler;

pub(crate) type StartAction<T> = Box<dyn FnOnce(Completer<T>) + Send>;
pub(crate) type StopAction = Box<dyn FnOnce() + Send>;
pub(crate) type Handler<T> = Box<dyn FnMut(T) + Send>;
pub(crate) type Hook<T> = Box<dyn FnMut(&T) + Send>;
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

pub(crate) struct Shared<T> {
    pub(crate) core: Mutex<Core<T>>,
}

pub(crate) struct Core<T> {
    pub(crate) phase: DeferredState,
    pub(crate) identity: Identity,
    start: Option<StartAction<T>>,
    stop: Option<StopAction>,
    repeat: Repeat,
    handler: Option<Handler<T>>,
    handler_busy: bool,
    listeners: Vec<Handler<T>>,
    before: Vec<Hook<T>>,
    after: Vec<Hook<T>>,
    cancel_hooks: Vec<CancelHook>,
    retained: Option<Arc<Shared<T>>>,
    queue: VecDeque<T>,
    delivering: bool,
    memo: Option<T>,
    pub(crate) scheduler: Option<SharedScheduler>,
}

/// What a registration has to do once the lock is released.
enum Registration<T> {
    Stored,
    Start(StartAction<T>),
    Replay(T),
    Dropped,
}

/// Everything a delivery round takes out of the core.
struct Round<T> {
    value: T,
    handler: Option<Handler<T>>,
    listeners: Vec<Handler<T>>,
    before: Vec<Hook<T>>,
    after: Vec<Hook<T>>,
}

impl<T> Shared<T> {
    pub(crate) fn new(start: StartAction<T>, stop: Option<StopAction>) -> Self {
        Self {
            core: Mutex::new(Core {
                phase: DeferredState::Idle,
                identity: Identity::Instance,
                start: Some(start),
                stop,
                repeat: Repeat::Once,
                handler: None,
                handler_busy: false,
                listeners: Vec::new(),
                before: Vec::new(),
                after: Vec::new(),
                cancel_hooks: Vec::new(),
                retained: None,
                queue: VecDeque::new(),
                delivering: false,
                memo: None,
                scheduler: None,
            }),
        }
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    /// Installs the primary handler and starts the work if this is the first
    /// subscriber.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        mode: SubscribeMode,
        handler: Handler<T>,
    ) -> Result<(), DeferredError> {
        let mut handler = Some(handler);
        let registration = {
            let mut core = self.core.lock();
            match core.phase {
                DeferredState::Canceled => Registration::Dropped,
                DeferredState::Completed => {
                    if core.handler.is_some() || core.handler_busy {
                        return Err(DeferredError::DoubleSubscription);
                    }
                    if core.delivering {
                        // Picked up by the active round, or replayed once it ends.
                        core.handler = handler.take();
                        Registration::Stored
                    } else {
                        core.memo.clone().map_or(Registration::Dropped, Registration::Replay)
                    }
                }
                DeferredState::Idle | DeferredState::Pending => {
                    if core.handler.is_some() || core.handler_busy {
                        return Err(DeferredError::DoubleSubscription);
                    }
                    core.handler = handler.take();
                    core.repeat = mode.repeat;
                    if mode.retention == Retention::Retained && core.retained.is_none() {
                        core.retained = Some(Arc::clone(self));
                    }
                    core.begin()
                }
            }
        };

        match registration {
            Registration::Start(start) => self.run_start(start),
            Registration::Replay(value) => {
                if let Some(mut handler) = handler {
                    handler(value);
                }
            }
            Registration::Dropped => {
                tracing::debug!("subscription to a canceled deferred ignored");
            }
            Registration::Stored => {}
        }
        Ok(())
    }

    /// Adds a by-value listener used by combinators. Listeners run right after
    /// the primary handler and start the work like a subscriber does, without
    /// occupying the primary handler slot.
    pub(crate) fn attach(self: &Arc<Self>, listener: Handler<T>, on_cancel: CancelHook) {
        let mut listener = Some(listener);
        let mut on_cancel = Some(on_cancel);
        let registration = {
            let mut core = self.core.lock();
            match core.phase {
                DeferredState::Canceled => Registration::Dropped,
                DeferredState::Completed => core.memo.clone().map_or(Registration::Stored, Registration::Replay),
                DeferredState::Idle | DeferredState::Pending => {
                    core.listeners.extend(listener.take());
                    core.cancel_hooks.extend(on_cancel.take());
                    core.begin()
                }
            }
        };

        match registration {
            Registration::Start(start) => self.run_start(start),
            Registration::Replay(value) => {
                if let Some(mut listener) = listener {
                    listener(value);
                }
            }
            Registration::Dropped => {
                if let Some(on_cancel) = on_cancel {
                    on_cancel();
                }
            }
            Registration::Stored => {}
        }
    }

    /// Starts the work without installing any handler.
    pub(crate) fn begin(self: &Arc<Self>) {
        let start = {
            let mut core = self.core.lock();
            match core.begin() {
                Registration::Start(start) => Some(start),
                _ => None,
            }
        };
        if let Some(start) = start {
            self.run_start(start);
        }
    }

    pub(crate) fn add_before(&self, hook: Hook<T>) {
        self.add_hook(hook, |core| &mut core.before);
    }

    pub(crate) fn add_after(&self, hook: Hook<T>) {
        self.add_hook(hook, |core| &mut core.after);
    }

    fn add_hook(&self, hook: Hook<T>, list: impl FnOnce(&mut Core<T>) -> &mut Vec<Hook<T>>) {
        let mut hook = Some(hook);
        let replay = {
            let mut core = self.core.lock();
            match core.phase {
                DeferredState::Canceled => None,
                DeferredState::Completed => core.memo.clone(),
                DeferredState::Idle | DeferredState::Pending => {
                    list(&mut *core).extend(hook.take());
                    None
                }
            }
        };
        if let (Some(value), Some(mut hook)) = (replay, hook) {
            hook(&value);
        }
    }

    pub(crate) fn add_cancel_hook(&self, hook: CancelHook) {
        let mut hook = Some(hook);
        let run_now = {
            let mut core = self.core.lock();
            match core.phase {
                DeferredState::Canceled => true,
                DeferredState::Completed => false,
                DeferredState::Idle | DeferredState::Pending => {
                    core.cancel_hooks.extend(hook.take());
                    false
                }
            }
        };
        if let (true, Some(hook)) = (run_now, hook) {
            hook();
        }
    }

    fn run_start(self: &Arc<Self>, start: StartAction<T>) {
        tracing::trace!("deferred started");
        start(Completer::from_shared(self));
    }

    /// Validates and queues `value`, then delivers it inline or through the
    /// attached scheduler.
    pub(crate) fn complete(self: &Arc<Self>, value: T) -> Result<(), DeferredError> {
        let scheduler = {
            let mut core = self.core.lock();
            match core.phase {
                DeferredState::Idle => return Err(DeferredError::NoSubscriber),
                DeferredState::Completed => return Err(DeferredError::AlreadyCompleted),
                DeferredState::Canceled => {
                    tracing::debug!("completion of a canceled deferred ignored");
                    return Ok(());
                }
                DeferredState::Pending => {}
            }
            if core.repeat == Repeat::Once {
                core.phase = DeferredState::Completed;
                core.memo = Some(value.clone());
            }
            core.queue.push_back(value);
            if core.delivering {
                return Ok(());
            }
            core.delivering = true;
            core.scheduler.clone()
        };

        match scheduler {
            Some(scheduler) => {
                let shared = Arc::clone(self);
                scheduler.run_async(Box::new(move || shared.drain()));
            }
            None => self.drain(),
        }
        Ok(())
    }

    fn drain(&self) {
        while let Some(round) = self.next_round() {
            let Round {
                value,
                mut handler,
                mut listeners,
                mut before,
                mut after,
            } = round;

            tracing::trace!(listeners = listeners.len(), "delivering deferred value");
            for hook in &mut before {
                hook(&value);
            }
            if let Some(handler) = handler.as_mut() {
                handler(value.clone());
            }
            for listener in &mut listeners {
                listener(value.clone());
            }
            for hook in &mut after {
                hook(&value);
            }

            let mut released = self.finish_round(handler, listeners, before, after);
            if let Some((mut late, value)) = released.late.take() {
                late(value);
            }
            drop(released);
        }
    }

    fn next_round(&self) -> Option<Round<T>> {
        let mut core = self.core.lock();
        if core.phase == DeferredState::Canceled {
            core.queue.clear();
        }
        let Some(value) = core.queue.pop_front() else {
            core.delivering = false;
            return None;
        };
        let handler = core.handler.take();
        core.handler_busy = handler.is_some();
        Some(Round {
            value,
            handler,
            listeners: mem::take(&mut core.listeners),
            before: mem::take(&mut core.before),
            after: mem::take(&mut core.after),
        })
    }

    /// Puts the hooks back after a repeatable delivery, or tears everything down
    /// once a one-shot delivery is done. Returns what must be dropped outside
    /// the lock.
    fn finish_round(
        &self,
        handler: Option<Handler<T>>,
        listeners: Vec<Handler<T>>,
        before: Vec<Hook<T>>,
        after: Vec<Hook<T>>,
    ) -> Released<T> {
        let mut core = self.core.lock();
        core.handler_busy = false;
        match core.phase {
            DeferredState::Pending => {
                if core.handler.is_none() {
                    core.handler = handler;
                }
                restore(&mut core.listeners, listeners);
                restore(&mut core.before, before);
                restore(&mut core.after, after);
                Released::default()
            }
            DeferredState::Completed => {
                tracing::trace!("one-shot deferred finalized");
                let late = core.handler.take().zip(core.memo.clone());
                Released {
                    late,
                    _handler: handler,
                    _listeners: mem::take(&mut core.listeners),
                    _before: mem::take(&mut core.before),
                    _after: mem::take(&mut core.after),
                    cancel_hooks: mem::take(&mut core.cancel_hooks),
                    _retained: core.retained.take(),
                    stop: core.stop.take(),
                }
            }
            DeferredState::Idle | DeferredState::Canceled => Released {
                _handler: handler,
                _listeners: listeners,
                _before: before,
                _after: after,
                ..Released::default()
            },
        }
    }

    /// Moves to `Canceled`, running `stop` if the work had started.
    ///
    /// A one-shot value that was accepted but whose round has not begun yet
    /// is withdrawn as well. `stop` is skipped there since the work already
    /// produced its value.
    pub(crate) fn cancel(&self) {
        let released = {
            let mut core = self.core.lock();
            let started = match core.phase {
                DeferredState::Completed if !core.queue.is_empty() => false,
                DeferredState::Completed | DeferredState::Canceled => return,
                DeferredState::Idle => false,
                DeferredState::Pending => true,
            };
            core.phase = DeferredState::Canceled;
            core.queue.clear();
            core.memo = None;
            core.start = None;
            let stop = core.stop.take();
            Released {
                _handler: core.handler.take(),
                _listeners: mem::take(&mut core.listeners),
                _before: mem::take(&mut core.before),
                _after: mem::take(&mut core.after),
                cancel_hooks: mem::take(&mut core.cancel_hooks),
                _retained: core.retained.take(),
                stop: if started { stop } else { None },
                late: None,
            }
        };

        tracing::debug!("deferred canceled");
        released.run_cancellation();
    }

    pub(crate) fn state(&self) -> DeferredState {
        self.core.lock().phase
    }
}

impl<T> Core<T> {
    /// `Idle -> Pending`, handing out the start action exactly once.
    fn begin(&mut self) -> Registration<T> {
        if self.phase != DeferredState::Idle {
            return Registration::Stored;
        }
        self.phase = DeferredState::Pending;
        self.start.take().map_or(Registration::Stored, Registration::Start)
    }
}

fn restore<H>(slot: &mut Vec<H>, mut taken: Vec<H>) {
    taken.append(slot);
    *slot = taken;
}

/// Resources released by a transition, dropped or run once the lock is gone.
///
/// Underscored fields are only held to be dropped outside the lock.
struct Released<T> {
    _handler: Option<Handler<T>>,
    _listeners: Vec<Handler<T>>,
    _before: Vec<Hook<T>>,
    _after: Vec<Hook<T>>,
    _retained: Option<Arc<Shared<T>>>,
    cancel_hooks: Vec<CancelHook>,
    stop: Option<StopAction>,
    /// A handler that subscribed while the final round was running.
    late: Option<(Handler<T>, T)>,
}

impl<T> Default for Released<T> {
    fn default() -> Self {
        Self {
            _handler: None,
            _listeners: Vec::new(),
            _before: Vec::new(),
            _after: Vec::new(),
            _retained: None,
            cancel_hooks: Vec::new(),
            stop: None,
            late: None,
        }
    }
}

impl<T> Released<T> {
    fn run_cancellation(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        for hook in mem::take(&mut self.cancel_hooks) {
            hook();
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.phase != DeferredState::Pending {
            return;
        }
        core.phase = DeferredState::Canceled;
        tracing::debug!("pending deferred dropped; running stop");
        if let Some(stop) = core.stop.take() {
            stop();
        }
        for hook in mem::take(&mut core.cancel_hooks) {
            hook();
        }
    }
}
