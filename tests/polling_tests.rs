#![cfg(feature = "polling")]

use deferral::polling::{Backoff, PollingConfig, PollingEngine};
use deferral::scheduler::{Immediate, ManualScheduler};
use deferral::{Completer, Deferred, DeferredState, SubscribeMode};
use rstest::{fixture, rstest};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[fixture]
fn scheduler() -> Arc<ManualScheduler> {
    Arc::new(ManualScheduler::new())
}

fn capture<T: Clone + Send + 'static>(deferred: &Deferred<T>) -> Arc<Mutex<Option<T>>> {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    deferred.subscribe(SubscribeMode::RETAINED, move |value| *sink.lock().unwrap() = Some(value));
    seen
}

/// Simulated remote job: every attempt reports how many times it was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStatus {
    Running(u32),
    Finished(u32),
}

fn job_reporting_finished_after(
    polls_needed: u32,
    polls: &Arc<AtomicU32>,
) -> impl FnMut() -> Deferred<JobStatus> + Send + 'static {
    let polls = Arc::clone(polls);
    move || {
        let poll = polls.fetch_add(1, Ordering::SeqCst) + 1;
        if poll >= polls_needed {
            Deferred::ready(JobStatus::Finished(poll))
        } else {
            Deferred::ready(JobStatus::Running(poll))
        }
    }
}

// =============================================================================
// Retry Budget
// =============================================================================

#[rstest]
fn always_repeating_generator_runs_budget_plus_one_attempts(scheduler: Arc<ManualScheduler>) {
    let polls = Arc::new(AtomicU32::new(0));
    let polled = PollingEngine::new(
        scheduler.clone(),
        job_reporting_finished_after(u32::MAX, &polls),
        PollingConfig::default()
            .with_retry_count(3)
            .with_idle_interval(Duration::from_millis(500)),
    )
    .should_repeat(|_| true)
    .start();
    let seen = capture(&polled);

    let mut scheduled = 0;
    while scheduler.run_next() {
        scheduled += 1;
    }

    assert_eq!(scheduled, 3);
    assert_eq!(polls.load(Ordering::SeqCst), 4);
    assert_eq!(*seen.lock().unwrap(), Some(JobStatus::Running(4)));
    assert_eq!(scheduler.elapsed(), Duration::from_millis(1500));
}

#[rstest]
fn finished_job_ends_polling_early(scheduler: Arc<ManualScheduler>) {
    let polls = Arc::new(AtomicU32::new(0));
    let polled = PollingEngine::new(
        scheduler.clone(),
        job_reporting_finished_after(3, &polls),
        PollingConfig::default().with_retry_count(10),
    )
    .should_repeat(|status| matches!(status, JobStatus::Running(_)))
    .start();
    let seen = capture(&polled);

    while scheduler.run_next() {}

    assert_eq!(*seen.lock().unwrap(), Some(JobStatus::Finished(3)));
    assert_eq!(scheduler.pending_jobs(), 0);
}

#[rstest]
fn immediate_scheduler_polls_synchronously() {
    let polls = Arc::new(AtomicU32::new(0));
    let polled = PollingEngine::new(
        Arc::new(Immediate),
        job_reporting_finished_after(u32::MAX, &polls),
        PollingConfig::default().with_retry_count(3),
    )
    .should_repeat(|_| true)
    .start();

    let seen = capture(&polled);

    assert_eq!(polls.load(Ordering::SeqCst), 4);
    assert_eq!(*seen.lock().unwrap(), Some(JobStatus::Running(4)));
}

// =============================================================================
// Minimum Waiting Time
// =============================================================================

#[rstest]
fn slow_first_attempt_under_floor_is_repeated(scheduler: Arc<ManualScheduler>) {
    let parked: Arc<Mutex<Option<Completer<bool>>>> = Arc::new(Mutex::new(None));
    let store = Arc::clone(&parked);
    let polled = PollingEngine::new(
        scheduler.clone(),
        move || {
            let store = Arc::clone(&store);
            Deferred::new(move |completer| *store.lock().unwrap() = Some(completer))
        },
        PollingConfig::default()
            .with_retry_count(1)
            .with_minimum_waiting_time(Duration::from_secs(5)),
    )
    .should_repeat(|ready| !*ready)
    .start();
    let seen = capture(&polled);

    scheduler.advance(Duration::from_secs(1));
    let first = parked.lock().unwrap().take().expect("first attempt");
    first.complete(false);

    // The retry budget is spent by this re-attempt; only the floor keeps the
    // loop going past it.
    scheduler.advance(Duration::from_secs(1));
    let second = parked.lock().unwrap().take().expect("second attempt");
    second.complete(false);

    assert_eq!(scheduler.pending_jobs(), 1);
    assert_eq!(polled.state(), DeferredState::Pending);
    assert_eq!(*seen.lock().unwrap(), None);
}

#[rstest]
fn floor_ends_once_elapsed(scheduler: Arc<ManualScheduler>) {
    let polls = Arc::new(AtomicU32::new(0));
    let polled = PollingEngine::new(
        scheduler.clone(),
        job_reporting_finished_after(u32::MAX, &polls),
        PollingConfig::default()
            .with_retry_count(1)
            .with_idle_interval(Duration::from_secs(2))
            .with_minimum_waiting_time(Duration::from_secs(5)),
    )
    .should_repeat(|_| true)
    .start();
    let seen = capture(&polled);

    while scheduler.run_next() {}

    // Attempts at t = 0, 2, 4, 6: the one at t = 6 is past the floor with the
    // budget already spent.
    assert_eq!(polls.load(Ordering::SeqCst), 4);
    assert_eq!(scheduler.elapsed(), Duration::from_secs(6));
    assert_eq!(*seen.lock().unwrap(), Some(JobStatus::Running(4)));
}

// =============================================================================
// Backoff and Final Error Mapping
// =============================================================================

#[rstest]
fn backoff_spaces_attempts(scheduler: Arc<ManualScheduler>) {
    let polls = Arc::new(AtomicU32::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let clock = Arc::clone(&scheduler);
    let polled = PollingEngine::new(
        scheduler.clone(),
        job_reporting_finished_after(u32::MAX, &polls),
        PollingConfig::default()
            .with_retry_count(4)
            .with_idle_interval(Duration::from_secs(1))
            .with_backoff(Backoff::new(2.0, Duration::from_secs(5))),
    )
    .should_repeat(|_| true)
    .on_response(move |_| sink.lock().unwrap().push(clock.elapsed()))
    .start();
    let _seen = capture(&polled);

    while scheduler.run_next() {}

    let seconds: Vec<u64> = observed.lock().unwrap().iter().map(Duration::as_secs).collect();
    assert_eq!(seconds, vec![0, 1, 3, 7, 12]);
}

#[rstest]
fn exhausted_failure_is_mapped_to_timeout(scheduler: Arc<ManualScheduler>) {
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum FetchError {
        NotReady,
        TimedOut,
    }

    let polled = PollingEngine::new(
        scheduler.clone(),
        || Deferred::<Result<String, FetchError>>::failure(FetchError::NotReady),
        PollingConfig::default().with_retry_count(2),
    )
    .should_repeat(|result| matches!(result, Err(FetchError::NotReady)))
    .map_final_error(|error| match error {
        FetchError::NotReady => FetchError::TimedOut,
        other => other,
    })
    .start();
    let seen = capture(&polled);

    while scheduler.run_next() {}

    assert_eq!(*seen.lock().unwrap(), Some(Err(FetchError::TimedOut)));
}

#[rstest]
fn dropping_weak_poll_abandons_schedule(scheduler: Arc<ManualScheduler>) {
    let polls = Arc::new(AtomicU32::new(0));
    let polled = PollingEngine::new(
        scheduler.clone(),
        job_reporting_finished_after(u32::MAX, &polls),
        PollingConfig::default().with_retry_count(5),
    )
    .should_repeat(|_| true)
    .start();
    polled.one_way(SubscribeMode::WEAK);
    assert_eq!(polls.load(Ordering::SeqCst), 1);

    drop(polled);
    while scheduler.run_next() {}

    assert_eq!(polls.load(Ordering::SeqCst), 1);
}
