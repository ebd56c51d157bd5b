//! Deterministic virtual-time scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Scheduler, Work};

/// A scheduler whose clock only moves when told to.
///
/// Jobs submitted with `run_async` are due "now"; jobs submitted with
/// `run_after` are due `delay` after the current virtual time. Nothing runs until
/// [`advance`](Self::advance), [`run_pending`](Self::run_pending) or
/// [`run_next`](Self::run_next) is called, and jobs always run on the calling
/// thread, in due-time order (submission order among equal due times).
///
/// `run_now` runs the job inline immediately.
///
/// # Examples
///
/// ```rust
/// use deferral::scheduler::{ManualScheduler, Scheduler};
/// use std::time::Duration;
///
/// let scheduler = ManualScheduler::new();
/// let start = scheduler.now();
///
/// scheduler.run_after(Duration::from_millis(250), Box::new(|| {}));
/// assert_eq!(scheduler.pending_jobs(), 1);
///
/// assert!(scheduler.run_next());
/// assert_eq!(scheduler.now() - start, Duration::from_millis(250));
/// assert_eq!(scheduler.pending_jobs(), 0);
/// ```
pub struct ManualScheduler {
    origin: Instant,
    queue: Mutex<Queue>,
}

struct Queue {
    elapsed: Duration,
    sequence: u64,
    jobs: BTreeMap<(Duration, u64), Work>,
}

impl Queue {
    fn push(&mut self, due: Duration, work: Work) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.jobs.insert((due, sequence), work);
    }

    fn pop_due(&mut self, limit: Duration) -> Option<Work> {
        let (&(due, _), _) = self.jobs.first_key_value()?;
        if due > limit {
            return None;
        }
        let ((due, _), work) = self.jobs.pop_first()?;
        self.elapsed = self.elapsed.max(due);
        Some(work)
    }
}

impl ManualScheduler {
    /// Creates a scheduler whose virtual clock starts at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            queue: Mutex::new(Queue {
                elapsed: Duration::ZERO,
                sequence: 0,
                jobs: BTreeMap::new(),
            }),
        }
    }

    /// Virtual time elapsed since the scheduler was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.queue.lock().elapsed
    }

    /// Number of queued jobs, due or not.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.queue.lock().jobs.len()
    }

    /// Runs every job that is due at the current virtual time, including jobs
    /// those jobs submit, without moving the clock. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = {
                let mut queue = self.queue.lock();
                let now = queue.elapsed;
                queue.pop_due(now)
            };
            match job {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Moves the clock forward by `by`, running every job that becomes due on the
    /// way in due-time order. Returns how many jobs ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.queue.lock().elapsed + by;
        let mut ran = 0;
        loop {
            let job = self.queue.lock().pop_due(target);
            match job {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => break,
            }
        }
        let mut queue = self.queue.lock();
        queue.elapsed = queue.elapsed.max(target);
        ran
    }

    /// Jumps the clock to the earliest queued job and runs it.
    ///
    /// Returns `false` when the queue is empty.
    pub fn run_next(&self) -> bool {
        let job = self.queue.lock().pop_due(Duration::MAX);
        job.map_or(false, |work| {
            work();
            true
        })
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn run_now(&self, work: Work) {
        work();
    }

    fn run_async(&self, work: Work) {
        let mut queue = self.queue.lock();
        let due = queue.elapsed;
        queue.push(due, work);
    }

    fn run_after(&self, delay: Duration, work: Work) {
        let mut queue = self.queue.lock();
        let due = queue.elapsed + delay;
        queue.push(due, work);
    }

    fn now(&self) -> Instant {
        self.origin + self.queue.lock().elapsed
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        formatter
            .debug_struct("ManualScheduler")
            .field("elapsed", &queue.elapsed)
            .field("pending_jobs", &queue.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Work) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> Work {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(label))
        };
        (log, make)
    }

    #[rstest]
    fn test_run_now_is_inline() {
        let scheduler = ManualScheduler::new();
        let (log, make) = recorder();

        scheduler.run_now(make("now"));

        assert_eq!(*log.lock(), vec!["now"]);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[rstest]
    fn test_run_async_waits_for_run_pending() {
        let scheduler = ManualScheduler::new();
        let (log, make) = recorder();

        scheduler.run_async(make("first"));
        scheduler.run_async(make("second"));
        assert!(log.lock().is_empty());

        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[rstest]
    fn test_advance_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let (log, make) = recorder();

        scheduler.run_after(Duration::from_secs(3), make("late"));
        scheduler.run_after(Duration::from_secs(1), make("early"));
        scheduler.run_after(Duration::from_secs(5), make("never"));

        assert_eq!(scheduler.advance(Duration::from_secs(4)), 2);
        assert_eq!(*log.lock(), vec!["early", "late"]);
        assert_eq!(scheduler.elapsed(), Duration::from_secs(4));
        assert_eq!(scheduler.pending_jobs(), 1);
    }

    #[rstest]
    fn test_clock_reports_virtual_time() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();

        scheduler.advance(Duration::from_millis(1500));

        assert_eq!(scheduler.now() - start, Duration::from_millis(1500));
    }

    #[rstest]
    fn test_jobs_scheduled_by_jobs_run_within_the_same_advance() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (log, make) = recorder();
        let inner = Arc::clone(&scheduler);
        let follow_up = make("follow-up");

        scheduler.run_after(
            Duration::from_secs(1),
            Box::new(move || inner.run_after(Duration::from_secs(1), follow_up)),
        );

        scheduler.advance(Duration::from_secs(2));
        assert_eq!(*log.lock(), vec!["follow-up"]);
    }

    #[rstest]
    fn test_run_next_on_empty_queue() {
        let scheduler = ManualScheduler::new();
        assert!(!scheduler.run_next());
    }
}
