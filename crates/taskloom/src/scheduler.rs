//! Repeating Job Scheduler
//!
//! Associates keys with an opaque option value and a next-fire deadline.
//! A single background loop (a [`ThreadLoop`]) always waits for the
//! earliest deadline in a min-heap, invokes the callback outside the
//! lock, and reschedules from the callback's returned delay. The loop
//! thread is started when jobs are added and stops itself once the job
//! table empties.
//!
//! The heap holds only `(deadline, key)` candidates and may contain
//! stale entries; the job table is authoritative and is re-checked under
//! lock before every firing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Error;
use crate::thread_loop::{panic_message, LoopStep, ThreadLoop};

/// Scheduler tunables. These shape observability and defensive
/// re-polling, not correctness.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on a single deadline wait; when it elapses the loop
    /// re-validates its state and waits again.
    pub max_wait: Duration,
    /// Firing lateness past which a diagnostic warning is emitted.
    pub late_warn: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            late_warn: Duration::from_secs(1),
        }
    }
}

/// Outcome of one job firing.
pub enum JobOutcome {
    /// Fire again after the given delay; a zero delay removes the job.
    After(Duration),
    /// Job complete; remove it.
    Done,
    /// This firing failed. Logged; the job is removed.
    Failed(anyhow::Error),
}

/// Snapshot of scheduler state for observability.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStats {
    pub jobs: usize,
    /// Heap entries, including stale candidates for removed jobs.
    pub heap_entries: usize,
    pub loop_alive: bool,
}

/// Heap entry: a candidate next wakeup, ordered by fire time only.
/// Keys are deliberately excluded from the ordering.
struct FireAt<K> {
    at: Instant,
    key: K,
}

impl<K> PartialEq for FireAt<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<K> Eq for FireAt<K> {}

impl<K> PartialOrd for FireAt<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for FireAt<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

struct JobTable<K, O> {
    jobs: HashMap<K, O>,
    heap: BinaryHeap<Reverse<FireAt<K>>>,
}

struct SchedInner<K, O> {
    target: Box<dyn Fn(&K, &O) -> JobOutcome + Send + Sync>,
    config: SchedulerConfig,
    table: Mutex<JobTable<K, O>>,
    /// Notified on every job-table mutation so the loop can recompute
    /// its earliest deadline.
    job_update: Condvar,
}

impl<K, O> SchedInner<K, O>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// One scheduling-loop iteration.
    fn run_once(&self) -> LoopStep {
        let (key, opt, deadline) = {
            let mut table = self.table.lock().unwrap();
            if table.jobs.is_empty() || table.heap.is_empty() {
                if table.jobs.is_empty() {
                    tracing::debug!("scheduler loop stopping, no jobs left");
                } else {
                    tracing::warn!(
                        "scheduler loop stopping with {} jobs but empty heap",
                        table.jobs.len()
                    );
                }
                table.jobs.clear();
                table.heap.clear();
                return LoopStep::Stop;
            }
            let Some(Reverse(entry)) = table.heap.pop() else {
                return LoopStep::Continue;
            };
            let now = Instant::now();
            if entry.at > now {
                let remaining = entry.at - now;
                let capped = remaining.min(self.config.max_wait);
                let (guard, result) = self.job_update.wait_timeout(table, capped).unwrap();
                table = guard;
                if !result.timed_out() || remaining > self.config.max_wait {
                    // Woken by a table change, or the wait cap was hit:
                    // push the candidate back and recompute.
                    if table.jobs.contains_key(&entry.key) {
                        table.heap.push(Reverse(entry));
                    }
                    return LoopStep::Continue;
                }
            }
            // Deadline reached. The entry may be stale: the job could
            // have been removed since it was pushed.
            let Some(opt) = table.jobs.get(&entry.key).cloned() else {
                return LoopStep::Continue;
            };
            (entry.key, opt, entry.at)
        };

        // Invoke outside the lock so the callback may re-enter the
        // scheduler (add_job/remove_job) without deadlocking.
        let outcome = match catch_unwind(AssertUnwindSafe(|| (self.target)(&key, &opt))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                tracing::error!(
                    "job target panicked, key {:?}: {}",
                    key,
                    panic_message(payload.as_ref())
                );
                JobOutcome::Done
            }
        };
        let next_delay = match outcome {
            JobOutcome::After(dt) if !dt.is_zero() => Some(dt),
            JobOutcome::After(_) | JobOutcome::Done => None,
            JobOutcome::Failed(err) => {
                tracing::error!("job target failed, key {:?}: {err:#}", key);
                None
            }
        };

        let now = Instant::now();
        {
            let mut table = self.table.lock().unwrap();
            match next_delay {
                None => {
                    tracing::debug!("removing job {:?}", key);
                    table.jobs.remove(&key);
                    return LoopStep::Continue;
                }
                Some(dt) => {
                    table.heap.push(Reverse(FireAt {
                        at: now + dt,
                        key: key.clone(),
                    }));
                }
            }
        }
        let late = now.saturating_duration_since(deadline);
        if late >= self.config.late_warn {
            tracing::warn!("scheduler loop {late:.1?} behind schedule, job: {key:?}");
        }
        LoopStep::Continue
    }
}

/// Calls `target(key, option)` after per-job delays.
///
/// Firings are strictly ordered by deadline and never self-concurrent:
/// one loop thread serves the whole scheduler instance.
pub struct Scheduler<K, O> {
    inner: Arc<SchedInner<K, O>>,
    loop_ctl: ThreadLoop,
}

impl<K, O> Scheduler<K, O>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Create a scheduler with default tunables.
    pub fn new(target: impl Fn(&K, &O) -> JobOutcome + Send + Sync + 'static) -> Self {
        Self::with_config(target, SchedulerConfig::default())
    }

    pub fn with_config(
        target: impl Fn(&K, &O) -> JobOutcome + Send + Sync + 'static,
        config: SchedulerConfig,
    ) -> Self {
        let inner = Arc::new(SchedInner {
            target: Box::new(target),
            config,
            table: Mutex::new(JobTable {
                jobs: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            job_update: Condvar::new(),
        });
        let loop_inner = Arc::clone(&inner);
        let loop_ctl = ThreadLoop::named("taskloom-sched", move || loop_inner.run_once());
        Self { inner, loop_ctl }
    }

    /// Schedule `key` to fire after `delay`, carrying `option`.
    ///
    /// Fails with [`Error::KeyExists`] if the key is already scheduled;
    /// the job table is left unchanged. Starts the loop thread if it is
    /// not running.
    pub fn add_job(&self, key: K, option: O, delay: Duration) -> Result<(), Error> {
        {
            let mut table = self.inner.table.lock().unwrap();
            if table.jobs.contains_key(&key) {
                return Err(Error::KeyExists {
                    key: format!("{key:?}"),
                });
            }
            table.jobs.insert(key.clone(), option);
            table.heap.push(Reverse(FireAt {
                at: Instant::now() + delay,
                key,
            }));
            // The new deadline may be sooner than whatever the loop is
            // currently waiting on.
            self.inner.job_update.notify_one();
        }
        self.loop_ctl.start();
        Ok(())
    }

    /// Remove a scheduled job. Heap entries left behind are skipped as
    /// stale when they surface.
    pub fn remove_job(&self, key: &K) -> Result<(), Error> {
        let mut table = self.inner.table.lock().unwrap();
        if table.jobs.remove(key).is_none() {
            return Err(Error::UnknownJob {
                key: format!("{key:?}"),
            });
        }
        self.inner.job_update.notify_one();
        Ok(())
    }

    /// Remove all jobs; the loop observes the empty table and stops its
    /// thread.
    pub fn clear_jobs(&self) {
        let mut table = self.inner.table.lock().unwrap();
        table.jobs.clear();
        self.inner.job_update.notify_one();
    }

    /// Keys of all currently scheduled jobs.
    pub fn jobs(&self) -> Vec<K> {
        self.inner.table.lock().unwrap().jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the scheduling loop thread is currently alive.
    pub fn is_alive(&self) -> bool {
        self.loop_ctl.is_alive()
    }

    /// Stop the scheduling loop without clearing jobs; it restarts on
    /// the next `add_job`. Returns whether the thread exited in time.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        self.loop_ctl.stop(timeout)
    }

    /// Snapshot of scheduler state.
    pub fn stats(&self) -> SchedulerStats {
        let table = self.inner.table.lock().unwrap();
        SchedulerStats {
            jobs: table.jobs.len(),
            heap_entries: table.heap.len(),
            loop_alive: self.loop_ctl.is_alive(),
        }
    }
}

impl<K, O> Drop for Scheduler<K, O> {
    fn drop(&mut self) {
        // Empty the table and wake the loop so the detached thread
        // stops instead of firing jobs for a dropped scheduler.
        let mut table = self.inner.table.lock().unwrap();
        table.jobs.clear();
        self.inner.job_update.notify_one();
    }
}
