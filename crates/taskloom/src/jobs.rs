//! Callback Jobs
//!
//! Thin convenience layer over [`Scheduler`] for zero-argument repeating
//! callbacks: keys are synthesized, and the repeat interval comes either
//! from a fixed duration or from the callback's own return value.
//! Embedders normally own a [`CallbackScheduler`] themselves; [`shared`]
//! offers a lazily-initialized process-wide instance for code with no
//! natural owner.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::scheduler::{JobOutcome, Scheduler};

/// Job key synthesized from the monotonic clock.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u32);

impl JobId {
    fn next() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        JobId((epoch.elapsed().as_millis() & 0xFFFF_FFFF) as u32)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({:08X})", self.0)
    }
}

/// Repeat policy for a callback job.
#[derive(Clone)]
pub enum Repeat {
    /// Fire at a fixed interval, ignoring the callback's return value.
    Every(Duration),
    /// Use the callback's returned delay; `None` cancels the job.
    FromReturn,
}

type Callback = Arc<dyn Fn() -> Option<Duration> + Send + Sync>;

#[derive(Clone)]
struct CallbackJob {
    callback: Callback,
    repeat: Repeat,
}

/// Schedules zero-argument callbacks on an owned [`Scheduler`].
pub struct CallbackScheduler {
    sched: Scheduler<JobId, CallbackJob>,
}

impl CallbackScheduler {
    pub fn new() -> Self {
        Self {
            sched: Scheduler::new(Self::fire),
        }
    }

    fn fire(_key: &JobId, job: &CallbackJob) -> JobOutcome {
        let returned = (job.callback)();
        let next = match job.repeat {
            Repeat::Every(interval) => Some(interval),
            Repeat::FromReturn => returned,
        };
        match next {
            Some(dt) if !dt.is_zero() => JobOutcome::After(dt),
            _ => JobOutcome::Done,
        }
    }

    /// Register a callback with an explicit repeat policy and initial
    /// delay; returns the synthesized key.
    pub fn add(
        &self,
        callback: impl Fn() -> Option<Duration> + Send + Sync + 'static,
        repeat: Repeat,
        initial_delay: Duration,
    ) -> JobId {
        let job = CallbackJob {
            callback: Arc::new(callback),
            repeat,
        };
        let mut id = JobId::next();
        loop {
            match self.sched.add_job(id, job.clone(), initial_delay) {
                Ok(()) => return id,
                // Clock-derived ids can collide within a millisecond;
                // probe forward until one is free.
                Err(_) => id = JobId(id.0.wrapping_add(1)),
            }
        }
    }

    /// Fire `callback` every `interval`, starting one interval from now.
    pub fn every(
        &self,
        interval: Duration,
        callback: impl Fn() -> Option<Duration> + Send + Sync + 'static,
    ) -> JobId {
        self.add(callback, Repeat::Every(interval), interval)
    }

    /// Fire `callback` after `initial_delay`, then keep firing after
    /// whatever delay it returns; `None` cancels the job.
    pub fn from_return(
        &self,
        initial_delay: Duration,
        callback: impl Fn() -> Option<Duration> + Send + Sync + 'static,
    ) -> JobId {
        self.add(callback, Repeat::FromReturn, initial_delay)
    }

    pub fn remove(&self, id: JobId) -> Result<(), Error> {
        self.sched.remove_job(&id)
    }

    pub fn clear(&self) {
        self.sched.clear_jobs();
    }

    pub fn len(&self) -> usize {
        self.sched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sched.is_empty()
    }

    pub fn is_alive(&self) -> bool {
        self.sched.is_alive()
    }
}

impl Default for CallbackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: OnceLock<CallbackScheduler> = OnceLock::new();

/// Process-wide callback scheduler, initialized on first use.
///
/// Prefer owning a [`CallbackScheduler`] and passing it around; this
/// accessor exists for callers with no natural place to keep one.
pub fn shared() -> &'static CallbackScheduler {
    SHARED.get_or_init(|| {
        tracing::info!("shared callback scheduler initialized");
        CallbackScheduler::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_every_fires_repeatedly() {
        let count = Arc::new(AtomicU32::new(0));
        let sched = CallbackScheduler::new();

        let id = {
            let count = Arc::clone(&count);
            sched.every(Duration::from_millis(30), move || {
                count.fetch_add(1, Ordering::SeqCst);
                None // ignored by Repeat::Every
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) >= 3);

        sched.remove(id).unwrap();
        thread::sleep(Duration::from_millis(50));
        let stable = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), stable);
    }

    #[test]
    fn test_from_return_cancels_on_none() {
        let count = Arc::new(AtomicU32::new(0));
        let sched = CallbackScheduler::new();

        {
            let count = Arc::clone(&count);
            sched.from_return(Duration::from_millis(10), move || {
                if count.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    None
                } else {
                    Some(Duration::from_millis(10))
                }
            });
        }

        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_synthesized_ids_are_unique() {
        let sched = CallbackScheduler::new();
        let a = sched.add(|| None, Repeat::FromReturn, Duration::from_secs(60));
        let b = sched.add(|| None, Repeat::FromReturn, Duration::from_secs(60));
        let c = sched.add(|| None, Repeat::FromReturn, Duration::from_secs(60));

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(sched.len(), 3);
        sched.clear();
    }

    #[test]
    fn test_shared_is_a_singleton() {
        let a = shared() as *const CallbackScheduler;
        let b = shared() as *const CallbackScheduler;
        assert_eq!(a, b);
    }

    #[test]
    fn test_job_id_formats_as_hex() {
        let id = JobId(0x1A2B);
        assert_eq!(id.to_string(), "00001A2B");
        assert_eq!(format!("{id:?}"), "JobId(00001A2B)");
    }
}
