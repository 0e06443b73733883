//! Worker Pool
//!
//! Bounded queue plus a variable number of background workers. The pool
//! grows lazily in response to backlog (one spawn per enqueue, capped at
//! the configured maximum) and shrinks on its own: a worker that sees no
//! work within the idle timeout retires instead of holding a thread.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Error;
use crate::thread_loop::panic_message;

/// Worker thread id counter (names only)
static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently alive workers.
    pub max_workers: usize,
    /// How long an idle worker waits for work before retiring.
    pub idle_timeout: Duration,
    /// Bounded queue capacity; defaults to `max_workers` when `None`.
    pub queue_capacity: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            idle_timeout: Duration::from_secs(10),
            queue_capacity: None,
        }
    }
}

/// Snapshot of pool state for observability.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolInfo {
    pub enabled: bool,
    pub active_workers: usize,
    /// Items queued or currently being processed.
    pub unfinished: usize,
    pub queued: usize,
}

// ============================================================================
// Bounded queue
// ============================================================================

struct QueueState<T> {
    items: VecDeque<T>,
    /// Queued plus in-flight items; decremented by `task_done`.
    unfinished: usize,
}

/// Bounded FIFO with blocking push/pop and unfinished-work tracking.
struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push, blocking up to `timeout` while full; `Err(item)` if still
    /// full when the timeout elapses.
    fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while state.items.len() >= self.capacity {
                    state = self.not_full.wait(state).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.items.len() >= self.capacity {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(item);
                    }
                    let (guard, _) = self.not_full.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
        state.items.push_back(item);
        state.unfinished += 1;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop, waiting up to `timeout` for an item.
    fn pop(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Mark one popped item as fully processed.
    fn task_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.unfinished = state.unfinished.saturating_sub(1);
    }

    fn unfinished(&self) -> usize {
        self.state.lock().unwrap().unfinished
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

// ============================================================================
// Worker pool
// ============================================================================

struct PoolCtl {
    enabled: bool,
    active: usize,
}

struct PoolInner<T> {
    target: Box<dyn Fn(T) + Send + Sync>,
    max_workers: usize,
    idle_timeout: Duration,
    queue: BoundedQueue<T>,
    // Lock order: ctl before queue.
    ctl: Mutex<PoolCtl>,
    all_done: Condvar,
}

impl<T: Send + 'static> PoolInner<T> {
    /// Worker body: pull and process until the idle timeout expires, the
    /// pool is disabled, or the worker count exceeds remaining work.
    fn worker(inner: Arc<Self>) {
        loop {
            loop {
                if !inner.ctl.lock().unwrap().enabled {
                    break;
                }
                let Some(item) = inner.queue.pop(inner.idle_timeout) else {
                    break;
                };
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (inner.target)(item))) {
                    tracing::error!(
                        "worker target panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
                inner.queue.task_done();
            }
            let mut ctl = inner.ctl.lock().unwrap();
            if !ctl.enabled || ctl.active > inner.queue.unfinished() {
                ctl.active -= 1;
                if ctl.active == 0 {
                    inner.all_done.notify_all();
                }
                return;
            }
            // Work arrived while we were deciding; keep pulling.
        }
    }

    /// Spawn one worker if the pool is enabled and below its cap.
    /// Caller holds the ctl lock.
    fn spawn_worker(inner: &Arc<Self>, ctl: &mut PoolCtl) {
        if !ctl.enabled || ctl.active >= inner.max_workers {
            return;
        }
        ctl.active += 1;
        let worker_inner = Arc::clone(inner);
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst);
        thread::Builder::new()
            .name(format!("taskloom-worker-{id}"))
            .spawn(move || Self::worker(worker_inner))
            .expect("failed to spawn pool worker");
    }
}

/// Processes queued items on lazily spawned background workers.
///
/// Items have no cross-item ordering guarantee; multiple workers may run
/// concurrently. A panicking target invocation is logged and isolated to
/// its item.
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool invoking `target` for each item.
    ///
    /// Fails with [`Error::InvalidWorkerCount`] if `max_workers` is zero.
    pub fn new(
        target: impl Fn(T) + Send + Sync + 'static,
        max_workers: usize,
        idle_timeout: Duration,
    ) -> Result<Self, Error> {
        Self::with_config(
            target,
            PoolConfig {
                max_workers,
                idle_timeout,
                queue_capacity: None,
            },
        )
    }

    pub fn with_config(
        target: impl Fn(T) + Send + Sync + 'static,
        config: PoolConfig,
    ) -> Result<Self, Error> {
        if config.max_workers == 0 {
            return Err(Error::InvalidWorkerCount);
        }
        let capacity = config.queue_capacity.unwrap_or(config.max_workers);
        Ok(Self {
            inner: Arc::new(PoolInner {
                target: Box::new(target),
                max_workers: config.max_workers,
                idle_timeout: config.idle_timeout,
                queue: BoundedQueue::new(capacity),
                ctl: Mutex::new(PoolCtl {
                    enabled: false,
                    active: 0,
                }),
                all_done: Condvar::new(),
            }),
        })
    }

    /// Enqueue an item, blocking up to `timeout` while the queue is
    /// full. Spawns a worker when the backlog exceeds the active count.
    pub fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), Error> {
        if self.inner.queue.push(item, timeout).is_err() {
            return Err(Error::QueueFull { timeout });
        }
        let mut ctl = self.inner.ctl.lock().unwrap();
        if ctl.active < self.inner.queue.unfinished() {
            PoolInner::spawn_worker(&self.inner, &mut ctl);
        }
        Ok(())
    }

    /// Enable the pool and spawn workers for any backlog queued while it
    /// was disabled.
    pub fn start(&self) {
        let mut ctl = self.inner.ctl.lock().unwrap();
        if ctl.enabled {
            return;
        }
        ctl.enabled = true;
        for _ in 0..self.inner.queue.len() {
            PoolInner::spawn_worker(&self.inner, &mut ctl);
        }
    }

    /// Disable intake and wait up to `timeout` for all workers to
    /// retire; returns whether the pool fully drained.
    ///
    /// In-flight items are not interrupted; idle workers retire once
    /// their current pop wait expires.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        self.inner.ctl.lock().unwrap().enabled = false;
        self.join(timeout)
    }

    /// Wait up to `timeout` for the active worker count to reach zero
    /// without disabling intake; returns whether it did.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let mut ctl = self.inner.ctl.lock().unwrap();
        match timeout {
            None => {
                while ctl.active > 0 {
                    ctl = self.inner.all_done.wait(ctl).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while ctl.active > 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .inner
                        .all_done
                        .wait_timeout(ctl, deadline - now)
                        .unwrap();
                    ctl = guard;
                }
                true
            }
        }
    }

    /// Whether the pool accepts work or still has live workers.
    pub fn is_alive(&self) -> bool {
        let ctl = self.inner.ctl.lock().unwrap();
        ctl.enabled || ctl.active > 0
    }

    /// Snapshot of the pool's current state.
    pub fn info(&self) -> PoolInfo {
        let ctl = self.inner.ctl.lock().unwrap();
        PoolInfo {
            enabled: ctl.enabled,
            active_workers: ctl.active,
            unfinished: self.inner.queue.unfinished(),
            queued: self.inner.queue.len(),
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Disable intake; remaining workers drain the backlog and then
        // retire via the idle timeout.
        self.inner.ctl.lock().unwrap().enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_invalid_worker_count() {
        let pool = WorkerPool::<u32>::new(|_| {}, 0, Duration::from_secs(1));
        assert!(matches!(pool, Err(Error::InvalidWorkerCount)));
    }

    #[test]
    fn test_burst_respects_max_workers_and_loses_nothing() {
        let processed = Arc::new(AtomicU32::new(0));
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let pool = {
            let processed = Arc::clone(&processed);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            WorkerPool::new(
                move |_item: u32| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                },
                2,
                Duration::from_millis(100),
            )
            .unwrap()
        };

        pool.start();
        for i in 0..10 {
            pool.put(i, Some(Duration::from_secs(5))).unwrap();
        }

        assert!(pool.join(Some(Duration::from_secs(5))));
        assert_eq!(processed.load(Ordering::SeqCst), 10);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_put_timeout_on_full_queue() {
        // Disabled pool: nothing consumes, so the bounded queue fills.
        let pool = WorkerPool::new(|_: u32| {}, 1, Duration::from_millis(50)).unwrap();

        pool.put(1, None).unwrap();
        let err = pool.put(2, Some(Duration::from_millis(50)));
        assert!(matches!(err, Err(Error::QueueFull { .. })));
        assert_eq!(pool.info().queued, 1);
    }

    #[test]
    fn test_start_drains_backlog() {
        let processed = Arc::new(AtomicU32::new(0));
        let pool = {
            let processed = Arc::clone(&processed);
            WorkerPool::with_config(
                move |_: u32| {
                    processed.fetch_add(1, Ordering::SeqCst);
                },
                PoolConfig {
                    max_workers: 2,
                    idle_timeout: Duration::from_millis(50),
                    queue_capacity: Some(3),
                },
            )
            .unwrap()
        };

        for i in 0..3 {
            pool.put(i, None).unwrap();
        }
        assert_eq!(pool.info().active_workers, 0);

        pool.start();
        assert!(pool.join(Some(Duration::from_secs(2))));
        assert_eq!(processed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_idle_workers_retire() {
        let pool = WorkerPool::new(|_: u32| {}, 2, Duration::from_millis(30)).unwrap();
        pool.start();
        pool.put(1, None).unwrap();

        thread::sleep(Duration::from_millis(200));
        let info = pool.info();
        assert!(info.enabled);
        assert_eq!(info.active_workers, 0);
        assert_eq!(info.unfinished, 0);
        // Still alive: intake is enabled even with no workers.
        assert!(pool.is_alive());
    }

    #[test]
    fn test_stop_drains_and_reports() {
        let pool = WorkerPool::new(
            |_: u32| thread::sleep(Duration::from_millis(10)),
            2,
            Duration::from_millis(30),
        )
        .unwrap();
        pool.start();
        pool.put(1, None).unwrap();
        pool.put(2, None).unwrap();

        assert!(pool.stop(Some(Duration::from_secs(2))));
        assert!(!pool.is_alive());
        assert_eq!(pool.info().unfinished, 0);
    }

    #[test]
    fn test_panicking_target_is_isolated() {
        let processed = Arc::new(AtomicU32::new(0));
        let pool = {
            let processed = Arc::clone(&processed);
            WorkerPool::new(
                move |item: u32| {
                    if item == 1 {
                        panic!("bad item");
                    }
                    processed.fetch_add(1, Ordering::SeqCst);
                },
                1,
                Duration::from_millis(50),
            )
            .unwrap()
        };

        pool.start();
        for i in 0..3 {
            pool.put(i, Some(Duration::from_secs(2))).unwrap();
        }

        assert!(pool.stop(Some(Duration::from_secs(2))));
        assert_eq!(processed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.info().unfinished, 0);
    }
}
