//! Loop Controller
//!
//! Runs a predicate repeatedly on a dedicated background thread until
//! the predicate signals completion or an external stop is requested.
//! `start`/`stop` are safe to call concurrently from any thread; a
//! restart flag resolves the start-during-shutdown race so that a
//! `start` issued while the handler is winding down is never lost.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Error;

/// Outcome of one predicate invocation.
pub enum LoopStep {
    /// Keep iterating.
    Continue,
    /// The loop's work is complete; stop unless a restart is pending.
    Stop,
    /// This invocation failed. Logged; the predicate is retried on the
    /// next iteration.
    Failed(anyhow::Error),
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Latch opened exactly once when a handler thread has fully exited.
///
/// Stands in for joining with a timeout, which `JoinHandle` cannot do.
struct ExitLatch {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl ExitLatch {
    fn new(finished: bool) -> Self {
        Self {
            finished: Mutex::new(finished),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.finished.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap()
    }

    /// Wait for the latch to open; returns whether it is open.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut finished = self.finished.lock().unwrap();
        match timeout {
            None => {
                while !*finished {
                    finished = self.cond.wait(finished).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*finished {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(finished, deadline - now).unwrap();
                    finished = guard;
                }
                true
            }
        }
    }
}

struct Ctl {
    /// Restart requested: a `start` arrived and has not been consumed
    /// by the handler yet.
    restart: bool,
    should_run: bool,
    /// Handler reached its terminal state. The thread may still be
    /// unwinding, so a respawn joins it first.
    stopped: bool,
    latch: Arc<ExitLatch>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    target: Mutex<Box<dyn FnMut() -> LoopStep + Send>>,
    ctl: Mutex<Ctl>,
}

impl Inner {
    /// Handler body; runs on the background thread (or the caller's
    /// thread for [`ThreadLoop::run`]).
    fn handle(&self) {
        tracing::debug!("thread loop {} handler started", self.name);
        loop {
            loop {
                {
                    let ctl = self.ctl.lock().unwrap();
                    if !ctl.should_run || ctl.restart {
                        break;
                    }
                }
                let mut target = self.target.lock().unwrap();
                let step = match catch_unwind(AssertUnwindSafe(|| (*target)())) {
                    Ok(step) => step,
                    Err(payload) => {
                        tracing::error!(
                            "thread loop {} target panicked: {}",
                            self.name,
                            panic_message(payload.as_ref())
                        );
                        LoopStep::Continue
                    }
                };
                drop(target);
                match step {
                    LoopStep::Continue => {}
                    LoopStep::Stop => break,
                    LoopStep::Failed(err) => {
                        tracing::error!("thread loop {} target failed: {err:#}", self.name);
                    }
                }
            }
            let mut ctl = self.ctl.lock().unwrap();
            if ctl.restart {
                ctl.restart = false;
                ctl.should_run = true;
            } else {
                tracing::debug!("thread loop {} handler stopping", self.name);
                ctl.should_run = false;
                ctl.stopped = true;
                return;
            }
        }
    }
}

/// Controls a predicate loop in a dedicated background thread.
///
/// The predicate is invoked until it returns [`LoopStep::Stop`] or
/// [`ThreadLoop::stop`] is called. `start` is idempotent and may be
/// called again after the loop has fully exited; the thread is then
/// respawned.
pub struct ThreadLoop {
    inner: Arc<Inner>,
}

impl ThreadLoop {
    /// Create a controller for `target` with the default thread name.
    pub fn new(target: impl FnMut() -> LoopStep + Send + 'static) -> Self {
        Self::named("taskloom-loop", target)
    }

    /// Create a controller whose background thread carries `name`.
    pub fn named(name: &str, target: impl FnMut() -> LoopStep + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                target: Mutex::new(Box::new(target)),
                ctl: Mutex::new(Ctl {
                    restart: false,
                    should_run: false,
                    stopped: false,
                    // No thread exists yet, so "exited" is the truth.
                    latch: Arc::new(ExitLatch::new(true)),
                    handle: None,
                }),
            }),
        }
    }

    /// Start (or re-arm) the loop.
    ///
    /// If the handler thread is alive this only sets the restart flag,
    /// which keeps a concurrently stopping handler running. If the
    /// handler has fully exited, the old thread is joined and a new one
    /// is spawned.
    pub fn start(&self) {
        let mut ctl = self.inner.ctl.lock().unwrap();
        ctl.restart = true;
        if ctl.stopped {
            // Terminal state reached: the thread takes no more locks,
            // joining under ours cannot deadlock.
            if let Some(handle) = ctl.handle.take() {
                let _ = handle.join();
            }
        } else if !ctl.latch.is_finished() {
            return;
        }
        ctl.stopped = false;
        let latch = Arc::new(ExitLatch::new(false));
        ctl.latch = Arc::clone(&latch);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || {
                inner.handle();
                latch.open();
            })
            .expect("failed to spawn thread loop handler");
        ctl.handle = Some(handle);
    }

    /// Stop the loop and wait up to `timeout` for the handler thread to
    /// exit; returns whether it has fully exited.
    ///
    /// An in-flight predicate invocation is not interrupted.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        let latch = {
            let mut ctl = self.inner.ctl.lock().unwrap();
            ctl.restart = false;
            ctl.should_run = false;
            Arc::clone(&ctl.latch)
        };
        latch.wait(timeout)
    }

    /// Run the loop on the calling thread instead of spawning one.
    ///
    /// Blocks until the predicate completes or another thread calls
    /// [`ThreadLoop::stop`]. Fails if the loop is already active.
    pub fn run(&self) -> Result<(), Error> {
        let latch = {
            let mut ctl = self.inner.ctl.lock().unwrap();
            if !ctl.latch.is_finished() {
                return Err(Error::LoopActive);
            }
            ctl.restart = true;
            ctl.stopped = false;
            let latch = Arc::new(ExitLatch::new(false));
            ctl.latch = Arc::clone(&latch);
            latch
        };
        self.inner.handle();
        latch.open();
        Ok(())
    }

    /// Wait up to `timeout` for the handler thread to exit without
    /// requesting a stop; returns whether it has exited.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let latch = Arc::clone(&self.inner.ctl.lock().unwrap().latch);
        latch.wait(timeout)
    }

    /// Whether the handler thread is currently alive.
    pub fn is_alive(&self) -> bool {
        !self.inner.ctl.lock().unwrap().latch.is_finished()
    }
}

impl Drop for ThreadLoop {
    fn drop(&mut self) {
        // Request a stop without waiting; the detached handler exits
        // after its current iteration.
        let mut ctl = self.inner.ctl.lock().unwrap();
        ctl.restart = false;
        ctl.should_run = false;
    }
}
