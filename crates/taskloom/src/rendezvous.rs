//! Cross-Thread Rendezvous
//!
//! Pairs one waiting thread with one matching producer call. The waiter
//! arms the primitive with a value to compare against and an answer to
//! hand back; a producer offers a candidate and, on a match, delivers a
//! result and synchronously receives the armed answer. At most one
//! producer can succeed per arming.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

type Predicate<V> = Box<dyn Fn(&V, &V) -> bool + Send + Sync>;

struct State<V, A, R> {
    waiting: bool,
    compare: Option<V>,
    answer: Option<A>,
    result: Option<R>,
}

/// One-shot compared-value handoff between two threads.
///
/// ```rust,ignore
/// let rv: Rendezvous<u32, &str, String> = Rendezvous::new();
/// rv.init(42, "accepted");
/// // on the producer thread:
/// if rv.compare(&42, payload).is_some() { /* consumer took it */ }
/// ```
pub struct Rendezvous<V, A = bool, R = ()> {
    predicate: Predicate<V>,
    state: Mutex<State<V, A, R>>,
    cond: Condvar,
}

impl<V: PartialEq, A, R> Rendezvous<V, A, R> {
    /// Create a rendezvous using structural equality for matching.
    pub fn new() -> Self {
        Self::with_predicate(|armed: &V, candidate: &V| armed == candidate)
    }
}

impl<V: PartialEq, A, R> Default for Rendezvous<V, A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, A, R> Rendezvous<V, A, R> {
    /// Create a rendezvous with a custom match predicate
    /// `predicate(armed_value, candidate_value)`.
    pub fn with_predicate(predicate: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            state: Mutex::new(State {
                waiting: false,
                compare: None,
                answer: None,
                result: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Arm the rendezvous: clear any previous result, store the value to
    /// compare against and the answer to hand back on a match.
    ///
    /// Re-arming while a wait is outstanding overwrites the previous
    /// arming; multiple waiters are not queued.
    pub fn init(&self, value: V, answer: A) {
        let mut state = self.state.lock().unwrap();
        state.result = None;
        state.compare = Some(value);
        state.answer = Some(answer);
        state.waiting = true;
    }

    /// Block until a producer matches or `timeout` elapses; returns
    /// whether a match occurred. Returns `true` immediately if the
    /// rendezvous is not currently waiting.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while state.waiting {
                    state = self.cond.wait(state).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.waiting {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
                true
            }
        }
    }

    /// Offer `candidate` from a producer thread.
    ///
    /// If the rendezvous is waiting and the predicate matches the armed
    /// value, stores `result`, wakes all waiters and returns the armed
    /// answer. Otherwise returns `None` and `result` is dropped. Only
    /// the first matching call per [`Rendezvous::init`] succeeds.
    pub fn compare(&self, candidate: &V, result: R) -> Option<A> {
        let mut state = self.state.lock().unwrap();
        if !state.waiting {
            return None;
        }
        let matched = state
            .compare
            .as_ref()
            .is_some_and(|armed| (self.predicate)(armed, candidate));
        if !matched {
            return None;
        }
        state.result = Some(result);
        state.waiting = false;
        self.cond.notify_all();
        state.answer.take()
    }

    /// Take the result delivered by a successful [`Rendezvous::compare`].
    pub fn take_result(&self) -> Option<R> {
        self.state.lock().unwrap().result.take()
    }

    /// Whether a wait is currently outstanding.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().unwrap().waiting
    }
}
