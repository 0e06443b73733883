//! taskloom
//!
//! A small, self-contained concurrency toolkit for running background
//! work without a managed runtime. Coordination is done with OS threads,
//! mutexes and condition variables; there is no event loop and no async.
//!
//! # Components
//!
//! - [`Rendezvous`]: hand a value from one thread to another, gated on a
//!   successful comparison against an armed value.
//! - [`ThreadLoop`]: run a predicate repeatedly on a dedicated background
//!   thread until it signals completion or an external stop is requested.
//! - [`WorkerPool`]: bounded queue plus lazily grown worker threads that
//!   retire when idle.
//! - [`Scheduler`]: repeating job scheduler driven by a min-heap of
//!   deadlines, built on top of [`ThreadLoop`].
//! - [`CallbackScheduler`]: thin convenience layer for zero-argument
//!   repeating callbacks, with an optional process-wide instance
//!   ([`shared`]).
//!
//! # Example
//! ```rust,ignore
//! use std::time::Duration;
//! use taskloom::{JobOutcome, Scheduler};
//!
//! let sched = Scheduler::new(|key: &&str, opt: &u32| {
//!     println!("fired {key} with {opt}");
//!     JobOutcome::After(Duration::from_secs(10))
//! });
//! sched.add_job("poll", 1, Duration::from_secs(10))?;
//! ```

mod error;
mod jobs;
mod rendezvous;
mod scheduler;
mod thread_loop;
mod worker_pool;

pub use error::Error;
pub use jobs::{shared, CallbackScheduler, JobId, Repeat};
pub use rendezvous::Rendezvous;
pub use scheduler::{JobOutcome, Scheduler, SchedulerConfig, SchedulerStats};
pub use thread_loop::{LoopStep, ThreadLoop};
pub use worker_pool::{PoolConfig, PoolInfo, WorkerPool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
