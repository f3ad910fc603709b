//! Fan-in progress reporting for parallel tasks.
//!
//! When some operation is split into tasks running on several threads, each of them reports its
//! own progress, and each of them may fail. Whoever displays progress (a progress bar, a log, a
//! UI) wants to see *one* operation instead: a single progress value, a single failure, and a
//! single completion notification.
//!
//! This library provides that through two types: [`Aggregator`] and [`TaskHandle`].
//!
//! # Overview
//!
//! An [`Aggregator`] is created with an [`Observer`], the downstream sink that is told about the
//! combined progress. Every task gets its own [`TaskHandle`] from the [`Aggregator`], and reports
//! its progress, messages, completion or failure through it. The [`Aggregator`] makes sure that:
//!
//! - the [`Observer`] is never called from two threads at once (it doesn't need to be
//!   thread-safe);
//! - the combined progress is the mean of the latest progress of every task;
//! - the first failure is delivered to the [`Observer`] exactly once, and all later failures are
//!   only logged;
//! - completion is delivered exactly once, when every task has finished and none has failed;
//! - after a failure, every other task is told to stop the next time it reports progress or
//!   checks for cancellation ([`Cancelled`]).
//!
//! Running the tasks is up to the caller. The [`Aggregator`] does not spawn threads; it only
//! collects outcomes. [`Aggregator::join`] blocks until every task has finished.
//!
//! # Usage
//!
//! Four tasks on scoped threads, reporting to a channel:
//!
//! ```
//! use fanin::{observer::{self, Event}, Aggregator};
//!
//! let (observer, events) = observer::channel();
//! let aggregator = Aggregator::with_task_count(observer, 4);
//!
//! std::thread::scope(|s| {
//!     for _ in 0..4 {
//!         let task = aggregator.task_handle().unwrap();
//!         s.spawn(move || {
//!             for step in 1..=10 {
//!                 // <do some work>
//!                 if let Err(cancelled) = task.report_progress(step as f32 / 10.0) {
//!                     // Another task failed; stop working.
//!                     return task.report_failure(cancelled);
//!                 }
//!             }
//!             task.report_done();
//!         });
//!     }
//! });
//!
//! aggregator.join();
//! assert!(events.try_iter().any(|event| matches!(event, Event::Done)));
//! ```
//!
//! The first failure cancels the remaining tasks:
//!
//! ```
//! use fanin::{observer, Aggregator, Failure};
//!
//! let (observer, _events) = observer::channel();
//! let aggregator = Aggregator::with_task_count(observer, 2);
//! let a = aggregator.task_handle().unwrap();
//! let b = aggregator.task_handle().unwrap();
//!
//! a.report_failure(Failure::msg("out of disk space"));
//!
//! let cancelled = b.report_progress(0.3).unwrap_err();
//! assert_eq!(cancelled.failure().unwrap().to_string(), "out of disk space");
//! b.report_failure(cancelled); // logged, but not reported to the observer again
//!
//! aggregator.join();
//! assert!(aggregator.has_failed());
//! ```

mod aggregator;
mod error;
pub mod observer;
mod sync;

pub use aggregator::{Aggregator, AggregatorBuilder, TaskHandle};
pub use error::{Cancelled, Failure, IllegalUse, TaskError, Unsupported};
pub use observer::Observer;
