//! Combining the progress of parallel tasks.
//!
//! An [`Aggregator`] hands out one [`TaskHandle`] per task. Tasks run wherever the caller puts
//! them (usually on their own threads) and report through their handle; the aggregator combines
//! everything into calls on a single [`Observer`].

use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::Duration,
};

use crate::{
    error::TaskError,
    observer::SubProgress,
    sync::{Condvar, Mutex},
    Cancelled, Failure, IllegalUse, Observer, Unsupported,
};

/// Fixed-point units per task. A task at 100% contributes this much to the total.
const SCALE: i64 = 1000;

const DEFAULT_NAME: &str = "fanin";

/// A builder object that can be used to configure and create an [`Aggregator`].
#[derive(Clone, Default)]
pub struct AggregatorBuilder {
    name: Option<String>,
    task_count: Option<usize>,
}

impl AggregatorBuilder {
    /// Sets the name of the [`Aggregator`], used to prefix its log messages.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Declares the number of tasks up front.
    ///
    /// Exactly this many [`TaskHandle`]s may be created, and the [`Observer`] is only notified of
    /// completion once all of them have finished. Without a task count, handles can be created
    /// until the first task starts reporting.
    #[inline]
    pub fn task_count(self, count: usize) -> Self {
        Self {
            task_count: Some(count),
            ..self
        }
    }

    /// Creates an [`Aggregator`] reporting to `observer`.
    ///
    /// # Panics
    ///
    /// This method will panic if a task count of 0 was configured.
    pub fn build<O: Observer>(self, observer: O) -> Aggregator<O> {
        if let Some(count) = self.task_count {
            assert_ne!(count, 0, "task count must be at least 1");
        }

        let shared = Shared {
            name: self.name,
            limit: self.task_count,
            sink: Mutex::new(Sink {
                observer,
                finished: false,
            }),
            setup: Mutex::new(Setup {
                created: 0,
                started: false,
            }),
            slots: OnceLock::new(),
            active: ActiveTasks::new(self.task_count.unwrap_or(0)),
            failure: OnceLock::new(),
            settled: Mutex::new(false),
            settled_cv: Condvar::new(),
        };
        if shared.limit.is_some() {
            shared.start_if_not();
        }
        Aggregator(Arc::new(shared))
    }
}

/// Combines progress, completion and failure of a set of parallel tasks.
///
/// The [`Observer`] sees:
///
/// - the mean progress of all tasks, via [`Observer::set_progress`] (delivery is skipped when
///   another delivery is in flight, so reporting progress never blocks a task on the observer);
/// - every message reported by any task;
/// - either [`Observer::failed`] with the first failure reported by any task, or
///   [`Observer::done`] once every task has finished successfully, but never both, and each at
///   most once.
///
/// After a failure, tasks are cancelled cooperatively: their next progress report or
/// cancellation check returns a [`Cancelled`] error.
///
/// Call [`Aggregator::join`] to wait for every task to finish.
pub struct Aggregator<O>(Arc<Shared<O>>);

impl Aggregator<()> {
    /// Returns a builder that can be used to configure and create an [`Aggregator`].
    #[inline]
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }
}

impl<O: Observer> Aggregator<O> {
    /// Creates an [`Aggregator`] without a declared task count.
    ///
    /// [`TaskHandle`]s can be created until any task first reports something (or
    /// [`Aggregator::join`] is called); the number of handles created at that point becomes the
    /// task count.
    pub fn new(observer: O) -> Self {
        Aggregator::builder().build(observer)
    }

    /// Creates an [`Aggregator`] for exactly `count` tasks.
    ///
    /// # Panics
    ///
    /// This method will panic if `count` is 0.
    pub fn with_task_count(observer: O, count: usize) -> Self {
        Aggregator::builder().task_count(count).build(observer)
    }

    /// Creates the [`TaskHandle`] for the next task.
    ///
    /// Fails with [`IllegalUse::TooManyTasks`] if all declared tasks already have a handle, or
    /// with [`IllegalUse::AlreadyStarted`] if no task count was declared and a task has already
    /// started reporting.
    pub fn task_handle(&self) -> Result<TaskHandle<O>, IllegalUse> {
        let mut setup = self.0.setup.lock();
        match self.0.limit {
            None if setup.started => return Err(IllegalUse::AlreadyStarted),
            Some(limit) if setup.created >= limit => {
                return Err(IllegalUse::TooManyTasks { limit })
            }
            _ => {}
        }
        let index = setup.created;
        setup.created += 1;
        if self.0.limit.is_none() {
            self.0.active.add();
        }
        drop(setup);

        Ok(TaskHandle {
            shared: self.0.clone(),
            index,
        })
    }

    /// Blocks the calling thread until every task has finished.
    ///
    /// When this returns, the terminal notification (if any) has been delivered to the
    /// [`Observer`].
    ///
    /// # Task count
    ///
    /// If no task count was declared, calling this freezes the task count just like the first
    /// report of a task does: no more [`TaskHandle`]s can be created afterwards, so create all of
    /// them *before* joining. An aggregator without any tasks reports completion immediately.
    pub fn join(&self) {
        self.0.start_if_not();
        let settled = self.0.settled.lock();
        drop(self.0.settled_cv.wait_while(settled, |settled| !*settled));
        log::trace!("{}: joined", self.0.name());
    }

    /// Like [`Aggregator::join`], but gives up after `timeout`.
    ///
    /// Returns `true` if every task has finished. Freezes the task count the same way
    /// [`Aggregator::join`] does, even when it times out.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.0.start_if_not();
        let settled = self.0.settled.lock();
        let (_settled, timed_out) =
            self.0
                .settled_cv
                .wait_timeout_while(settled, timeout, |settled| !*settled);
        !timed_out
    }

    /// Returns `true` if any task has failed, or the observer has cancelled the operation.
    pub fn has_failed(&self) -> bool {
        self.0.failure.get().is_some()
    }

    /// Returns the primary failure, if any.
    pub fn failure(&self) -> Option<Failure> {
        self.0.failure.get().cloned()
    }

    /// Returns the number of tasks, once it is fixed.
    pub fn task_count(&self) -> Option<usize> {
        self.0.slots.get().map(Slots::len)
    }
}

/// The reporting capability of a single task.
///
/// Obtained from [`Aggregator::task_handle`]. A task reports progress and messages while it runs,
/// and finishes by calling either [`TaskHandle::report_done`] or [`TaskHandle::report_failure`].
/// Further terminal reports after that are ignored (apart from logging).
///
/// Dropping a handle whose task hasn't finished reports a failure on its behalf:
/// [`TaskError::Panicked`] if the thread is panicking, the pending [`Cancelled`] if the operation
/// was cancelled (so `task.report_progress(p)?` is enough to bail out), and
/// [`TaskError::Abandoned`] otherwise.
pub struct TaskHandle<O: Observer> {
    shared: Arc<Shared<O>>,
    index: usize,
}

impl<O: Observer> Drop for TaskHandle<O> {
    fn drop(&mut self) {
        let slots = self.shared.start_if_not();
        if slots.is_finished(self.index) {
            return;
        }

        let task = self.index;
        let failure = if thread::panicking() {
            Failure::new(TaskError::Panicked { task })
        } else if let Err(cancelled) = self.shared.cancel_if_failed() {
            // The task most likely bailed out with `?` after being cancelled.
            Failure::new(cancelled)
        } else {
            Failure::new(TaskError::Abandoned { task })
        };
        self.shared.fail(self.index, failure);
    }
}

impl<O: Observer> TaskHandle<O> {
    /// Returns the index of this task (the order in which its handle was created).
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reports the progress of this task, in the range `0.0..=1.0`.
    ///
    /// Out-of-range values are clamped, NaN counts as 0.
    ///
    /// Returns [`Cancelled`] without recording anything if another task has failed. If the
    /// observer cancels the operation in response to this report, its [`Cancelled`] error is
    /// returned as well.
    pub fn report_progress(&self, progress: f32) -> Result<(), Cancelled> {
        self.shared.set_progress(self.index, progress)
    }

    /// Passes a message through to the observer.
    ///
    /// Messages are delivered even after a failure, so that diagnostic context isn't lost. Only
    /// the observer itself can make this fail.
    pub fn report_message(&self, message: &str) -> Result<(), Cancelled> {
        self.shared.set_message(message)
    }

    /// Reports that this task has failed.
    ///
    /// The first failure reported by any task is delivered to the observer and cancels all other
    /// tasks. Later failures are only logged: cancellations at debug level (or not at all, if the
    /// user requested them), anything else at error level.
    pub fn report_failure<F: Into<Failure>>(&self, failure: F) {
        self.shared.fail(self.index, failure.into());
    }

    /// Reports that this task has finished successfully.
    ///
    /// Once every task has finished and none has failed, the observer is notified of completion.
    pub fn report_done(&self) {
        self.shared.done(self.index);
    }

    /// Returns [`Cancelled`] if the operation has been cancelled.
    ///
    /// Long-running tasks that don't report progress regularly should call this instead.
    pub fn check_cancellation(&self) -> Result<(), Cancelled> {
        self.shared.check_cancellation()
    }

    /// Announces that this task started a nested operation called `label`.
    pub fn sub_progress_started<L: Into<String>>(&self, label: L) -> Result<(), Cancelled> {
        self.shared.sub_progress_started(SubProgress {
            task: self.index,
            label: label.into(),
        })
    }

    /// Always fails: a parallel task can't be reset.
    pub fn reset(&self) -> Result<(), Unsupported> {
        Err(Unsupported::new())
    }
}

struct Shared<O> {
    name: Option<String>,
    /// The declared task count, if any.
    limit: Option<usize>,
    /// Every call into the observer happens while holding this lock.
    sink: Mutex<Sink<O>>,
    setup: Mutex<Setup>,
    /// Initialized exactly once, when the task count is frozen.
    slots: OnceLock<Slots>,
    active: ActiveTasks,
    /// The primary failure. The first `set` wins.
    failure: OnceLock<Failure>,
    /// Set once every task has finished and the terminal notification was handled.
    settled: Mutex<bool>,
    settled_cv: Condvar,
}

struct Sink<O> {
    observer: O,
    /// Set when `failed` or `done` has been called on the observer.
    finished: bool,
}

struct Setup {
    /// Number of task handles created so far.
    created: usize,
    started: bool,
}

impl<O: Observer> Shared<O> {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    /// Freezes the task count and allocates per-task state, if that hasn't happened yet.
    fn start_if_not(&self) -> &Slots {
        if let Some(slots) = self.slots.get() {
            return slots;
        }

        let mut no_tasks = false;
        let slots = self.slots.get_or_init(|| {
            // Holding `setup` keeps `task_handle` from handing out an index we don't allocate.
            let mut setup = self.setup.lock();
            setup.started = true;
            let count = self.limit.unwrap_or(setup.created);
            log::trace!("{}: starting with {count} tasks", self.name());
            no_tasks = count == 0;
            Slots::new(count)
        });
        if no_tasks {
            self.all_tasks_finished();
        }
        slots
    }

    fn cancel_if_failed(&self) -> Result<(), Cancelled> {
        match self.failure.get() {
            None => Ok(()),
            // The observer cancelled; pass its request on unchanged.
            Some(failure) => match failure.downcast_ref::<Cancelled>() {
                Some(cancelled) => Err(cancelled.clone()),
                None => Err(Cancelled::due_to(failure.clone())),
            },
        }
    }

    /// Calls into the observer unless another thread is already doing so, or a terminal
    /// notification has been delivered.
    fn try_with_observer(
        &self,
        f: impl FnOnce(&mut O) -> Result<(), Cancelled>,
    ) -> Result<(), Cancelled> {
        let Ok(mut sink) = self.sink.try_lock() else {
            return Ok(());
        };
        if sink.finished {
            return Ok(());
        }
        f(&mut sink.observer)
    }

    fn with_observer(
        &self,
        f: impl FnOnce(&mut O) -> Result<(), Cancelled>,
    ) -> Result<(), Cancelled> {
        let mut sink = self.sink.lock();
        f(&mut sink.observer)
    }

    fn set_progress(&self, index: usize, progress: f32) -> Result<(), Cancelled> {
        let slots = self.start_if_not();
        self.cancel_if_failed()?;

        slots.set(index, progress);
        // `combined` is read under the lock, so a delivery never carries an older total than a
        // preceding one.
        self.try_with_observer(|observer| observer.set_progress(slots.combined()))
            .map_err(|cancelled| self.observer_cancelled(cancelled))
    }

    fn set_message(&self, message: &str) -> Result<(), Cancelled> {
        self.start_if_not();
        self.with_observer(|observer| observer.set_message(message))
            .map_err(|cancelled| self.observer_cancelled(cancelled))
    }

    fn check_cancellation(&self) -> Result<(), Cancelled> {
        self.start_if_not();
        self.cancel_if_failed()?;
        self.try_with_observer(|observer| observer.check_cancelled())
            .map_err(|cancelled| self.observer_cancelled(cancelled))
    }

    fn sub_progress_started(&self, sub: SubProgress) -> Result<(), Cancelled> {
        self.start_if_not();
        self.cancel_if_failed()?;
        self.with_observer(|observer| observer.sub_progress_started(&sub))
            .map_err(|cancelled| self.observer_cancelled(cancelled))
    }

    /// Records a cancellation requested by the observer as the primary failure.
    ///
    /// Must not be called while holding the `sink` lock.
    fn observer_cancelled(&self, cancelled: Cancelled) -> Cancelled {
        let failure = Failure::new(cancelled.clone());
        if self.failure.set(failure.clone()).is_ok() {
            self.deliver_failure(&failure);
        }
        cancelled
    }

    fn deliver_failure(&self, failure: &Failure) {
        let mut sink = self.sink.lock();
        if sink.finished {
            log::warn!(
                "{}: failure after all tasks completed; not reporting to observer: {failure}",
                self.name(),
            );
            return;
        }
        sink.finished = true;
        sink.observer.failed(failure);
    }

    fn fail(&self, index: usize, failure: Failure) {
        let slots = self.start_if_not();
        // Deliver before marking the task finished, so that `join` can't return before the
        // observer has seen the failure.
        match self.failure.set(failure.clone()) {
            Ok(()) => self.deliver_failure(&failure),
            Err(_) => self.log_secondary(&failure),
        }
        if self.stop_running_if_not(slots, index) {
            self.all_tasks_finished();
        }
    }

    fn log_secondary(&self, failure: &Failure) {
        match failure.find_cancelled() {
            Some(cancelled) if cancelled.is_by_user() => {}
            Some(_) => log::debug!(
                "{}: task cancelled on thread {} ({failure})",
                self.name(),
                thread::current().name().unwrap_or("<unnamed>"),
            ),
            None => log::error!(
                "{}: secondary failure from parallel task; not reporting to observer: {failure}",
                self.name(),
            ),
        }
    }

    fn done(&self, index: usize) {
        let slots = self.start_if_not();
        if self.stop_running_if_not(slots, index) {
            self.all_tasks_finished();
        }
    }

    /// Marks task `index` as finished. Returns `true` if it was the last one running.
    fn stop_running_if_not(&self, slots: &Slots, index: usize) -> bool {
        if !slots.mark_finished(index) {
            return false;
        }
        self.active.finish_one()
    }

    /// Called exactly once, by whoever finished the last task.
    fn all_tasks_finished(&self) {
        if self.failure.get().is_none() && self.active.claim_completion() {
            let mut sink = self.sink.lock();
            // A failure may have been recorded since the check above.
            if !sink.finished && self.failure.get().is_none() {
                sink.finished = true;
                log::trace!("{}: all tasks done", self.name());
                sink.observer.done();
            }
        }

        *self.settled.lock() = true;
        self.settled_cv.notify_all();
    }
}

/// Per-task state, allocated once the task count is known.
struct Slots {
    /// Latest progress of every task, in units of `SCALE`.
    progress: Box<[AtomicI64]>,
    /// Sum of `progress`, maintained incrementally.
    total: AtomicI64,
    /// One bit per task, set when the task has finished.
    finished: Box<[AtomicU64]>,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            progress: (0..count).map(|_| AtomicI64::new(0)).collect(),
            total: AtomicI64::new(0),
            finished: (0..count.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.progress.len()
    }

    fn set(&self, index: usize, progress: f32) {
        let value = to_fixed(progress);
        let prev = self.progress[index].swap(value, Ordering::AcqRel);
        self.total.fetch_add(value - prev, Ordering::AcqRel);
    }

    /// Mean progress of all tasks.
    fn combined(&self) -> f32 {
        let total = self.total.load(Ordering::Acquire) as f64;
        let mean = total / self.len() as f64 / SCALE as f64;
        mean.clamp(0.0, 1.0) as f32
    }

    fn bit(index: usize) -> (usize, u64) {
        (index / 64, 1 << (index % 64))
    }

    fn is_finished(&self, index: usize) -> bool {
        let (word, mask) = Self::bit(index);
        self.finished[word].load(Ordering::Acquire) & mask != 0
    }

    /// Sets the finished bit of task `index`. Returns `false` if it was already set.
    fn mark_finished(&self, index: usize) -> bool {
        if self.is_finished(index) {
            return false;
        }
        let (word, mask) = Self::bit(index);
        self.finished[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }
}

fn to_fixed(progress: f32) -> i64 {
    if progress.is_nan() {
        return 0;
    }
    (f64::from(progress.clamp(0.0, 1.0)) * SCALE as f64).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    /// This many tasks haven't finished yet.
    Running(usize),
    /// All tasks have finished and completion has been claimed for delivery.
    Completed,
}

impl Active {
    const COMPLETED: usize = usize::MAX;

    fn decode(raw: usize) -> Self {
        match raw {
            Self::COMPLETED => Active::Completed,
            n => Active::Running(n),
        }
    }

    fn encode(self) -> usize {
        match self {
            Active::Running(n) => n,
            Active::Completed => Self::COMPLETED,
        }
    }
}

/// An atomic [`Active`] state.
struct ActiveTasks(AtomicUsize);

impl ActiveTasks {
    fn new(count: usize) -> Self {
        Self(AtomicUsize::new(Active::Running(count).encode()))
    }

    fn get(&self) -> Active {
        Active::decode(self.0.load(Ordering::Acquire))
    }

    fn add(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the running count. Returns `true` if it reached zero.
    fn finish_one(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match Active::decode(raw) {
                    Active::Running(n) if n > 0 => Some(Active::Running(n - 1).encode()),
                    Active::Running(_) | Active::Completed => None,
                }
            })
            .map_or(false, |prev| prev == 1)
    }

    /// Moves from `Running(0)` to `Completed`. Only one caller ever succeeds.
    fn claim_completion(&self) -> bool {
        self.0
            .compare_exchange(
                Active::Running(0).encode(),
                Active::Completed.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
