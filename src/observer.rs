//! The downstream side of an [`Aggregator`][crate::Aggregator].
//!
//! An [`Observer`] receives the combined progress of all tasks, pass-through messages, and
//! exactly one terminal notification. The aggregator serializes all calls into it, so
//! implementations don't need to be thread-safe or reentrant (they only need to be [`Send`]).
//!
//! [`channel`] provides an [`Observer`] that turns every call into an [`Event`] on a
//! [`crossbeam_channel`] channel.

use crossbeam_channel::{Receiver, Sender};

use crate::{Cancelled, Failure};

/// Descriptor passed to [`Observer::sub_progress_started`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubProgress {
    /// Index of the task that started the sub-operation.
    pub task: usize,
    /// Caller-provided label of the sub-operation.
    pub label: String,
}

/// A sink for the combined progress of a set of parallel tasks.
///
/// Methods returning `Result<(), Cancelled>` may return [`Cancelled::by_user`] to ask all tasks
/// to stop. The aggregator records that as the terminal failure, reports it back through
/// [`Observer::failed`], and hands it to every task that checks for cancellation afterwards.
pub trait Observer: Send {
    /// Called with the combined progress of all tasks, in the range `0.0..=1.0`.
    ///
    /// Intermediate values may be skipped when several tasks report at the same time.
    fn set_progress(&mut self, progress: f32) -> Result<(), Cancelled>;

    /// Called with a message reported by any task.
    fn set_message(&mut self, message: &str) -> Result<(), Cancelled>;

    /// Called at most once, with the first failure reported by any task.
    ///
    /// After this has been called, [`Observer::done`] is never called.
    fn failed(&mut self, failure: &Failure);

    /// Called at most once, after every task has finished successfully.
    fn done(&mut self);

    /// Polled when a task checks for cancellation without reporting progress.
    fn check_cancelled(&mut self) -> Result<(), Cancelled> {
        Ok(())
    }

    /// Called when a task announces that it started a nested operation.
    fn sub_progress_started(&mut self, sub: &SubProgress) -> Result<(), Cancelled> {
        let _ = sub;
        Ok(())
    }
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn set_progress(&mut self, progress: f32) -> Result<(), Cancelled> {
        (**self).set_progress(progress)
    }

    fn set_message(&mut self, message: &str) -> Result<(), Cancelled> {
        (**self).set_message(message)
    }

    fn failed(&mut self, failure: &Failure) {
        (**self).failed(failure)
    }

    fn done(&mut self) {
        (**self).done()
    }

    fn check_cancelled(&mut self) -> Result<(), Cancelled> {
        (**self).check_cancelled()
    }

    fn sub_progress_started(&mut self, sub: &SubProgress) -> Result<(), Cancelled> {
        (**self).sub_progress_started(sub)
    }
}

/// An [`Observer`] call, as delivered by a [`ChannelObserver`].
#[derive(Debug, Clone)]
pub enum Event {
    Progress(f32),
    Message(String),
    SubProgressStarted(SubProgress),
    Failed(Failure),
    Done,
}

/// Creates a connected pair of [`ChannelObserver`] and [`Receiver`].
///
/// The channel is unbounded, so the aggregator never blocks on a slow consumer. Dropping the
/// [`Receiver`] is treated as a user cancellation: the next progress or message delivery returns
/// [`Cancelled::by_user`].
pub fn channel() -> (ChannelObserver, Receiver<Event>) {
    let (sender, recv) = crossbeam_channel::unbounded();
    (ChannelObserver { sender }, recv)
}

/// An [`Observer`] that sends every call as an [`Event`] over a channel.
///
/// Created by [`channel`].
pub struct ChannelObserver {
    sender: Sender<Event>,
}

impl ChannelObserver {
    fn send(&self, event: Event) -> Result<(), Cancelled> {
        self.sender.send(event).map_err(|_| Cancelled::by_user())
    }
}

impl Observer for ChannelObserver {
    fn set_progress(&mut self, progress: f32) -> Result<(), Cancelled> {
        self.send(Event::Progress(progress))
    }

    fn set_message(&mut self, message: &str) -> Result<(), Cancelled> {
        self.send(Event::Message(message.to_string()))
    }

    fn failed(&mut self, failure: &Failure) {
        // Nobody is listening anymore; that's fine for a terminal event.
        self.send(Event::Failed(failure.clone())).ok();
    }

    fn done(&mut self) {
        self.send(Event::Done).ok();
    }

    fn sub_progress_started(&mut self, sub: &SubProgress) -> Result<(), Cancelled> {
        self.send(Event::SubProgressStarted(sub.clone()))
    }
}
