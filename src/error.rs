//! Error types.
//!
//! - [`Failure`] is what a task reports when it fails. The first one becomes the *primary*
//!   failure and is handed to the [`Observer`][crate::Observer]; all later ones are only logged.
//! - [`Cancelled`] is returned to tasks that should stop working, either because the observer
//!   asked for it or because another task failed.
//! - [`IllegalUse`] and [`Unsupported`] signal misuse of the aggregator API.

use std::{error::Error, fmt, sync::Arc};

/// A failure reported by a parallel task.
///
/// This is a shared, cheaply clonable wrapper around an arbitrary error value. Any type
/// implementing [`Error`] + [`Send`] + [`Sync`] can be converted into a [`Failure`] via
/// [`From`], so `handle.report_failure(io_error)` works directly. Plain messages can be turned
/// into a [`Failure`] with [`Failure::msg`].
///
/// [`Failure`] deliberately does not implement [`Error`] itself (that would conflict with the
/// blanket [`From`] impl). Use [`Failure::get_ref`] to access the wrapped error as a
/// `dyn Error`.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

impl Failure {
    /// Wraps an error value.
    pub fn new<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Creates a [`Failure`] carrying only a message.
    pub fn msg<M: fmt::Display>(message: M) -> Self {
        Self::new(Message(message.to_string()))
    }

    /// Returns a reference to the wrapped error.
    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Attempts to downcast the wrapped error to a concrete type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// Returns `true` if a [`Cancelled`] error occurs anywhere in this failure's source chain.
    pub fn is_cancellation(&self) -> bool {
        self.find_cancelled().is_some()
    }

    /// Returns the first [`Cancelled`] in this failure's source chain, starting with the wrapped
    /// error itself.
    pub(crate) fn find_cancelled(&self) -> Option<&Cancelled> {
        let mut cur: Option<&(dyn Error + 'static)> = Some(self.get_ref());
        while let Some(err) = cur {
            if let Some(cancelled) = err.downcast_ref::<Cancelled>() {
                return Some(cancelled);
            }
            cur = err.source();
        }
        None
    }
}

impl<E: Error + Send + Sync + 'static> From<E> for Failure {
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

#[derive(Debug)]
struct Message(String);

impl Error for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that tasks may report through [`TaskHandle::report_failure`] on their own.
///
/// These are also reported automatically when a [`TaskHandle`] is dropped before its task
/// finished.
///
/// [`TaskHandle`]: crate::TaskHandle
/// [`TaskHandle::report_failure`]: crate::TaskHandle::report_failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The thread running the task panicked while holding its handle.
    Panicked {
        /// Index of the task.
        task: usize,
    },
    /// The handle was dropped without reporting completion or failure.
    Abandoned {
        /// Index of the task.
        task: usize,
    },
}

impl Error for TaskError {}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Panicked { task } => write!(f, "task {task} panicked"),
            TaskError::Abandoned { task } => {
                write!(f, "task {task} dropped its handle without finishing")
            }
        }
    }
}

/// Cooperative cancellation signal.
///
/// Returned by [`TaskHandle`] methods once the task should stop working. A task receiving this
/// error is expected to unwind its work, and may pass the error on to
/// [`TaskHandle::report_failure`]; cancellations reported that way are never forwarded to the
/// observer a second time.
///
/// [`TaskHandle`]: crate::TaskHandle
/// [`TaskHandle::report_failure`]: crate::TaskHandle::report_failure
#[derive(Clone)]
pub struct Cancelled {
    cause: Cause,
}

#[derive(Clone)]
enum Cause {
    ByUser,
    Failure(Failure),
}

impl Cancelled {
    /// Creates a cancellation requested by the user, for use by [`Observer`] implementations.
    ///
    /// [`Observer`]: crate::Observer
    pub fn by_user() -> Self {
        Self {
            cause: Cause::ByUser,
        }
    }

    pub(crate) fn due_to(failure: Failure) -> Self {
        Self {
            cause: Cause::Failure(failure),
        }
    }

    /// Returns `true` if the observer requested this cancellation.
    pub fn is_by_user(&self) -> bool {
        matches!(self.cause, Cause::ByUser)
    }

    /// Returns the failure of another task that caused this cancellation, if any.
    ///
    /// This is the *primary* failure, i.e. the one that was delivered to the observer.
    pub fn failure(&self) -> Option<&Failure> {
        match &self.cause {
            Cause::ByUser => None,
            Cause::Failure(failure) => Some(failure),
        }
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Cause::ByUser => f.write_str("Cancelled(ByUser)"),
            Cause::Failure(failure) => f.debug_tuple("Cancelled").field(failure).finish(),
        }
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Cause::ByUser => f.write_str("operation cancelled by user"),
            Cause::Failure(failure) => {
                write!(f, "operation cancelled due to failure of another task: {failure}")
            }
        }
    }
}

impl Error for Cancelled {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Cause::ByUser => None,
            Cause::Failure(failure) => Some(failure.get_ref()),
        }
    }
}

/// Misuse of the task handle creation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalUse {
    /// More handles were requested than the declared task count.
    TooManyTasks {
        /// The task count the aggregator was created with.
        limit: usize,
    },
    /// A handle was requested from an open-ended aggregator after a task already started
    /// reporting.
    AlreadyStarted,
}

impl Error for IllegalUse {}

impl fmt::Display for IllegalUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IllegalUse::TooManyTasks { limit } => write!(
                f,
                "attempt to create more task handles than the declared task count ({limit})"
            ),
            IllegalUse::AlreadyStarted => {
                f.write_str("cannot create new task handles after tasks have started")
            }
        }
    }
}

/// An error returned by [`TaskHandle::reset`], which is not supported.
///
/// [`TaskHandle::reset`]: crate::TaskHandle::reset
#[derive(Debug, Clone)]
pub struct Unsupported {
    _priv: (),
}

impl Unsupported {
    pub(crate) fn new() -> Self {
        Self { _priv: () }
    }
}

impl Error for Unsupported {}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("resetting a parallel task is not supported")
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn failure_wraps_any_error() {
        let failure: Failure = io::Error::new(io::ErrorKind::Other, "disk on fire").into();
        assert_eq!(failure.to_string(), "disk on fire");
        assert_eq!(
            failure.downcast_ref::<io::Error>().unwrap().kind(),
            io::ErrorKind::Other
        );
        assert!(!failure.is_cancellation());

        let msg = Failure::msg("X");
        assert_eq!(msg.to_string(), "X");
        assert_eq!(format!("{:?}", msg), r#"Message("X")"#);
    }

    #[test]
    fn cancellation_chain() {
        let primary = Failure::msg("X");
        let cancelled = Cancelled::due_to(primary);
        assert!(!cancelled.is_by_user());
        assert_eq!(cancelled.failure().unwrap().to_string(), "X");
        assert_eq!(cancelled.source().unwrap().to_string(), "X");

        let reported = Failure::from(cancelled);
        assert!(reported.is_cancellation());
        assert!(!reported.find_cancelled().unwrap().is_by_user());

        let by_user = Failure::from(Cancelled::by_user());
        assert!(by_user.find_cancelled().unwrap().is_by_user());
    }

    #[test]
    fn cancellation_nested_in_other_error() {
        #[derive(Debug)]
        struct Wrapper(Cancelled);
        impl Error for Wrapper {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("export step failed")
            }
        }

        let failure = Failure::new(Wrapper(Cancelled::by_user()));
        assert!(failure.find_cancelled().unwrap().is_by_user());
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            IllegalUse::TooManyTasks { limit: 3 }.to_string(),
            "attempt to create more task handles than the declared task count (3)"
        );
        assert_eq!(
            TaskError::Abandoned { task: 2 }.to_string(),
            "task 2 dropped its handle without finishing"
        );
        assert_eq!(
            Cancelled::by_user().to_string(),
            "operation cancelled by user"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send_sync::<Failure>();
        assert_send_sync::<Cancelled>();
        assert_send_sync::<IllegalUse>();
    }
}
