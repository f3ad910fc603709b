//! Lock wrappers that ignore poisoning.
//!
//! The aggregator calls into a user-supplied [`Observer`][crate::Observer] while holding its
//! delivery lock. If the observer panics, [`std::sync::Mutex`] would poison itself, and every
//! task reporting afterwards would panic on `unwrap` instead of reporting its own outcome. The
//! first panic is the interesting one, and it already travels up the panicking task's thread (and
//! out of its [`TaskHandle`][crate::TaskHandle] as a failure), so these wrappers simply recover
//! the guard.

use std::{
    error::Error,
    fmt,
    ops::{Deref, DerefMut},
    sync,
    time::Duration,
};

pub type TryLockResult<Guard> = Result<Guard, TryLockError>;

pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    /// Acquires the lock only if nobody else holds it right now.
    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, T>> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(sync::TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(sync::TryLockError::WouldBlock) => return Err(TryLockError),
        };

        Ok(MutexGuard { inner: guard })
    }
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TryLockError;

impl Error for TryLockError {}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("`try_lock` failed because the operation would block")
    }
}

pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        let guard = match self.inner.wait_while(guard.inner, condition) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    /// Like [`Condvar::wait_while`], but gives up after `dur`.
    ///
    /// Returns `true` if the wait timed out with `condition` still holding.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let (guard, timeout) = match self.inner.wait_timeout_while(guard.inner, dur, condition) {
            Ok(out) => out,
            Err(poison) => poison.into_inner(),
        };
        (MutexGuard { inner: guard }, timeout.timed_out())
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
        sync::Arc,
        thread,
    };

    use super::*;

    #[test]
    fn lock_survives_panicking_holder() {
        let mutex = Arc::new(Mutex::new(0));
        let m = mutex.clone();
        let res = thread::spawn(move || {
            catch_unwind(AssertUnwindSafe(|| {
                let mut guard = m.lock();
                *guard += 1;
                resume_unwind(Box::new("observer panic"));
            }))
        })
        .join()
        .unwrap();
        assert!(res.is_err());

        assert_eq!(*mutex.lock(), 1);
        assert_eq!(*mutex.try_lock().unwrap(), 1);
    }

    #[test]
    fn try_lock_would_block() {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
        assert_eq!(mutex.try_lock().unwrap_err(), TryLockError);
    }

    #[test]
    fn wait_timeout_while_times_out() {
        let mutex = Mutex::new(false);
        let condvar = Condvar::new();
        let (guard, timed_out) =
            condvar.wait_timeout_while(mutex.lock(), Duration::from_millis(10), |done| !*done);
        assert!(timed_out);
        assert!(!*guard);
    }

    #[test]
    fn wait_while_wakes_on_notify() {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let s = state.clone();
        let t = thread::spawn(move || {
            *s.0.lock() = true;
            s.1.notify_all();
        });
        let guard = state.1.wait_while(state.0.lock(), |done| !*done);
        assert!(*guard);
        drop(guard);
        t.join().unwrap();
    }
}
