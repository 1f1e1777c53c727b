//! The interpreter lock.
//!
//! One thread at a time owns the lock and may touch the interpreter. A
//! *session* is one entry into the interpreter (a run, an `exec`, a callback
//! invocation); it owns the lock except while suspended around blocking host
//! work. Closing waits until no session is left, so the state is never
//! destroyed under a suspended script.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    thread::{self, ThreadId},
};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct LockState {
    /// Thread currently allowed to touch the interpreter.
    owner: Option<ThreadId>,
    /// Threads blocked waiting for the lock.
    waiters: usize,
    /// Sessions entered and not yet left, suspended ones included.
    sessions: usize,
    /// Bumped on every acquisition.
    generation: u64,
    /// No new sessions are accepted.
    closing: bool,
    /// The interpreter has been destroyed.
    closed: bool,
}

/// A non-recursive lock with explicit hand-off.
#[derive(Debug, Default)]
pub(crate) struct Gil {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl Gil {
    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.changed.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Start a session on the calling thread, blocking until the lock is
    /// free. Fails when the thread already holds the lock or the
    /// environment is closing.
    pub(crate) fn enter(&self) -> Result<Session<'_>> {
        let me = thread::current().id();
        let mut st = self.lock();
        if st.owner == Some(me) {
            return Err(Error::Reentrant);
        }
        if st.closing || st.closed {
            return Err(Error::Closed);
        }

        st.sessions += 1;
        st.waiters += 1;
        while st.owner.is_some() {
            st = self.wait(st);
        }
        st.waiters -= 1;
        st.owner = Some(me);
        st.generation += 1;
        tracing::trace!(generation = st.generation, "interpreter lock acquired");
        Ok(Session { gil: self })
    }

    /// Whether the calling thread holds the lock.
    pub(crate) fn is_held(&self) -> bool {
        self.lock().owner == Some(thread::current().id())
    }

    /// Hand the lock to a waiting thread, if there is one, and take it back
    /// once that thread is done. Does nothing unless the calling thread holds
    /// the lock.
    pub(crate) fn yield_now(&self) {
        let me = thread::current().id();
        let mut st = self.lock();
        if st.owner != Some(me) || st.waiters == 0 {
            return;
        }

        let generation = st.generation;
        st.owner = None;
        self.changed.notify_all();
        tracing::trace!(waiters = st.waiters, "interpreter lock handed off");

        st.waiters += 1;
        while st.owner.is_some() || (st.generation == generation && st.waiters > 1) {
            st = self.wait(st);
        }
        st.waiters -= 1;
        st.owner = Some(me);
        st.generation += 1;
        tracing::trace!(generation = st.generation, "interpreter lock resumed");
    }

    /// Release the lock until the returned guard is dropped. `None` when the
    /// calling thread does not hold the lock.
    pub(crate) fn suspend(&self) -> Option<Suspended<'_>> {
        let me = thread::current().id();
        let mut st = self.lock();
        if st.owner != Some(me) {
            return None;
        }
        st.owner = None;
        self.changed.notify_all();
        tracing::trace!("interpreter lock released for blocking work");
        Some(Suspended { gil: self })
    }

    fn resume(&self) {
        let me = thread::current().id();
        let mut st = self.lock();
        st.waiters += 1;
        while st.owner.is_some() {
            st = self.wait(st);
        }
        st.waiters -= 1;
        st.owner = Some(me);
        st.generation += 1;
        tracing::trace!(generation = st.generation, "interpreter lock reacquired");
    }

    fn leave(&self) {
        let mut st = self.lock();
        st.owner = None;
        st.sessions -= 1;
        self.changed.notify_all();
        tracing::trace!("interpreter lock released");
    }

    /// Refuse new sessions from now on.
    pub(crate) fn begin_close(&self) {
        let mut st = self.lock();
        st.closing = true;
        self.changed.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait until every session has left, run `destroy` holding the lock,
    /// and mark the interpreter closed. Returns `None` if it already was.
    pub(crate) fn shutdown<R>(&self, destroy: impl FnOnce() -> R) -> Option<R> {
        let me = thread::current().id();
        let mut st = self.lock();
        st.closing = true;
        while !st.closed && (st.sessions > 0 || st.owner.is_some()) {
            st = self.wait(st);
        }
        if st.closed {
            return None;
        }
        st.owner = Some(me);
        drop(st);

        let result = destroy();

        let mut st = self.lock();
        st.owner = None;
        st.closed = true;
        self.changed.notify_all();
        Some(result)
    }
}

/// An entered session; leaving releases the lock.
pub(crate) struct Session<'a> {
    gil: &'a Gil,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.gil.leave();
    }
}

/// The lock released around blocking work; dropping reacquires it.
pub(crate) struct Suspended<'a> {
    gil: &'a Gil,
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        self.gil.resume();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn reentry_is_refused() {
        let gil = Gil::default();
        let session = gil.enter().unwrap();
        assert!(gil.is_held());
        assert!(matches!(gil.enter(), Err(Error::Reentrant)));
        drop(session);
        assert!(!gil.is_held());
        assert!(gil.enter().is_ok());
    }

    #[test]
    fn one_owner_at_a_time() {
        let gil = Arc::new(Gil::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let (gil, inside, overlapped) = (gil.clone(), inside.clone(), overlapped.clone());
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _session = gil.enter().unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        gil.yield_now();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn yield_hands_off_to_a_waiter() {
        let gil = Arc::new(Gil::default());
        let ran = Arc::new(AtomicBool::new(false));
        let session = gil.enter().unwrap();

        let waiter = {
            let (gil, ran) = (gil.clone(), ran.clone());
            thread::spawn(move || {
                let _session = gil.enter().unwrap();
                ran.store(true, Ordering::SeqCst);
            })
        };

        for _ in 0..1000 {
            gil.yield_now();
            if ran.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(ran.load(Ordering::SeqCst));
        assert!(gil.is_held());
        drop(session);
        waiter.join().unwrap();
    }

    #[test]
    fn suspend_lets_others_in() {
        let gil = Arc::new(Gil::default());
        let _session = gil.enter().unwrap();
        {
            let _released = gil.suspend().unwrap();
            let other = {
                let gil = gil.clone();
                thread::spawn(move || gil.enter().map(drop).is_ok())
            };
            assert!(other.join().unwrap());
        }
        assert!(gil.is_held());

        let foreign = {
            let gil = gil.clone();
            thread::spawn(move || gil.suspend().is_none())
        };
        assert!(foreign.join().unwrap());
    }

    #[test]
    fn shutdown_waits_for_suspended_sessions() {
        let gil = Arc::new(Gil::default());
        let (tx, rx) = std::sync::mpsc::channel();

        let resumed = Arc::new(AtomicBool::new(false));

        let worker = {
            let (gil, resumed) = (gil.clone(), resumed.clone());
            thread::spawn(move || {
                let _session = gil.enter().unwrap();
                let released = gil.suspend().unwrap();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                drop(released);
                resumed.store(true, Ordering::SeqCst);
            })
        };

        rx.recv().unwrap();
        gil.begin_close();
        assert!(matches!(gil.enter(), Err(Error::Closed)));

        let destroyed = gil.shutdown(|| resumed.load(Ordering::SeqCst));
        assert_eq!(destroyed, Some(true));
        assert!(gil.is_closed());
        assert_eq!(gil.shutdown(|| ()), None);
        worker.join().unwrap();
    }
}
