//! Per-URN mutual exclusion.
//!
//! A lock is created the first time a URN is opened and lives as long as the
//! resolver. Holding a [`Lease`] is what "having an object open" means; the
//! lease releases the URN when dropped, wherever the lease has travelled to.
//!
//! Opening a URN that the current thread already holds blocks forever unless
//! re-entrancy detection, a timeout or a cancellation token is in effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::urn::Urn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const WARN_AFTER: Duration = Duration::from_secs(5);

/// Aborts a blocked `open` from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call overrides for how `open` waits on a busy URN.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Give up with [`Error::LockTimeout`] after this long.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl OpenOptions {
    pub fn timeout(timeout: Duration) -> OpenOptions {
        OpenOptions {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancellable(token: CancellationToken) -> OpenOptions {
        OpenOptions {
            timeout: None,
            cancel: Some(token),
        }
    }
}

#[derive(Debug)]
pub(crate) struct UrnLock {
    urn: Urn,
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl UrnLock {
    pub(crate) fn new(urn: Urn) -> UrnLock {
        UrnLock {
            urn,
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(
        self: &Arc<Self>,
        detect_reentrancy: bool,
        options: &OpenOptions,
    ) -> Result<Lease> {
        let me = std::thread::current().id();
        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);
        let mut warned = false;

        let mut owner = self.owner.lock();
        while let Some(holder) = *owner {
            if detect_reentrancy && holder == me {
                return Err(Error::ConcurrencyHazard(self.urn.clone()));
            }
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled(self.urn.clone()));
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(Error::LockTimeout(self.urn.clone()));
                }
                Some(deadline) => POLL_INTERVAL.min(deadline - now),
                None => POLL_INTERVAL,
            };
            self.released.wait_for(&mut owner, wait);

            if !warned && started.elapsed() >= WARN_AFTER {
                tracing::warn!(
                    urn = %self.urn,
                    same_thread = holder == me,
                    "still waiting for object lock"
                );
                warned = true;
            }
        }

        *owner = Some(me);
        Ok(Lease { lock: self.clone() })
    }
}

/// Exclusive hold on one URN, released on drop.
#[derive(Debug)]
pub struct Lease {
    lock: Arc<UrnLock>,
}

impl Lease {
    pub fn urn(&self) -> &Urn {
        &self.lock.urn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        *self.lock.owner.lock() = None;
        self.lock.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> Arc<UrnLock> {
        Arc::new(UrnLock::new(Urn::new("aff4://locked")))
    }

    #[test]
    fn lease_releases_on_drop() {
        let lock = lock();
        let lease = lock.acquire(false, &OpenOptions::default()).unwrap();
        drop(lease);
        lock.acquire(false, &OpenOptions::default()).unwrap();
    }

    #[test]
    fn timeout_on_held_lock() {
        let lock = lock();
        let _lease = lock.acquire(false, &OpenOptions::default()).unwrap();
        let err = lock
            .acquire(false, &OpenOptions::timeout(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[test]
    fn reentrancy_detected_when_enabled() {
        let lock = lock();
        let _lease = lock.acquire(true, &OpenOptions::default()).unwrap();
        let err = lock.acquire(true, &OpenOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyHazard(_)));
    }

    #[test]
    fn cancellation_from_another_thread() {
        let lock = lock();
        let _lease = lock.acquire(false, &OpenOptions::default()).unwrap();
        let token = CancellationToken::new();

        let waiter = {
            let lock = lock.clone();
            let token = token.clone();
            std::thread::spawn(move || lock.acquire(false, &OpenOptions::cancellable(token)))
        };
        std::thread::sleep(Duration::from_millis(100));
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled(_))));
    }

    #[test]
    fn waiter_acquires_after_release() {
        let lock = lock();
        let lease = lock.acquire(false, &OpenOptions::default()).unwrap();
        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || lock.acquire(false, &OpenOptions::default()).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(lease);
        waiter.join().unwrap().unwrap();
    }
}
