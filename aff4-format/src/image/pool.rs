//! Bounded parallel execution of bevy jobs for one image writer.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    in_flight: usize,
    first_error: Option<Error>,
}

struct Shared {
    state: Mutex<State>,
    slot_freed: Condvar,
}

/// Runs at most `limit` jobs at once. [`BevyPool::join`] waits for all of
/// them and returns the first failure.
pub(crate) struct BevyPool {
    pool: rayon::ThreadPool,
    shared: Arc<Shared>,
    limit: usize,
}

impl BevyPool {
    pub(crate) fn new(limit: usize) -> Result<BevyPool> {
        let limit = limit.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(|i| format!("aff4-bevy-{}", i))
            .build()
            .map_err(std::io::Error::other)?;

        Ok(BevyPool {
            pool,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                slot_freed: Condvar::new(),
            }),
            limit,
        })
    }

    /// Queue `job`, blocking while `limit` jobs are already running.
    pub(crate) fn spawn<F>(&self, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            while state.in_flight >= self.limit {
                self.shared.slot_freed.wait(&mut state);
            }
            state.in_flight += 1;
        }

        let shared = self.shared.clone();
        self.pool.spawn(move || {
            let result = job();
            let mut state = shared.state.lock();
            state.in_flight -= 1;
            if let Err(err) = result {
                tracing::error!(error = %err, "bevy worker failed");
                state.first_error.get_or_insert(err);
            }
            shared.slot_freed.notify_all();
        });
    }

    /// Wait for every queued job. Returns the first error any of them hit.
    pub(crate) fn join(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            self.shared.slot_freed.wait(&mut state);
        }
        match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BevyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BevyPool")
            .field("limit", &self.limit)
            .field("in_flight", &state.in_flight)
            .field("failed", &state.first_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn never_exceeds_the_limit() {
        let pool = BevyPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.join().unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn first_error_reaches_join() {
        let pool = BevyPool::new(4).unwrap();
        pool.spawn(|| Ok(()));
        pool.spawn(|| Err(Error::structural("bevy 1 failed")));
        pool.spawn(|| Ok(()));
        assert!(matches!(pool.join(), Err(Error::Structural(_))));
        pool.join().unwrap();
    }
}
