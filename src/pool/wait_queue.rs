use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::error::{ErrorKind, Result};

/// A counting semaphore bounding the number of connections checked out of a pool at once.
///
/// Threads acquire a permit before checking out a connection and hold it until the connection
/// is returned. When no permit is free, acquisition blocks, optionally up to a timeout, and
/// optionally subject to a cap on how many threads may block at once.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    // `None` when the pool is unbounded; acquisition then always succeeds immediately.
    limits: Option<Limits>,
}

#[derive(Debug)]
struct Limits {
    state: Mutex<State>,
    available: Condvar,
    max_waiters: Option<u32>,
}

#[derive(Debug)]
struct State {
    permits: u32,
    waiters: u32,
}

impl WaitQueue {
    pub(super) fn new(max_permits: Option<u32>, max_waiters: Option<u32>) -> Self {
        Self {
            limits: max_permits.map(|permits| Limits {
                state: Mutex::new(State {
                    permits,
                    waiters: 0,
                }),
                available: Condvar::new(),
                max_waiters,
            }),
        }
    }

    /// Acquire a permit, blocking for up to `timeout` (forever when `None`) until one frees
    /// up. Returns `false` when the timeout elapses first. Fails immediately when the number
    /// of already-blocked callers has reached the waiter cap.
    pub(super) fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let limits = match self.limits {
            Some(ref limits) => limits,
            None => return Ok(true),
        };

        let mut state = limits.state.lock().unwrap();
        if state.permits == 0 {
            if let Some(max_waiters) = limits.max_waiters {
                if state.waiters >= max_waiters {
                    return Err(ErrorKind::WaitQueueOverflow {
                        message: format!(
                            "{} threads are already waiting for a connection; refusing to queue \
                             another",
                            state.waiters
                        ),
                    }
                    .into());
                }
            }

            state.waiters += 1;
            let deadline = timeout.map(|timeout| Instant::now() + timeout);

            while state.permits == 0 {
                state = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            state.waiters -= 1;
                            return Ok(false);
                        }
                        let (guard, _) = limits
                            .available
                            .wait_timeout(state, deadline - now)
                            .unwrap();
                        guard
                    }
                    None => limits.available.wait(state).unwrap(),
                };
            }

            state.waiters -= 1;
        }

        state.permits -= 1;
        Ok(true)
    }

    /// Release a previously acquired permit and wake a waiter, if any.
    pub(super) fn release(&self) {
        if let Some(ref limits) = self.limits {
            let mut state = limits.state.lock().unwrap();
            state.permits += 1;
            drop(state);
            limits.available.notify_one();
        }
    }

    #[cfg(test)]
    pub(super) fn available_permits(&self) -> Option<u32> {
        self.limits
            .as_ref()
            .map(|limits| limits.state.lock().unwrap().permits)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::WaitQueue;
    use crate::error::ErrorKind;

    #[test]
    fn acquire_up_to_capacity() {
        let queue = WaitQueue::new(Some(2), None);
        assert!(queue.acquire(None).unwrap());
        assert!(queue.acquire(None).unwrap());
        assert!(!queue.acquire(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn release_wakes_a_waiter() {
        let queue = Arc::new(WaitQueue::new(Some(1), None));
        assert!(queue.acquire(None).unwrap());

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.acquire(Some(Duration::from_secs(10))).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        queue.release();

        assert!(waiter.join().unwrap());
        assert_eq!(queue.available_permits(), Some(0));
    }

    #[test]
    fn timed_out_acquire_restores_state() {
        let queue = WaitQueue::new(Some(1), None);
        assert!(queue.acquire(None).unwrap());
        assert!(!queue.acquire(Some(Duration::from_millis(10))).unwrap());

        queue.release();
        assert!(queue.acquire(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn waiter_cap_overflows_immediately() {
        let queue = Arc::new(WaitQueue::new(Some(1), Some(1)));
        assert!(queue.acquire(None).unwrap());

        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.acquire(Some(Duration::from_secs(10))).unwrap())
        };

        // Let the first waiter enter the queue, then the cap rejects the second without
        // waiting for any timeout.
        thread::sleep(Duration::from_millis(50));
        let err = queue.acquire(Some(Duration::from_secs(10))).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::WaitQueueOverflow { .. }
        ));

        queue.release();
        assert!(blocked.join().unwrap());
    }

    #[test]
    fn unbounded_queue_never_blocks() {
        let queue = WaitQueue::new(None, None);
        for _ in 0..64 {
            assert!(queue.acquire(Some(Duration::ZERO)).unwrap());
        }
        queue.release();
    }
}
