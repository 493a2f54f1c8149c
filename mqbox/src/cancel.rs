//! Cooperative cancellation shared by the loops and the shutdown path.
//!
//! A [`CancelToken`] is a one-way flag: once cancelled it stays cancelled.
//! Loops check it at every suspension point and sleep through
//! [`CancelToken::sleep`], which returns early on cancellation.

use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

/// Clonable cancellation flag; every clone observes the same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every sleeper.
    ///
    /// Returns `true` for the call that cancelled it, `false` afterwards.
    pub fn cancel(&self) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if *cancelled {
            return false;
        }
        *cancelled = true;
        self.inner.changed.notify_all();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleeps for `period` unless cancelled first.
    ///
    /// Returns `true` if the full period elapsed, `false` if the token was
    /// (or already is) cancelled.
    pub fn sleep(&self, period: Duration) -> bool {
        !self.wait_timeout(period)
    }

    /// Blocks until cancelled.
    pub fn wait(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            self.inner.changed.wait(&mut cancelled);
        }
    }

    /// Blocks until cancelled or `timeout` elapses; returns whether cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.inner
                .changed
                .wait_for(&mut cancelled, deadline.duration_since(now));
        }
        *cancelled
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_is_one_shot() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn sleep_runs_full_period_when_not_cancelled() {
        let token = CancelToken::new();
        let start = std::time::Instant::now();
        assert!(token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleep_returns_immediately_once_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let start = std::time::Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_interrupts_sleeper() {
        let token = CancelToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || token.sleep(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(!sleeper.join().unwrap());
    }

    #[test]
    fn wait_returns_after_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait())
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        waiter.join().unwrap();
        assert!(!CancelToken::new().wait_timeout(Duration::from_millis(5)));
    }
}
