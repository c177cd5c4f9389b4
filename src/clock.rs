//! Injected clock used by the controllers.
//!
//! Tick-driven loops depend on this trait instead of the ambient clock so
//! tests can advance time deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// A source of wall-clock time and timed waits.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Completes once `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct FakeClockState {
    now: DateTime<Utc>,
    /// Total number of `sleep` calls ever registered.
    sleepers: usize,
}

/// A manually advanced clock for tests.
///
/// `sleep` futures only complete when `advance` moves the clock past their
/// deadline. `wait_for_sleepers` lets a test block until a loop under test
/// has entered its timed wait, so an `advance` cannot race past it.
#[derive(Debug, Clone)]
pub struct FakeClock {
    state: Arc<Mutex<FakeClockState>>,
    changed: Arc<Notify>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeClockState { now, sleepers: 0 })),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Moves the clock forward, waking any sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            state.now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        }
        self.changed.notify_waiters();
    }

    /// Blocks until at least `count` `sleep` calls have been registered
    /// over the lifetime of this clock.
    pub async fn wait_for_sleepers(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.state.lock().unwrap().sleepers >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().now
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = {
            let mut state = self.state.lock().unwrap();
            state.sleepers += 1;
            state.now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
        };
        self.changed.notify_waiters();

        loop {
            let notified = self.changed.notified();
            if self.state.lock().unwrap().now >= deadline {
                return;
            }
            notified.await;
        }
    }
}
