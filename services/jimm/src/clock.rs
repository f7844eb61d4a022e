//! Injectable time source.
//!
//! All production code reads wall-clock time and sleeps through this
//! capability so tests can drive lease renewal and retry loops
//! deterministically.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;

    /// Completes once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for tests.
///
/// Sleepers wake when `advance` moves the clock past their deadline.
pub struct TestClock {
    inner: Arc<TestClockInner>,
}

struct TestClockInner {
    now: Mutex<SystemTime>,
    tick: Notify,
}

impl TestClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            inner: Arc::new(TestClockInner {
                now: Mutex::new(start),
                tick: Notify::new(),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        {
            let mut now = self.inner.now.lock().expect("clock lock");
            *now += by;
        }
        self.inner.tick.notify_waiters();
    }
}

impl Clone for TestClock {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Clock for TestClock {
    fn now(&self) -> SystemTime {
        *self.inner.now.lock().expect("clock lock")
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let deadline = *inner.now.lock().expect("clock lock") + duration;
            loop {
                let notified = inner.tick.notified();
                if *inner.now.lock().expect("clock lock") >= deadline {
                    return;
                }
                notified.await;
            }
        })
    }
}
