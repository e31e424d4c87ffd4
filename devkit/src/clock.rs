/*!
Manual clock for plugins taking an injectable `now` (unix seconds)
*/

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Shared, test-controlled time source
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(start)) }
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves time forward and returns the new time
    pub fn advance(&self, secs: i64) -> i64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }

    /// Boxed reader for plugins built with a `now_fn`
    pub fn as_fn(&self) -> Box<dyn Fn() -> i64 + Send + Sync> {
        let now = self.now.clone();
        Box::new(move || now.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}
