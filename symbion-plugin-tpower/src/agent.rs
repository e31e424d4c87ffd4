//! TotalPowerAgent - the single entry point shared by the MQTT listener and the
//! poll loop.
//!
//! Every unit of work follows the same shape: lock the engine, route or poll,
//! take the advertisements, unlock, publish, lock again to record outcomes.
//! The publisher never runs under the engine lock.

use crate::engine::{Advertisement, AggregationEngine, EngineStats};
use crate::metrics::{topic, MetricSample};
use crate::models::{AssetEvent, MetricMessage};
use crate::ports::Publisher;
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub type NowFn = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct TotalPowerAgent {
    engine: Mutex<AggregationEngine>,
    publisher: Arc<dyn Publisher>,
    now_fn: NowFn,
    default_ttl: i64,
    /// poked when the wake-up schedule may have moved earlier
    reschedule: Notify,
}

impl TotalPowerAgent {
    pub fn new(engine: AggregationEngine, publisher: Arc<dyn Publisher>, default_ttl: i64) -> Self {
        Self::new_with_timestamp_fn(
            engine,
            publisher,
            default_ttl,
            Box::new(|| OffsetDateTime::now_utc().unix_timestamp()),
        )
    }

    /// Same as `new` with an explicit clock (unix seconds)
    pub fn new_with_timestamp_fn(
        engine: AggregationEngine,
        publisher: Arc<dyn Publisher>,
        default_ttl: i64,
        now_fn: NowFn,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            publisher,
            now_fn,
            default_ttl,
            reschedule: Notify::new(),
        }
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    /// First topology load; a failure leaves a retry scheduled
    pub fn start(&self) -> bool {
        let now = self.now();
        self.engine.lock().configure(now)
    }

    /// Decodes and routes one bus message, returns how many totals went out
    pub fn handle_metric(&self, message: MetricMessage) -> usize {
        let topic = topic(&message.quantity, &message.name);
        match message.into_sample(self.default_ttl) {
            Ok(sample) => self.handle_sample(sample),
            Err(e) => {
                warn!("dropping {}: {}", topic, e);
                0
            }
        }
    }

    pub fn handle_sample(&self, sample: MetricSample) -> usize {
        let now = self.now();
        let advertisements = self.engine.lock().on_metric(sample, now);
        self.publish_all(advertisements)
    }

    pub fn handle_asset_event(&self, event: &AssetEvent) {
        let now = self.now();
        self.engine.lock().on_asset_event(event, now);
        self.reschedule.notify_one();
    }

    /// Resolves after an event that may bring the next poll forward
    pub async fn rescheduled(&self) {
        self.reschedule.notified().await
    }

    /// Poll tick, returns the seconds to sleep before the next one
    pub fn poll(&self) -> i64 {
        let now = self.now();
        let advertisements = self.engine.lock().on_poll(now);
        let sent = self.publish_all(advertisements);
        if sent > 0 {
            debug!("poll published {} totals", sent);
        }
        self.next_wake()
    }

    pub fn next_wake(&self) -> i64 {
        let now = self.now();
        self.engine.lock().next_wake(now)
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.lock().stats()
    }

    /// Read access to the engine for diagnostics and tests
    pub fn with_engine<T>(&self, f: impl FnOnce(&AggregationEngine) -> T) -> T {
        f(&self.engine.lock())
    }

    fn publish_all(&self, advertisements: Vec<Advertisement>) -> usize {
        if advertisements.is_empty() {
            return 0;
        }
        let outcomes: Vec<(Advertisement, bool)> = advertisements
            .into_iter()
            .map(|advertisement| {
                let ok = self.publisher.publish(&advertisement.sample);
                (advertisement, ok)
            })
            .collect();

        let now = self.now();
        let mut engine = self.engine.lock();
        for (advertisement, ok) in &outcomes {
            engine.complete(advertisement, *ok, now);
        }
        outcomes.iter().filter(|(_, ok)| *ok).count()
    }
}
