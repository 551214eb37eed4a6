//! Readiness cache over monitored remote values.
//!
//! Holds the last delivered value of every remote value the engine depends
//! on, and a single wake-all notification for "something changed". The run
//! sequencer never talks to the bus to *read*: it reads this cache, which is
//! kept current by one listener task per subscribed name.
//!
//! Semantics:
//!
//! - A disconnect is recorded as "no value", not an error. The aggregate
//!   queries ([`ReadinessCache::all_connected`],
//!   [`ReadinessCache::disconnected_names`]) therefore never fail.
//! - [`ReadinessCache::wait_for_change`] wakes *all* waiters on any update,
//!   so each waiter must recompute from scratch and may not assume which
//!   value changed. Loops that must not miss an update between recompute and
//!   suspension should use [`ReadinessCache::notified`] and enable the
//!   returned future before reading the cache.
//! - Entries live for the process lifetime; there is no unsubscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bus::{BusUpdate, BusValue, ControlBus};
use crate::error::{EngineError, EngineResult};

struct Inner {
    values: Mutex<HashMap<String, Option<BusValue>>>,
    changed: Notify,
}

/// Cached mirror of all monitored remote values.
#[derive(Clone)]
pub struct ReadinessCache {
    bus: Arc<dyn ControlBus>,
    inner: Arc<Inner>,
}

impl ReadinessCache {
    pub fn new(bus: Arc<dyn ControlBus>) -> Self {
        Self {
            bus,
            inner: Arc::new(Inner {
                values: Mutex::new(HashMap::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Begin caching a named value. Idempotent: a name already requested is
    /// left untouched (the first `signed` hint wins). The entry starts
    /// disconnected and updates asynchronously as the bus delivers data.
    pub fn subscribe_and_cache(&self, name: &str, signed: bool) {
        {
            let mut values = lock(&self.inner.values);
            if values.contains_key(name) {
                return;
            }
            values.insert(name.to_string(), None);
        }

        let mut rx = self.bus.monitor(name);
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let decoded = match update {
                    BusUpdate::Value(value) => Some(decode(value, signed)),
                    BusUpdate::Disconnected => None,
                };
                lock(&inner.values).insert(name.clone(), decoded);
                inner.changed.notify_waiters();
            }
            // Bus session ended; leave the entry disconnected.
            debug!("monitor for {name} closed");
            lock(&inner.values).insert(name.clone(), None);
            inner.changed.notify_waiters();
        });
    }

    /// Last cached value, or `None` while disconnected (or never subscribed).
    pub fn get(&self, name: &str) -> Option<BusValue> {
        lock(&self.inner.values).get(name).cloned().flatten()
    }

    /// Like [`get`](Self::get) but a disconnect is an error. Used when
    /// snapshotting the run header, where every required value must be live.
    pub fn read(&self, name: &str) -> EngineResult<BusValue> {
        self.get(name)
            .ok_or_else(|| EngineError::Disconnected(name.to_string()))
    }

    /// Snapshot one value into its JSON header form.
    pub fn read_json(&self, name: &str) -> EngineResult<serde_json::Value> {
        Ok(self.read(name)?.to_json())
    }

    /// True when every subscribed value currently holds a live value.
    pub fn all_connected(&self) -> bool {
        lock(&self.inner.values).values().all(Option::is_some)
    }

    /// Sorted names of all currently disconnected entries.
    pub fn disconnected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.values)
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }

    /// Suspend until any subscribed value changes. All waiters wake.
    pub async fn wait_for_change(&self) {
        self.inner.changed.notified().await;
    }

    /// Change-notified future for miss-free wait loops: pin and enable it,
    /// then read the cache, then await it.
    pub fn notified(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }
}

/// Normalize a delivered value into its cached form: enumerations collapse to
/// their choice label, strings are trimmed, and raw 32-bit reads with the
/// signed hint are re-interpreted as `i32`.
fn decode(value: BusValue, signed: bool) -> BusValue {
    match value {
        BusValue::Enum { .. } => BusValue::Str(value.label().unwrap_or("").to_string()),
        BusValue::Str(s) => BusValue::Str(s.trim().to_string()),
        BusValue::Int(v) if signed => BusValue::Int(i64::from(v as u32 as i32)),
        other => other,
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("cache mutex poisoned");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cache_over(bus: Arc<MockBus>) -> ReadinessCache {
        ReadinessCache::new(bus)
    }

    async fn settle() {
        // Let listener tasks drain their channels.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn caches_and_decodes_values() {
        let bus = Arc::new(MockBus::new());
        let cache = cache_over(bus.clone());
        cache.subscribe_and_cache("T:SA:READY", false);
        cache.subscribe_and_cache("T:SA:DESC", false);

        assert_eq!(cache.get("T:SA:READY"), None);

        bus.connect("T:SA:READY", BusValue::enumeration(1, &["Not Ready", "Ready"]));
        bus.connect("T:SA:DESC", "  padded  ");
        settle().await;

        assert_eq!(cache.get("T:SA:READY"), Some(BusValue::Str("Ready".into())));
        assert_eq!(cache.get("T:SA:DESC"), Some(BusValue::Str("padded".into())));
        assert!(cache.all_connected());
    }

    #[tokio::test]
    async fn disconnect_collapses_to_no_value() {
        let bus = Arc::new(MockBus::new());
        let cache = cache_over(bus.clone());
        cache.subscribe_and_cache("T:A", false);
        cache.subscribe_and_cache("T:B", false);

        bus.connect("T:A", 1i64);
        bus.connect("T:B", 2i64);
        settle().await;
        assert!(cache.all_connected());

        bus.disconnect("T:B");
        settle().await;
        assert!(!cache.all_connected());
        assert_eq!(cache.disconnected_names(), vec!["T:B".to_string()]);
        assert!(matches!(cache.read("T:B"), Err(EngineError::Disconnected(_))));
    }

    #[tokio::test]
    async fn signed_hint_sign_extends_raw_reads() {
        let bus = Arc::new(MockBus::new());
        let cache = cache_over(bus.clone());
        cache.subscribe_and_cache("T:RESPDIR.RVAL", true);
        bus.connect("T:RESPDIR.RVAL", 0xffff_ffffi64);
        settle().await;
        assert_eq!(cache.get("T:RESPDIR.RVAL"), Some(BusValue::Int(-1)));
    }

    #[tokio::test]
    async fn change_notification_wakes_all_waiters() {
        let bus = Arc::new(MockBus::new());
        let cache = cache_over(bus.clone());
        cache.subscribe_and_cache("T:A", false);

        let w1 = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_for_change().await })
        };
        let w2 = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_for_change().await })
        };
        // Let both waiters register before the update lands.
        settle().await;

        bus.connect("T:A", 1i64);
        timeout(Duration::from_secs(1), w1).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), w2).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let bus = Arc::new(MockBus::new());
        let cache = cache_over(bus.clone());
        cache.subscribe_and_cache("T:A", false);
        cache.subscribe_and_cache("T:A", false);
        bus.connect("T:A", 7i64);
        settle().await;
        assert_eq!(cache.get("T:A"), Some(BusValue::Int(7)));
        assert_eq!(cache.disconnected_names(), Vec::<String>::new());
    }
}
