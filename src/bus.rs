//! Control-bus abstraction.
//!
//! The engine talks to the capture hardware through a named publish/subscribe
//! session: every physical signal, hardware knob and status indicator is one
//! named remote value. The concrete wire protocol is a deployment concern, so
//! this module only defines the [`ControlBus`] trait plus the value types that
//! cross it, and a [`mock::MockBus`] used by the test suite (and by the
//! `serve` subcommand until a site links a real client).
//!
//! Delivery rules implementations must honor:
//!
//! - `monitor` updates arrive in delivery order; a disconnect is reported as
//!   [`BusUpdate::Disconnected`], never as a channel error. Unexpected
//!   delivery failures must be logged by the implementation and collapsed to
//!   `Disconnected` so consumers never observe a fault.
//! - `put_all` writes are best-effort acknowledged as one batch.
//! - `post` publishes a served (engine-owned) value for external observers
//!   and never blocks the caller.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineResult;

/// One value carried over the control bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Enumerated choice; decoded to its string label when cached.
    Enum { index: u32, choices: Vec<String> },
}

impl BusValue {
    /// Build an enumerated value from an index and its choice labels.
    pub fn enumeration(index: u32, choices: &[&str]) -> Self {
        BusValue::Enum {
            index,
            choices: choices.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// The string form, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The selected choice label, if this is an enumerated value.
    pub fn label(&self) -> Option<&str> {
        match self {
            BusValue::Enum { index, choices } => choices.get(*index as usize).map(String::as_str),
            _ => None,
        }
    }

    /// JSON form used when snapshotting values into the run header.
    /// Enumerated values collapse to their label.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BusValue::Int(v) => serde_json::Value::from(*v),
            BusValue::Float(v) => serde_json::Value::from(*v),
            BusValue::Str(s) => serde_json::Value::from(s.as_str()),
            BusValue::Enum { .. } => serde_json::Value::from(self.label().unwrap_or("")),
        }
    }
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        BusValue::Int(v)
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Float(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Str(v.to_string())
    }
}

/// One delivery on a monitored value.
#[derive(Debug, Clone, PartialEq)]
pub enum BusUpdate {
    Value(BusValue),
    Disconnected,
}

/// A publish/subscribe session with the control system.
#[async_trait]
pub trait ControlBus: Send + Sync + 'static {
    /// Begin monitoring a named value. Updates are delivered until the
    /// receiver is dropped.
    fn monitor(&self, name: &str) -> mpsc::Receiver<BusUpdate>;

    /// Write one named value.
    async fn put(&self, name: &str, value: BusValue) -> EngineResult<()>;

    /// Write a batch of named values, acknowledged together.
    async fn put_all(&self, writes: Vec<(String, BusValue)>) -> EngineResult<()>;

    /// Publish a served value owned by this process.
    fn post(&self, name: &str, value: BusValue);

    /// Serve a writable enumerated control input. Operator writes arrive on
    /// the returned channel as choice indices.
    fn control(&self, name: &str, choices: &[&str]) -> mpsc::Receiver<u32>;
}

pub mod mock {
    //! In-process bus for tests, after the mock-hardware pattern used for
    //! driver testing: the test plays the role of the control system by
    //! connecting, updating and disconnecting named values, and inspects
    //! everything the engine wrote or published.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tracing::debug;

    use super::{BusUpdate, BusValue, ControlBus};
    use crate::error::EngineResult;

    #[derive(Default)]
    struct MockState {
        values: HashMap<String, BusValue>,
        monitors: HashMap<String, Vec<mpsc::Sender<BusUpdate>>>,
        controls: HashMap<String, mpsc::Sender<u32>>,
        puts: Vec<(String, BusValue)>,
        posted: HashMap<String, Vec<BusValue>>,
    }

    /// Loopback [`ControlBus`] holding all state in memory.
    ///
    /// `put` behaves like real hardware acknowledging a write: the value is
    /// recorded, stored, and echoed to monitors of the same name.
    #[derive(Default)]
    pub struct MockBus {
        state: Mutex<MockState>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Connect a value, delivering it to all monitors of the name.
        pub fn connect(&self, name: &str, value: impl Into<BusValue>) {
            let value = value.into();
            let mut state = self.lock();
            state.values.insert(name.to_string(), value.clone());
            fan_out(&mut state, name, BusUpdate::Value(value));
        }

        /// Drop a value, delivering a disconnect to all monitors.
        pub fn disconnect(&self, name: &str) {
            let mut state = self.lock();
            state.values.remove(name);
            fan_out(&mut state, name, BusUpdate::Disconnected);
        }

        /// Deliver an operator write to a served control input.
        /// Returns false if nothing serves the name.
        pub fn write_control(&self, name: &str, index: u32) -> bool {
            let state = self.lock();
            match state.controls.get(name) {
                Some(tx) => tx.try_send(index).is_ok(),
                None => false,
            }
        }

        /// Names with at least one active monitor.
        pub fn monitored_names(&self) -> Vec<String> {
            self.lock().monitors.keys().cloned().collect()
        }

        /// Every write issued through `put`/`put_all`, in order.
        pub fn puts(&self) -> Vec<(String, BusValue)> {
            self.lock().puts.clone()
        }

        /// The most recent write to one name, if any.
        pub fn last_put(&self, name: &str) -> Option<BusValue> {
            self.lock()
                .puts
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        }

        /// The most recent served value published under one name.
        pub fn posted(&self, name: &str) -> Option<BusValue> {
            self.lock()
                .posted
                .get(name)
                .and_then(|history| history.last().cloned())
        }

        /// How many times one served value has been published.
        pub fn posted_count(&self, name: &str) -> usize {
            self.lock().posted.get(name).map_or(0, Vec::len)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }

    fn fan_out(state: &mut MockState, name: &str, update: BusUpdate) {
        if let Some(senders) = state.monitors.get_mut(name) {
            senders.retain(|tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("mock bus monitor backlog on {name}");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    #[async_trait]
    impl ControlBus for MockBus {
        fn monitor(&self, name: &str) -> mpsc::Receiver<BusUpdate> {
            let (tx, rx) = mpsc::channel(256);
            let mut state = self.lock();
            if let Some(value) = state.values.get(name).cloned() {
                let _ = tx.try_send(BusUpdate::Value(value));
            }
            state.monitors.entry(name.to_string()).or_default().push(tx);
            rx
        }

        async fn put(&self, name: &str, value: BusValue) -> EngineResult<()> {
            let mut state = self.lock();
            state.puts.push((name.to_string(), value.clone()));
            state.values.insert(name.to_string(), value.clone());
            fan_out(&mut state, name, BusUpdate::Value(value));
            Ok(())
        }

        async fn put_all(&self, writes: Vec<(String, BusValue)>) -> EngineResult<()> {
            for (name, value) in writes {
                self.put(&name, value).await?;
            }
            Ok(())
        }

        fn post(&self, name: &str, value: BusValue) {
            self.lock()
                .posted
                .entry(name.to_string())
                .or_default()
                .push(value);
        }

        fn control(&self, name: &str, _choices: &[&str]) -> mpsc::Receiver<u32> {
            let (tx, rx) = mpsc::channel(16);
            self.lock().controls.insert(name.to_string(), tx);
            rx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_collapses_to_label_in_json() {
        let v = BusValue::enumeration(1, &["Stop", "Run", "Abort"]);
        assert_eq!(v.label(), Some("Run"));
        assert_eq!(v.to_json(), serde_json::json!("Run"));
    }

    #[tokio::test]
    async fn mock_bus_echoes_puts_to_monitors() {
        let bus = mock::MockBus::new();
        let mut rx = bus.monitor("X:enable");
        bus.put("X:enable", BusValue::Int(1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(BusUpdate::Value(BusValue::Int(1))));
        assert_eq!(bus.last_put("X:enable"), Some(BusValue::Int(1)));
    }

    #[tokio::test]
    async fn mock_bus_delivers_current_value_on_subscribe() {
        let bus = mock::MockBus::new();
        bus.connect("X:rate", 250_000.0);
        let mut rx = bus.monitor("X:rate");
        assert_eq!(
            rx.recv().await,
            Some(BusUpdate::Value(BusValue::Float(250_000.0)))
        );
    }
}
