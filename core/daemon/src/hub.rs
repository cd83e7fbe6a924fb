//! Fan-out of live events to dashboard observers.
//!
//! Publishing snapshots the observer list, delivers to each member outside the
//! list lock, then purges the members whose delivery failed. One broken
//! observer therefore never prevents the others from receiving the event.
//! Sinks are expected to bound their own writes (socket write timeouts).

use penlab_protocol::{LiveEvent, PenState};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to send event: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ObserverSink: Send {
    fn deliver(&mut self, event: &LiveEvent) -> Result<(), DeliveryError>;
}

/// Writes each event as one JSON line.
pub struct JsonLineSink<W> {
    writer: W,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> ObserverSink for JsonLineSink<W> {
    fn deliver(&mut self, event: &LiveEvent) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

type SharedSink = Arc<Mutex<Box<dyn ObserverSink>>>;

struct Subscriber {
    id: ObserverId,
    sink: SharedSink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub purged: usize,
}

#[derive(Default)]
pub struct BroadcastHub {
    observers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the welcome event carrying `pen_state`, then adds the observer.
    /// An observer that cannot take the welcome is never added.
    pub fn register(
        &self,
        mut sink: Box<dyn ObserverSink>,
        pen_state: PenState,
    ) -> Result<ObserverId, DeliveryError> {
        sink.deliver(&LiveEvent::welcome(pen_state))?;

        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.push(Subscriber {
            id,
            sink: Arc::new(Mutex::new(sink)),
        });
        debug!(observer = %id, observers = observers.len(), "Observer registered");
        Ok(id)
    }

    /// Returns false when the observer was already gone (e.g. purged).
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|subscriber| subscriber.id != id);
        let removed = observers.len() != before;
        if removed {
            debug!(observer = %id, observers = observers.len(), "Observer unregistered");
        }
        removed
    }

    pub fn publish(&self, event: &LiveEvent) -> PublishReport {
        let snapshot: Vec<(ObserverId, SharedSink)> = {
            let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers
                .iter()
                .map(|subscriber| (subscriber.id, Arc::clone(&subscriber.sink)))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, sink) in &snapshot {
            let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = sink.deliver(event) {
                warn!(
                    observer = %id,
                    event_type = event.kind(),
                    error = %err,
                    "Dropping observer after failed delivery"
                );
                failed.push(*id);
            }
        }

        if !failed.is_empty() {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|subscriber| !failed.contains(&subscriber.id));
        }

        PublishReport {
            delivered: snapshot.len() - failed.len(),
            purged: failed.len(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    fn contains(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|subscriber| subscriber.id == id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records delivered events; can be switched to fail.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<LiveEvent>>>,
        pub broken: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<LiveEvent> {
            self.events.lock().expect("events lock").clone()
        }

        pub fn break_pipe(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl ObserverSink for RecordingSink {
        fn deliver(&mut self, event: &LiveEvent) -> Result<(), DeliveryError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DeliveryError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "observer went away",
                )));
            }
            self.events.lock().expect("events lock").push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    fn pen_event() -> LiveEvent {
        LiveEvent::PenState {
            state: PenState::Online,
        }
    }

    #[test]
    fn register_sends_welcome_with_current_state() {
        let hub = BroadcastHub::new();
        let sink = RecordingSink::default();
        hub.register(Box::new(sink.clone()), PenState::Connected)
            .expect("register");

        assert_eq!(sink.events(), vec![LiveEvent::welcome(PenState::Connected)]);
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn register_rejects_observer_that_fails_welcome() {
        let hub = BroadcastHub::new();
        let sink = RecordingSink::default();
        sink.break_pipe();
        assert!(hub.register(Box::new(sink), PenState::Offline).is_err());
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn publish_reaches_every_observer() {
        let hub = BroadcastHub::new();
        let sinks: Vec<RecordingSink> = (0..4).map(|_| RecordingSink::default()).collect();
        for sink in &sinks {
            hub.register(Box::new(sink.clone()), PenState::Offline)
                .expect("register");
        }

        let report = hub.publish(&pen_event());
        assert_eq!(report, PublishReport { delivered: 4, purged: 0 });
        for sink in &sinks {
            assert_eq!(sink.events().last(), Some(&pen_event()));
        }
    }

    #[test]
    fn failed_observer_is_purged_after_pass_and_others_still_receive() {
        let hub = BroadcastHub::new();
        let sinks: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        let ids: Vec<ObserverId> = sinks
            .iter()
            .map(|sink| {
                hub.register(Box::new(sink.clone()), PenState::Offline)
                    .expect("register")
            })
            .collect();

        sinks[0].break_pipe();
        let report = hub.publish(&pen_event());

        assert_eq!(report, PublishReport { delivered: 2, purged: 1 });
        assert!(!hub.contains(ids[0]));
        assert!(hub.contains(ids[1]));
        assert!(hub.contains(ids[2]));
        assert_eq!(sinks[1].events().len(), 2);
        assert_eq!(sinks[2].events().len(), 2);
        assert_eq!(hub.observer_count(), 2);
    }

    #[test]
    fn unregister_removes_observer_once() {
        let hub = BroadcastHub::new();
        let sink = RecordingSink::default();
        let id = hub
            .register(Box::new(sink.clone()), PenState::Offline)
            .expect("register");

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        hub.publish(&pen_event());
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn json_line_sink_writes_one_line_per_event() {
        let mut sink = JsonLineSink::new(Vec::new());
        sink.deliver(&pen_event()).expect("deliver");
        sink.deliver(&LiveEvent::welcome(PenState::Offline))
            .expect("deliver");

        let text = String::from_utf8(sink.writer).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"type":"pen_state","state":"online"}"#);
    }
}
