use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use ds_core::JobEvent;

// ---------------------------------------------------------------------------
// BusSignal
// ---------------------------------------------------------------------------

/// One notification delivered to subscribers.
///
/// `event` is present for locally published events and for full backplane
/// deliveries; a wakeup-only signal carries just `(job_id, seq)` and the
/// subscriber backfills the payload from the event store.
#[derive(Debug, Clone)]
pub struct BusSignal {
    pub job_id: Uuid,
    pub seq: u64,
    pub event: Option<Arc<JobEvent>>,
}

impl BusSignal {
    pub fn full(event: Arc<JobEvent>) -> Self {
        Self {
            job_id: event.job_id,
            seq: event.seq,
            event: Some(event),
        }
    }

    pub fn wakeup(job_id: Uuid, seq: u64) -> Self {
        Self {
            job_id,
            seq,
            event: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style per-job event bus built on top of flume channels.
///
/// Each call to [`subscribe`] creates a new receiver that will receive all
/// signals for its job published after the subscription was created. The bus
/// is thread-safe and can be cloned cheaply (it wraps its internals in an
/// `Arc`). Delivery is best-effort; correctness never depends on the bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<Uuid, Vec<flume::Sender<BusSignal>>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one job and return its receiving end.
    pub fn subscribe(&self, job_id: Uuid) -> flume::Receiver<BusSignal> {
        let (tx, rx) = flume::unbounded();
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.entry(job_id).or_default().push(tx);
        rx
    }

    /// Publish a signal to all current subscribers of its job.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// pruned; jobs with no remaining subscribers are removed from the map.
    pub fn publish(&self, signal: BusSignal) {
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        if let Some(senders) = subs.get_mut(&signal.job_id) {
            senders.retain(|tx| tx.send(signal.clone()).is_ok());
            if senders.is_empty() {
                subs.remove(&signal.job_id);
            }
        }
    }

    /// Number of active subscribers for one job.
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        let subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.get(&job_id).map(|s| s.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ds_core::EventType;
    use serde_json::json;

    fn event(job_id: Uuid, seq: u64) -> Arc<JobEvent> {
        Arc::new(JobEvent {
            job_id,
            seq,
            card_id: None,
            event_type: EventType::CardProgress,
            payload: json!({"step": "fetching"}),
            emitted_at: Utc::now(),
        })
    }

    #[test]
    fn subscriber_receives_published_signals() {
        let bus = EventBus::new();
        let job_id = Uuid::new_v4();
        let rx = bus.subscribe(job_id);

        bus.publish(BusSignal::full(event(job_id, 1)));
        bus.publish(BusSignal::full(event(job_id, 2)));

        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn signals_are_scoped_per_job() {
        let bus = EventBus::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let rx_a = bus.subscribe(job_a);
        let rx_b = bus.subscribe(job_b);

        bus.publish(BusSignal::full(event(job_a, 1)));

        assert_eq!(rx_a.try_recv().unwrap().job_id, job_a);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let job_id = Uuid::new_v4();
        let rx = bus.subscribe(job_id);
        assert_eq!(bus.subscriber_count(job_id), 1);

        drop(rx);
        bus.publish(BusSignal::wakeup(job_id, 3));
        assert_eq!(bus.subscriber_count(job_id), 0);
    }

    #[test]
    fn wakeup_signal_has_no_payload() {
        let bus = EventBus::new();
        let job_id = Uuid::new_v4();
        let rx = bus.subscribe(job_id);
        bus.publish(BusSignal::wakeup(job_id, 9));
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.seq, 9);
        assert!(signal.event.is_none());
    }
}
