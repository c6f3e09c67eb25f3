use std::sync::Arc;

use tracing::debug;

use ds_core::{BackplaneMode, JobEvent};

use crate::bus::{BusSignal, EventBus};

// ---------------------------------------------------------------------------
// Backplane
// ---------------------------------------------------------------------------

/// Best-effort cross-process fan-out of event signals.
///
/// Implementations bridge to a pub/sub transport (NATS, Redis, ...). The
/// backplane is never authoritative: when it is down or drops messages,
/// subscribers recover by paging the event store.
pub trait Backplane: Send + Sync {
    /// Publish a signal to remote processes. Must not block on transport
    /// failures; dropping the message is acceptable.
    fn publish(&self, event: &JobEvent);
}

/// Shape the outgoing signal according to the configured mode.
///
/// - `Full`: whole event when it serializes under `max_event_bytes`,
///   otherwise downgraded to a wakeup.
/// - `Wakeup`: `(job_id, seq)` only; receivers read from the store.
pub fn shape_signal(
    event: &JobEvent,
    mode: BackplaneMode,
    max_event_bytes: usize,
) -> Option<BusSignal> {
    match mode {
        BackplaneMode::None => None,
        BackplaneMode::Wakeup => Some(BusSignal::wakeup(event.job_id, event.seq)),
        BackplaneMode::Full => {
            let size = serde_json::to_vec(event).map(|raw| raw.len()).unwrap_or(0);
            if size > 0 && size <= max_event_bytes {
                Some(BusSignal::full(Arc::new(event.clone())))
            } else {
                debug!(
                    job_id = %event.job_id,
                    seq = event.seq,
                    size,
                    "event over backplane byte threshold, downgrading to wakeup"
                );
                Some(BusSignal::wakeup(event.job_id, event.seq))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoopbackBackplane
// ---------------------------------------------------------------------------

/// A process-local backplane that republishes shaped signals straight into a
/// target bus. Stands in for a real transport in tests and single-process
/// deployments with `BACKPLANE_MODE` set.
pub struct LoopbackBackplane {
    target: EventBus,
    mode: BackplaneMode,
    max_event_bytes: usize,
}

impl LoopbackBackplane {
    pub fn new(target: EventBus, mode: BackplaneMode, max_event_bytes: usize) -> Self {
        Self {
            target,
            mode,
            max_event_bytes,
        }
    }

    /// Build from engine configuration; `None` when the backplane is off.
    pub fn from_config(target: EventBus, config: &ds_core::EngineConfig) -> Option<Self> {
        match config.backplane_mode {
            BackplaneMode::None => None,
            mode => Some(Self::new(target, mode, config.backplane_max_event_bytes)),
        }
    }
}

impl Backplane for LoopbackBackplane {
    fn publish(&self, event: &JobEvent) {
        if let Some(signal) = shape_signal(event, self.mode, self.max_event_bytes) {
            self.target.publish(signal);
        }
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
    use uuid::Uuid;

    fn event(payload: serde_json::Value) -> JobEvent {
        JobEvent {
            job_id: Uuid::new_v4(),
            seq: 5,
            card_id: Some(1),
            event_type: EventType::CardDelta,
            payload,
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn none_mode_publishes_nothing() {
        let ev = event(json!({"delta": "hi"}));
        assert!(shape_signal(&ev, BackplaneMode::None, 1024).is_none());
    }

    #[test]
    fn wakeup_mode_strips_payload() {
        let ev = event(json!({"delta": "hi"}));
        let signal = shape_signal(&ev, BackplaneMode::Wakeup, 1024).unwrap();
        assert_eq!(signal.seq, 5);
        assert!(signal.event.is_none());
    }

    #[test]
    fn full_mode_downgrades_oversized_events() {
        let small = event(json!({"delta": "hi"}));
        let signal = shape_signal(&small, BackplaneMode::Full, 64 * 1024).unwrap();
        assert!(signal.event.is_some());

        let big = event(json!({"delta": "x".repeat(4096)}));
        let signal = shape_signal(&big, BackplaneMode::Full, 256).unwrap();
        assert!(signal.event.is_none());
    }

    #[test]
    fn from_config_respects_mode() {
        let bus = EventBus::new();
        let mut config = ds_core::EngineConfig::default();
        assert!(LoopbackBackplane::from_config(bus.clone(), &config).is_none());

        config.backplane_mode = BackplaneMode::Wakeup;
        let backplane = LoopbackBackplane::from_config(bus.clone(), &config).unwrap();
        let ev = event(json!({"delta": "hi"}));
        let rx = bus.subscribe(ev.job_id);
        backplane.publish(&ev);
        assert!(rx.try_recv().unwrap().event.is_none());
    }

    #[test]
    fn loopback_delivers_to_target_bus() {
        let bus = EventBus::new();
        let ev = event(json!({"delta": "hi"}));
        let rx = bus.subscribe(ev.job_id);

        let backplane = LoopbackBackplane::new(bus.clone(), BackplaneMode::Full, 64 * 1024);
        backplane.publish(&ev);

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.seq, 5);
        assert_eq!(signal.event.unwrap().event_type, EventType::CardDelta);
    }
}
