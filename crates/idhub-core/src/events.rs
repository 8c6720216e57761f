// Transition notifications. Publishing is synchronous and best effort: a
// failing or panicking listener is logged and skipped.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub previous_state: i32,
    pub previous_state_name: &'static str,
    pub new_state: i32,
    pub new_state_name: &'static str,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub trace_context: BTreeMap<String, String>,
}

pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, event: &TransitionEvent) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Vec<Arc<dyn TransitionListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn TransitionListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn publish(&self, event: &TransitionEvent) {
        for listener in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_transition(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    entity_type = event.entity_type,
                    entity_id = %event.entity_id,
                    "transition listener failed: {err:#}"
                ),
                Err(_) => warn!(
                    entity_type = event.entity_type,
                    entity_id = %event.entity_id,
                    "transition listener panicked"
                ),
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Forwards events to an unbounded channel for async consumers.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransitionListener for ChannelListener {
    fn on_transition(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("transition channel closed"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl TransitionListener for LoggingListener {
    fn on_transition(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        info!(
            entity_type = event.entity_type,
            entity_id = %event.entity_id,
            "{} -> {}",
            event.previous_state_name,
            event.new_state_name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Failing;

    impl TransitionListener for Failing {
        fn on_transition(&self, _event: &TransitionEvent) -> anyhow::Result<()> {
            anyhow::bail!("listener down")
        }
    }

    struct Panicking;

    impl TransitionListener for Panicking {
        fn on_transition(&self, _event: &TransitionEvent) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl TransitionListener for Recording {
        fn on_transition(&self, event: &TransitionEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.entity_id.clone());
            Ok(())
        }
    }

    fn event() -> TransitionEvent {
        TransitionEvent {
            entity_type: "HolderCredentialRequest",
            entity_id: "req-1".to_string(),
            previous_state: 100,
            previous_state_name: "CREATED",
            new_state: 200,
            new_state_name: "SUBMITTED",
            timestamp: Utc::now(),
            trace_context: BTreeMap::new(),
        }
    }

    #[test]
    fn test_failing_listeners_do_not_stop_delivery() {
        let recording = Arc::new(Recording::default());
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(recording.clone());

        bus.publish(&event());

        assert_eq!(*recording.0.lock().unwrap(), vec!["req-1".to_string()]);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::new();
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(listener));

        bus.publish(&event());

        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.new_state_name, "SUBMITTED");
    }

    #[test]
    fn test_closed_channel_is_tolerated() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(listener));
        bus.publish(&event());
    }
}
