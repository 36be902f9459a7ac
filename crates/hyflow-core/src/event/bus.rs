//! Run progress fan-out over `tokio::sync::broadcast`.
//!
//! The engine, the executor tasks and the transfer manager each hold a clone
//! of the run's [`EventBus`]. Observers (the CLI progress view, tests) call
//! [`EventBus::subscribe`] before the run starts. A slow observer lags and
//! loses events; it never blocks the run.

use hyflow_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to the current subscribers and return how many there
    /// were. Without subscribers the event is dropped.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn observers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("observers", &self.observers()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::execution::StepStatus;
    use tokio::sync::broadcast::error::RecvError;

    fn step_changed(step: &str) -> EngineEvent {
        EngineEvent::StepStatusChanged {
            step: step.to_string(),
            status: StepStatus::Running,
        }
    }

    #[tokio::test]
    async fn every_observer_sees_each_event() {
        let bus = EventBus::new(16);
        let mut progress = bus.subscribe();
        let mut audit = bus.clone().subscribe();

        assert_eq!(bus.publish(step_changed("align")), 2);

        for rx in [&mut progress, &mut audit] {
            match rx.recv().await.unwrap() {
                EngineEvent::StepStatusChanged { step, .. } => assert_eq!(step, "align"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn publishing_without_observers_is_dropped() {
        let bus = EventBus::default();
        assert_eq!(bus.observers(), 0);
        assert_eq!(bus.publish(step_changed("align")), 0);
    }

    #[tokio::test]
    async fn slow_observer_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for step in ["a", "b", "c", "d"] {
            bus.publish(step_changed(step));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        match rx.recv().await.unwrap() {
            EngineEvent::StepStatusChanged { step, .. } => assert_eq!(step, "c"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
