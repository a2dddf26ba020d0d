use crate::monitor::Alert;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by agent components for coordination and observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    ContextChanged {
        application: String,
        title: String,
    },
    DecisionMade {
        action: String,
    },
    ActionExecuted {
        action: String,
        next_interval_secs: u64,
    },
    BehaviorChanged {
        behavior: String,
        entity_id: i64,
    },
    SystemAlert(Alert),
    ModeSwitched {
        mode: String,
    },
    PermissionRequested {
        agent_id: String,
        scope: String,
        action: String,
    },
}

pub type EventSender = broadcast::Sender<AgentEvent>;
pub type EventReceiver = broadcast::Receiver<AgentEvent>;

/// Create a broadcast event bus with the given capacity.
pub fn event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::AlertSeverity;

    #[test]
    fn event_bus_creation() {
        let (tx, _rx) = event_bus(16);
        assert_eq!(tx.receiver_count(), 1);
    }

    #[tokio::test]
    async fn event_bus_send_receive() {
        let (tx, mut rx) = event_bus(16);

        tx.send(AgentEvent::DecisionMade {
            action: "observe_and_wait".to_string(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            AgentEvent::DecisionMade { action } => assert_eq!(action, "observe_and_wait"),
            _ => panic!("expected DecisionMade event"),
        }
    }

    #[tokio::test]
    async fn event_bus_multiple_receivers() {
        let (tx, mut rx1) = event_bus(16);
        let mut rx2 = tx.subscribe();

        tx.send(AgentEvent::ModeSwitched {
            mode: "interactive".to_string(),
        })
        .unwrap();

        assert!(matches!(
            rx1.recv().await.unwrap(),
            AgentEvent::ModeSwitched { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            AgentEvent::ModeSwitched { .. }
        ));
    }

    #[test]
    fn alert_event_serde_round_trip() {
        let event = AgentEvent::SystemAlert(Alert {
            severity: AlertSeverity::Critical,
            alert_type: "memory".to_string(),
            message: "memory pressure critical: 93.0%".to_string(),
            details: serde_json::json!({"usage_pct": 93.0}),
            timestamp: "2026-03-01T12:00:00Z".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();
        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            AgentEvent::SystemAlert(alert) => {
                assert_eq!(alert.alert_type, "memory");
                assert_eq!(alert.severity, AlertSeverity::Critical);
            }
            _ => panic!("expected SystemAlert"),
        }
    }
}
