//! Engine event types broadcast on the Stepwell event bus.
//!
//! `EngineEvent` is the unified change-notification type published during
//! run execution. Consumers (API layer, logging, dashboards) subscribe
//! instead of polling run rows. All variants are Clone + Send + Sync for
//! use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new run was created and started.
    RunStarted {
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
    },

    /// The run advanced past a node.
    RunAdvanced {
        run_id: Uuid,
        node_key: String,
        step_index: u32,
    },

    /// The run suspended on a delay timer.
    RunAwaitingTimer {
        run_id: Uuid,
        node_key: String,
        expires_at: DateTime<Utc>,
    },

    /// The run suspended waiting for an external signal.
    RunAwaitingSignal {
        run_id: Uuid,
        node_key: String,
        signal_type: String,
    },

    /// A retryable failure occurred; the run will be re-attempted.
    RunRetrying {
        run_id: Uuid,
        node_key: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },

    /// The run reached the end of its graph.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        steps_completed: u32,
    },

    /// The run failed permanently.
    RunFailed {
        run_id: Uuid,
        node_key: Option<String>,
        error: String,
    },

    /// An operator cancelled the run.
    RunCancelled { run_id: Uuid, reason: String },

    /// A run was quarantined into the dead-letter queue.
    DeadLetterCreated {
        dead_letter_id: Uuid,
        run_id: Uuid,
        node_key: String,
        can_retry: bool,
    },

    /// A suggest-only workflow materialized an action for human review.
    SuggestionPending {
        run_id: Uuid,
        node_key: String,
        capability: String,
    },

    /// A signal was matched to a waiting run.
    SignalDelivered {
        run_id: Uuid,
        signal_type: String,
    },

    /// A signal arrived for a run that was not waiting for it (dropped).
    SignalIgnored {
        run_id: Uuid,
        signal_type: String,
    },
}

impl EngineEvent {
    /// The run this event concerns.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::RunAdvanced { run_id, .. }
            | EngineEvent::RunAwaitingTimer { run_id, .. }
            | EngineEvent::RunAwaitingSignal { run_id, .. }
            | EngineEvent::RunRetrying { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::RunCancelled { run_id, .. }
            | EngineEvent::DeadLetterCreated { run_id, .. }
            | EngineEvent::SuggestionPending { run_id, .. }
            | EngineEvent::SignalDelivered { run_id, .. }
            | EngineEvent::SignalIgnored { run_id, .. } => *run_id,
        }
    }

    /// Whether this event marks a terminal transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::RunCompleted { .. }
                | EngineEvent::RunFailed { .. }
                | EngineEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_started_serde() {
        let event = EngineEvent::RunStarted {
            run_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "lead-follow-up".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_started\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::RunStarted { .. }));
    }

    #[test]
    fn test_run_retrying_serde() {
        let event = EngineEvent::RunRetrying {
            run_id: Uuid::now_v7(),
            node_key: "send-dm".to_string(),
            attempt: 2,
            next_retry_at: Utc::now(),
            error: "rate limited".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_retrying\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::RunRetrying { attempt: 2, .. }));
    }

    #[test]
    fn test_run_id_accessor() {
        let id = Uuid::now_v7();
        let event = EngineEvent::SignalIgnored {
            run_id: id,
            signal_type: "reply_received".to_string(),
        };
        assert_eq!(event.run_id(), id);
    }

    #[test]
    fn test_is_terminal() {
        let completed = EngineEvent::RunCompleted {
            run_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
            steps_completed: 4,
        };
        assert!(completed.is_terminal());

        let advanced = EngineEvent::RunAdvanced {
            run_id: Uuid::now_v7(),
            node_key: "n1".to_string(),
            step_index: 1,
        };
        assert!(!advanced.is_terminal());
    }

    #[test]
    fn test_dead_letter_created_serde() {
        let event = EngineEvent::DeadLetterCreated {
            dead_letter_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            node_key: "send-booking-link".to_string(),
            can_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"dead_letter_created\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            EngineEvent::DeadLetterCreated { can_retry: true, .. }
        ));
    }
}
