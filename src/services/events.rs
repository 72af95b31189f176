//! Per-session event hub backing the SSE stream.
//!
//! Persistent `request_update` events mirror request-row state changes;
//! transient `agent_status` events carry fine-grained worker progress. A
//! subscriber that reconnects recovers missed state with a point-in-time
//! fetch of the request row; the hub itself keeps no history.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Request, RequestStatus};

/// Fine-grained agent progress phases, in step order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    IntentAnalyzing,
    SchemaLoading,
    LlmThinking,
    MetadataValidating,
    SqlValidating,
    ArtifactSaving,
}

impl AgentPhase {
    pub fn step(&self) -> u32 {
        match self {
            Self::IntentAnalyzing => 1,
            Self::SchemaLoading => 2,
            Self::LlmThinking => 3,
            Self::MetadataValidating => 4,
            Self::SqlValidating => 5,
            Self::ArtifactSaving => 6,
        }
    }

    pub const TOTAL_STEPS: u32 = 6;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    RequestUpdate {
        request_id: String,
        session_id: String,
        status: RequestStatus,
        has_response: bool,
        has_error: bool,
        sequence_number: i64,
    },
    AgentStatus {
        request_id: String,
        session_id: String,
        phase: AgentPhase,
        step: u32,
        total_steps: u32,
    },
}

impl SessionEvent {
    pub fn request_update(request: &Request) -> Self {
        Self::RequestUpdate {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            status: request.status_enum(),
            has_response: request.query_id.is_some(),
            has_error: request.error_json.is_some(),
            sequence_number: request.sequence_number,
        }
    }

    pub fn agent_status(request: &Request, phase: AgentPhase) -> Self {
        Self::AgentStatus {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            phase,
            step: phase.step(),
            total_steps: AgentPhase::TOTAL_STEPS,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RequestUpdate { .. } => "request_update",
            Self::AgentStatus { .. } => "agent_status",
        }
    }
}

/// Broadcast fan-out keyed by session. Senders are created lazily and pruned
/// once the last subscriber is gone.
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<SessionEvent>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self { channels: DashMap::new(), capacity }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to current subscribers. Events for sessions nobody watches are
    /// dropped; state is recoverable from the store.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let Some(sender) = self.channels.get(session_id).map(|s| s.value().clone()) else {
            return;
        };
        if sender.send(event).is_err() {
            // Last receiver disconnected
            self.channels
                .remove_if(session_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn session_count(&self) -> usize {
        self.channels.len()
    }
}
