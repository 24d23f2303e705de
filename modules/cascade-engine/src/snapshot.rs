//! Serializable view of a run's causal tree, for debugging and inspection.

use cascade_events::{EventId, WorkflowEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::context::ContextId;
use crate::handler::HandlerId;
use crate::run::RunState;

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub contexts: Vec<ContextSnapshot>,
    pub queued: Vec<EventSummary>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub id: ContextId,
    pub handler: Option<String>,
    pub handler_id: Option<HandlerId>,
    pub input_types: Vec<String>,
    pub inputs: Vec<EventSummary>,
    pub outputs: Vec<EventSummary>,
    pub parent: Option<ContextId>,
    pub children: Vec<ContextId>,
    pub asynchronous: bool,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub id: EventId,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl From<&WorkflowEvent> for EventSummary {
    fn from(event: &WorkflowEvent) -> Self {
        Self {
            id: event.id(),
            event_type: event.key().to_string(),
            payload: event.payload_debug(),
            created_at: event.created_at(),
        }
    }
}

impl RunSnapshot {
    pub(crate) fn capture(run_id: Uuid, state: &RunState) -> Self {
        let contexts = state
            .contexts
            .iter()
            .enumerate()
            .map(|(index, node)| ContextSnapshot {
                id: ContextId::from_index(index),
                handler: node.handler.as_ref().map(|h| h.name.to_string()),
                handler_id: node.handler.as_ref().map(|h| h.id),
                input_types: node.input_types.iter().map(|k| k.to_string()).collect(),
                inputs: node.inputs.iter().map(EventSummary::from).collect(),
                outputs: node.outputs.iter().map(EventSummary::from).collect(),
                parent: node.parent,
                children: node.children.clone(),
                asynchronous: node.asynchronous,
                aborted: node.abort.as_ref().is_some_and(|a| a.is_aborted()),
            })
            .collect();

        Self {
            run_id,
            taken_at: Utc::now(),
            contexts,
            queued: state.queue.iter().map(EventSummary::from).collect(),
            failure: state.failure.as_ref().map(|f| f.to_string()),
        }
    }

    /// Number of handler invocations (the root is not counted).
    pub fn invocation_count(&self) -> usize {
        self.contexts.len().saturating_sub(1)
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}
