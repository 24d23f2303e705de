//! Advisory validation of handler outputs against a declared transition table.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use cascade_engine::{
    ContextId, EmitHook, EventKey, Extension, HandlerContext, Hooks, WorkflowEvent,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// One declared transition: a handler bound to `inputs` may emit any of `outputs`.
#[derive(Debug, Clone)]
struct Edge {
    inputs: Vec<EventKey>,
    outputs: Vec<EventKey>,
}

/// An emitted event no declared edge permits.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub run_id: Uuid,
    pub handler: String,
    pub context: ContextId,
    pub input_types: Vec<String>,
    pub output_type: String,
    pub payload: String,
    pub detected_at: DateTime<Utc>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` on [{}] emitted undeclared {} ({})",
            self.handler,
            self.input_types.join(", "),
            self.output_type,
            self.payload
        )
    }
}

/// Transition table checked on every emit.
///
/// Events produced by a handler invocation conform when some edge with the
/// invocation's exact input tuple lists the event's type. Anything else is
/// recorded as a [`Diagnostic`] and logged, and is still delivered. Events
/// sent by the root context are never checked.
#[derive(Clone, Default)]
pub struct GraphValidator {
    edges: Vec<Edge>,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl GraphValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(mut self, inputs: &[EventKey], outputs: &[EventKey]) -> Self {
        self.edges.push(Edge {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        self
    }

    /// Diagnostics recorded so far, across every run this validator is installed in.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn permits(&self, inputs: &[EventKey], output: EventKey) -> bool {
        self.edges
            .iter()
            .any(|edge| edge.inputs == inputs && edge.outputs.contains(&output))
    }
}

impl Extension for GraphValidator {
    fn install(&self, hooks: &mut Hooks) {
        hooks.add_emit(Arc::new(self.clone()));
    }
}

impl EmitHook for GraphValidator {
    fn on_emit(&self, event: &WorkflowEvent, producer: &HandlerContext) {
        if producer.is_root() {
            return;
        }
        let inputs = producer.input_types();
        if self.permits(&inputs, event.key()) {
            return;
        }

        let diagnostic = Diagnostic {
            run_id: producer.run_id(),
            handler: producer.handler_name(),
            context: producer.id(),
            input_types: inputs.iter().map(ToString::to_string).collect(),
            output_type: event.key().to_string(),
            payload: event.payload_debug(),
            detected_at: Utc::now(),
        };
        warn!(
            run_id = %diagnostic.run_id,
            handler = diagnostic.handler.as_str(),
            context = %diagnostic.context,
            output = diagnostic.output_type.as_str(),
            payload = diagnostic.payload.as_str(),
            "invalid output detected"
        );
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_engine::EventType;

    #[test]
    fn edges_match_the_exact_input_tuple() {
        let a = EventType::<()>::labeled("a");
        let b = EventType::<()>::labeled("b");
        let out = EventType::<()>::labeled("out");

        let validator = GraphValidator::new().edge(&[a.key(), b.key()], &[out.key()]);
        assert!(validator.permits(&[a.key(), b.key()], out.key()));
        assert!(!validator.permits(&[b.key(), a.key()], out.key()));
        assert!(!validator.permits(&[a.key()], out.key()));
        assert!(!validator.permits(&[a.key(), b.key()], a.key()));
    }
}
