//! Errors surfaced by runs, streams and the registry.

use std::sync::Arc;

use thiserror::Error;

use crate::context::ContextId;

#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("handler registration requires at least one event type")]
    EmptyRegistration,

    #[error("handler `{handler}` failed in context {context}: {reason}")]
    HandlerFailed {
        handler: String,
        context: ContextId,
        reason: Arc<anyhow::Error>,
    },

    #[error("invocation aborted: {0}")]
    Aborted(Arc<anyhow::Error>),

    #[error("event stream ended before a terminal event was observed")]
    StreamEnded,
}
