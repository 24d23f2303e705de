//! Invocation contexts: nodes of a run's causal tree.
//!
//! Nodes live in an append-only arena owned by the run and are addressed by
//! [`ContextId`]. Parent links are fixed at creation and children are only
//! ever appended. [`HandlerContext`] is the capability a handler receives:
//! it can emit, read its own cancellation signal and subscribe to its own
//! downstream events, all without ambient state.

use std::fmt;
use std::sync::Arc;

use cascade_events::{EventKey, WorkflowEvent};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::abort::{AbortController, AbortSignal};
use crate::handler::HandlerId;
use crate::run::RunShared;
use crate::stream::EventStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(usize);

impl ContextId {
    /// The synthetic root every run starts with.
    pub const ROOT: ContextId = ContextId(0);

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "ctx{}", self.0)
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HandlerMeta {
    pub id: HandlerId,
    pub name: Arc<str>,
}

/// One node of the causal tree.
pub(crate) struct ContextNode {
    pub handler: Option<HandlerMeta>,
    pub input_types: Arc<[EventKey]>,
    pub inputs: Vec<WorkflowEvent>,
    pub outputs: Vec<WorkflowEvent>,
    pub asynchronous: bool,
    pub pending: Option<JoinHandle<()>>,
    pub abort: Option<AbortController>,
    pub parent: Option<ContextId>,
    pub children: Vec<ContextId>,
}

impl ContextNode {
    pub fn root() -> Self {
        Self {
            handler: None,
            input_types: Arc::from(Vec::new()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            asynchronous: false,
            pending: None,
            abort: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn child(
        parent: ContextId,
        handler: HandlerMeta,
        input_types: Arc<[EventKey]>,
        inputs: Vec<WorkflowEvent>,
    ) -> Self {
        Self {
            handler: Some(handler),
            input_types,
            inputs,
            outputs: Vec::new(),
            asynchronous: false,
            pending: None,
            abort: None,
            parent: Some(parent),
            children: Vec::new(),
        }
    }

    pub fn handler_name(&self) -> &str {
        self.handler.as_ref().map(|h| &*h.name).unwrap_or("root")
    }
}

/// Capability handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub(crate) shared: Arc<RunShared>,
    pub(crate) id: ContextId,
}

impl HandlerContext {
    pub(crate) fn new(shared: Arc<RunShared>, id: ContextId) -> Self {
        Self { shared, id }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    /// Enqueue `event` as produced by this invocation. Re-triggers matching
    /// before returning.
    pub fn emit(&self, event: WorkflowEvent) {
        self.shared.emit(self.id, vec![event]);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = WorkflowEvent>) {
        self.shared.emit(self.id, events.into_iter().collect());
    }

    /// This invocation's cancellation signal. Creates the controller on
    /// first access; from then on a failure of this invocation aborts it
    /// instead of failing the run.
    pub fn signal(&self) -> AbortSignal {
        self.controller().signal()
    }

    pub fn controller(&self) -> AbortController {
        self.shared.controller(self.id)
    }

    /// Live view of events produced by this invocation or its descendants,
    /// from now on.
    pub fn stream(&self) -> EventStream {
        self.shared.subscribe(self.id)
    }

    pub fn parent(&self) -> Option<HandlerContext> {
        self.shared
            .read(|state| state.contexts[self.id.index()].parent)
            .map(|id| HandlerContext::new(Arc::clone(&self.shared), id))
    }

    pub fn root(&self) -> HandlerContext {
        HandlerContext::new(Arc::clone(&self.shared), ContextId::ROOT)
    }

    pub fn children(&self) -> Vec<ContextId> {
        self.shared
            .read(|state| state.contexts[self.id.index()].children.clone())
    }

    pub fn handler_id(&self) -> Option<HandlerId> {
        self.shared
            .read(|state| state.contexts[self.id.index()].handler.as_ref().map(|h| h.id))
    }

    pub fn handler_name(&self) -> String {
        self.shared
            .read(|state| state.contexts[self.id.index()].handler_name().to_string())
    }

    pub fn input_types(&self) -> Arc<[EventKey]> {
        self.shared
            .read(|state| Arc::clone(&state.contexts[self.id.index()].input_types))
    }

    pub fn inputs(&self) -> Vec<WorkflowEvent> {
        self.shared
            .read(|state| state.contexts[self.id.index()].inputs.clone())
    }

    pub fn outputs(&self) -> Vec<WorkflowEvent> {
        self.shared
            .read(|state| state.contexts[self.id.index()].outputs.clone())
    }

    pub fn is_async(&self) -> bool {
        self.shared
            .read(|state| state.contexts[self.id.index()].asynchronous)
    }

    /// True when `ancestor` is this context or lies on its parent chain.
    pub fn is_descendant_of(&self, ancestor: ContextId) -> bool {
        self.shared
            .read(|state| state.is_descendant(self.id, ancestor))
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("run_id", &self.shared.run_id)
            .field("id", &self.id)
            .finish()
    }
}
