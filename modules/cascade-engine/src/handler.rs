//! Handler values and their outputs.
//!
//! A handler receives its invocation context explicitly plus the inputs the
//! matcher selected, and either answers immediately or hands back a future.
//! The engine classifies sync vs async by the returned [`HandlerOutput`],
//! never by the shape of the function.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cascade_events::WorkflowEvent;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::context::HandlerContext;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a handler. Clones of a [`Handler`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandlerId(u64);

impl HandlerId {
    fn allocate() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// What a handler hands back to the engine.
pub enum HandlerOutput {
    /// Settled immediately. `Some` is enqueued as if the handler emitted it.
    Ready(Option<WorkflowEvent>),
    /// Settles later. The matching pass does not wait for it.
    Pending(BoxFuture<'static, Result<Option<WorkflowEvent>>>),
}

impl HandlerOutput {
    pub fn none() -> Self {
        HandlerOutput::Ready(None)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, HandlerOutput::Pending(_))
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutput::Ready(event) => f.debug_tuple("Ready").field(event).finish(),
            HandlerOutput::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

type HandlerFn =
    dyn Fn(HandlerContext, Vec<WorkflowEvent>) -> Result<HandlerOutput> + Send + Sync;

/// A registered unit of work.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    name: Arc<str>,
    f: Arc<HandlerFn>,
}

impl Handler {
    /// Lowest-level constructor: the closure decides sync vs async itself.
    pub fn raw<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(HandlerContext, Vec<WorkflowEvent>) -> Result<HandlerOutput> + Send + Sync + 'static,
    {
        Self {
            id: HandlerId::allocate(),
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// A synchronous handler.
    pub fn new<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(HandlerContext, Vec<WorkflowEvent>) -> Result<Option<WorkflowEvent>>
            + Send
            + Sync
            + 'static,
    {
        Self::raw(name, move |ctx, inputs| f(ctx, inputs).map(HandlerOutput::Ready))
    }

    /// An asynchronous handler. Each call produces a future the engine spawns.
    pub fn from_async<F, Fut>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(HandlerContext, Vec<WorkflowEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<WorkflowEvent>>> + Send + 'static,
    {
        Self::raw(name, move |ctx, inputs| {
            Ok(HandlerOutput::Pending(Box::pin(f(ctx, inputs))))
        })
    }

    /// Adapt a struct implementing [`EventHandler`].
    pub fn from_handler<H: EventHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        let name = handler.name().to_string();
        Self::raw(name, move |ctx, inputs| {
            let handler = Arc::clone(&handler);
            Ok(HandlerOutput::Pending(Box::pin(async move {
                handler.handle(ctx, inputs).await
            })))
        })
    }

    /// Same identity and name, different body. Used by middleware that wraps
    /// a dispatch without changing which handler it is attributed to.
    pub fn with_body<F>(&self, f: F) -> Handler
    where
        F: Fn(HandlerContext, Vec<WorkflowEvent>) -> Result<HandlerOutput> + Send + Sync + 'static,
    {
        Handler {
            id: self.id,
            name: Arc::clone(&self.name),
            f: Arc::new(f),
        }
    }

    pub fn call(&self, ctx: HandlerContext, inputs: Vec<WorkflowEvent>) -> Result<HandlerOutput> {
        (self.f)(ctx, inputs)
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Struct-shaped handlers. Always asynchronous.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(
        &self,
        ctx: HandlerContext,
        inputs: Vec<WorkflowEvent>,
    ) -> Result<Option<WorkflowEvent>>;
}
