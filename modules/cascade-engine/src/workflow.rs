//! Workflow definitions: the handler registry plus workflow-wide middleware.

use std::sync::Arc;

use cascade_events::EventKey;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::handler::Handler;
use crate::middleware::{DispatchHook, EmitHook, Extension, Hooks};
use crate::run::Run;

/// A required tuple of event types and the handlers bound to it.
pub(crate) struct Registration {
    pub types: Arc<[EventKey]>,
    pub handlers: Vec<Handler>,
}

pub(crate) struct WorkflowInner {
    pub registrations: Vec<Registration>,
    pub hooks: Hooks,
    pub extensions: Vec<Arc<dyn Extension>>,
    pub config: EngineConfig,
}

/// Returned by [`WorkflowBuilder::handle`].
#[derive(Debug, Clone)]
pub struct HandlerRef {
    types: Arc<[EventKey]>,
    handler: Handler,
}

impl HandlerRef {
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn types(&self) -> &[EventKey] {
        &self.types
    }
}

/// Append-only registry. Freeze it with [`build`](Self::build).
#[derive(Default)]
pub struct WorkflowBuilder {
    registrations: Vec<Registration>,
    hooks: Hooks,
    extensions: Vec<Arc<dyn Extension>>,
    config: EngineConfig,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind `handler` to the tuple `types`.
    ///
    /// Handlers bound to an identical tuple (same types, same order) share
    /// one registration: a single match launches all of them on the same
    /// inputs. Registrations are matched in the order their tuple was first
    /// seen.
    pub fn handle(
        &mut self,
        types: &[EventKey],
        handler: Handler,
    ) -> Result<HandlerRef, WorkflowError> {
        if types.is_empty() {
            return Err(WorkflowError::EmptyRegistration);
        }

        let registration = match self
            .registrations
            .iter()
            .position(|r| &*r.types == types)
        {
            Some(index) => &mut self.registrations[index],
            None => {
                self.registrations.push(Registration {
                    types: Arc::from(types),
                    handlers: Vec::new(),
                });
                let last = self.registrations.len() - 1;
                &mut self.registrations[last]
            }
        };

        debug!(
            handler = handler.name(),
            types = ?registration.types,
            "handler registered"
        );
        registration.handlers.push(handler.clone());

        Ok(HandlerRef {
            types: Arc::clone(&registration.types),
            handler,
        })
    }

    /// Install `extension` into every run created from this workflow.
    pub fn extension(&mut self, extension: impl Extension + 'static) -> &mut Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn dispatch_hook(&mut self, hook: Arc<dyn DispatchHook>) -> &mut Self {
        self.hooks.add_dispatch(hook);
        self
    }

    pub fn emit_hook(&mut self, hook: Arc<dyn EmitHook>) -> &mut Self {
        self.hooks.add_emit(hook);
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            inner: Arc::new(WorkflowInner {
                registrations: self.registrations,
                hooks: self.hooks,
                extensions: self.extensions,
                config: self.config,
            }),
        }
    }
}

/// An immutable workflow definition. Cheap to clone; every
/// [`create_run`](Self::create_run) starts from a clean slate.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn create_run(&self) -> Run {
        Run::start(Arc::clone(&self.inner))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of distinct required-type tuples.
    pub fn registration_count(&self) -> usize {
        self.inner.registrations.len()
    }
}
