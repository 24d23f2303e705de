//! Cooperative cancellation, one controller per invocation.
//!
//! Nothing here stops a running future. Handlers observe their signal and
//! return early; the engine never propagates an abort up or down the tree.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::error::WorkflowError;

#[derive(Default)]
struct AbortState {
    reason: Mutex<Option<Arc<anyhow::Error>>>,
    notify: Notify,
}

/// Owner side of a cancellation signal.
#[derive(Clone, Default)]
pub struct AbortController {
    state: Arc<AbortState>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Abort with `reason`. The first reason wins; later aborts are ignored.
    pub fn abort(&self, reason: anyhow::Error) {
        self.abort_shared(Arc::new(reason));
    }

    pub(crate) fn abort_shared(&self, reason: Arc<anyhow::Error>) {
        {
            let mut slot = self
                .state
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.state.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal().is_aborted()
    }
}

/// Read side of a cancellation signal.
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<Arc<anyhow::Error>> {
        self.state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `Err(WorkflowError::Aborted)` once aborted. Handy with `?` in handlers.
    pub fn check(&self) -> Result<(), WorkflowError> {
        match self.reason() {
            Some(reason) => Err(WorkflowError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolves once the controller is aborted, with the reason.
    pub async fn aborted(&self) -> Arc<anyhow::Error> {
        loop {
            let notified = self.state.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}
