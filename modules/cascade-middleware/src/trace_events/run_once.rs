use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cascade_engine::{Handler, HandlerContext, HandlerOutput};
use tracing::debug;

use super::Decorator;

/// Lets an opted-in handler run at most once per run and input tuple.
/// Later matches still create an invocation context, but the body is
/// skipped and nothing is emitted.
///
/// The first dispatch claims the slot, so overlapping async invocations
/// cannot both get through. A failed attempt hands the claim back.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOnce;

impl Decorator for RunOnce {
    type State = Arc<AtomicBool>;

    fn initial_state(&self) -> Arc<AtomicBool> {
        Arc::default()
    }

    fn before_handler(
        &self,
        next: Handler,
        ctx: &HandlerContext,
        claimed: &Arc<AtomicBool>,
    ) -> Handler {
        if !claimed.swap(true, Ordering::SeqCst) {
            return release_on_failure(next, Arc::clone(claimed));
        }
        debug!(
            run_id = %ctx.run_id(),
            handler = next.name(),
            context = %ctx.id(),
            "handler already ran, skipping"
        );
        next.with_body(|_, _| Ok(HandlerOutput::none()))
    }

    fn after_handler(&self, claimed: Arc<AtomicBool>) -> Arc<AtomicBool> {
        claimed
    }
}

fn release_on_failure(next: Handler, claimed: Arc<AtomicBool>) -> Handler {
    let inner = next.clone();
    next.with_body(move |ctx, inputs| {
        let output = inner
            .call(ctx, inputs)
            .inspect_err(|_| claimed.store(false, Ordering::SeqCst))?;
        match output {
            HandlerOutput::Ready(_) => Ok(output),
            HandlerOutput::Pending(pending) => {
                let claimed = Arc::clone(&claimed);
                Ok(HandlerOutput::Pending(Box::pin(async move {
                    let result = pending.await;
                    if result.is_err() {
                        claimed.store(false, Ordering::SeqCst);
                    }
                    result
                })))
            }
        }
    })
}
