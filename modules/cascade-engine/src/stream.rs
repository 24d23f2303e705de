//! Stream projection: per-context live views of a run's events.

use std::pin::Pin;
use std::task::{Context, Poll};

use cascade_events::{EventType, WorkflowEvent};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::context::ContextId;
use crate::error::WorkflowError;

pub(crate) enum StreamItem {
    Event(WorkflowEvent),
    Failed(WorkflowError),
}

/// A registered reader. Kept in the run state; dropping it closes the stream.
pub(crate) struct Subscriber {
    pub anchor: ContextId,
    pub tx: UnboundedSender<StreamItem>,
}

/// Events causally downstream of one context, in emission order.
///
/// Subscribed at creation, never replays. Ends when the run is dropped; a
/// root stream also ends right after delivering a run-fatal failure.
pub struct EventStream {
    rx: UnboundedReceiver<StreamItem>,
}

impl EventStream {
    pub(crate) fn channel(anchor: ContextId) -> (Subscriber, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber { anchor, tx }, EventStream { rx })
    }

    /// Yield events up to and including the first one matching `predicate`,
    /// then end. A failure also ends it.
    pub fn until<P>(
        self,
        predicate: P,
    ) -> impl Stream<Item = Result<WorkflowEvent, WorkflowError>> + Send + Unpin
    where
        P: FnMut(&WorkflowEvent) -> bool + Send + 'static,
    {
        Box::pin(futures::stream::unfold(
            (self, predicate, false),
            |(mut stream, mut predicate, done)| async move {
                if done {
                    return None;
                }
                let item = stream.next().await?;
                let stop = match &item {
                    Ok(event) => predicate(event),
                    Err(_) => true,
                };
                Some((item, (stream, predicate, stop)))
            },
        ))
    }

    /// [`until`](Self::until) the first instance of `ty`.
    pub fn until_type<T>(
        self,
        ty: &EventType<T>,
    ) -> impl Stream<Item = Result<WorkflowEvent, WorkflowError>> + Send + Unpin
    where
        T: std::fmt::Debug + Send + Sync + 'static,
    {
        let ty = *ty;
        self.until(move |event| ty.includes(event))
    }

    /// Collect events until `predicate` matches (inclusive).
    ///
    /// Fails with the run's failure if one arrives first, or with
    /// [`WorkflowError::StreamEnded`] if the stream closes without a match.
    pub async fn collect_until<P>(mut self, mut predicate: P) -> Result<Vec<WorkflowEvent>, WorkflowError>
    where
        P: FnMut(&WorkflowEvent) -> bool,
    {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            let event = item?;
            let done = predicate(&event);
            events.push(event);
            if done {
                return Ok(events);
            }
        }
        Err(WorkflowError::StreamEnded)
    }

    /// First event matching `predicate`, skipping everything before it.
    pub async fn first_match<P>(self, mut predicate: P) -> Result<WorkflowEvent, WorkflowError>
    where
        P: FnMut(&WorkflowEvent) -> bool,
    {
        let events = self.collect_until(&mut predicate).await?;
        events.into_iter().last().ok_or(WorkflowError::StreamEnded)
    }
}

impl Stream for EventStream {
    type Item = Result<WorkflowEvent, WorkflowError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|item| {
            item.map(|item| match item {
                StreamItem::Event(event) => Ok(event),
                StreamItem::Failed(error) => Err(error),
            })
        })
    }
}
