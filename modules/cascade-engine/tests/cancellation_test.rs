//! Failure handling and cooperative cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use cascade_engine::{AbortSignal, EventType, Handler, Workflow, WorkflowError, WorkflowEvent};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn observed_failure_aborts_own_signal_and_siblings_finish() {
    init_tracing();
    let start = EventType::<()>::labeled("start");
    let done = EventType::<()>::labeled("done");
    let slot: Arc<Mutex<Option<AbortSignal>>> = Arc::new(Mutex::new(None));

    let mut builder = Workflow::builder();
    let captured = Arc::clone(&slot);
    builder
        .handle(
            &[start.key()],
            Handler::from_async("fragile", move |ctx, _| {
                *captured.lock().unwrap() = Some(ctx.signal());
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Err::<Option<WorkflowEvent>, _>(anyhow!("upstream unavailable"))
                }
            }),
        )
        .unwrap();
    builder
        .handle(
            &[start.key()],
            Handler::from_async("steady", move |_, _| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::Ok(Some(done.with(())))
            }),
        )
        .unwrap();
    let workflow = builder.build();

    let run = workflow.create_run();
    let stream = run.stream();
    run.send(start.with(()));

    let signal = slot.lock().unwrap().clone().expect("fragile dispatched");
    let reason = tokio::time::timeout(Duration::from_secs(1), signal.aborted())
        .await
        .expect("signal aborted");
    assert!(reason.to_string().contains("upstream unavailable"));
    assert!(matches!(signal.check(), Err(WorkflowError::Aborted(_))));

    let events = tokio::time::timeout(Duration::from_secs(1), stream.collect_until(|e| done.includes(e)))
        .await
        .expect("steady finished")
        .unwrap();
    assert_eq!(events.len(), 2);
    run.idle().await;
    assert!(run.failure().is_none(), "observed failures stay local");
}

#[tokio::test]
async fn unobserved_failure_fails_the_run_and_ends_root_streams() {
    init_tracing();
    let start = EventType::<()>::labeled("start");

    let mut builder = Workflow::builder();
    builder
        .handle(
            &[start.key()],
            Handler::new("explode", |_, _| Err(anyhow!("kaboom"))),
        )
        .unwrap();
    let workflow = builder.build();

    let run = workflow.create_run();
    let mut stream = run.stream();
    run.send(start.with(()));

    let first = stream.next().await.expect("start delivered").unwrap();
    assert!(start.includes(&first));

    let err = stream.next().await.expect("failure delivered").unwrap_err();
    match &err {
        WorkflowError::HandlerFailed { handler, reason, .. } => {
            assert_eq!(handler, "explode");
            assert!(reason.to_string().contains("kaboom"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(stream.next().await.is_none(), "root stream ends after the failure");
    assert!(run.failure().is_some());

    // Late subscribers still learn about it.
    let late = run.stream();
    let err = late.collect_until(|_| true).await.unwrap_err();
    assert!(matches!(err, WorkflowError::HandlerFailed { .. }));
}

#[tokio::test]
async fn unobserved_async_failure_is_reported_through_collect_until() {
    init_tracing();
    let start = EventType::<()>::labeled("start");
    let stop = EventType::<()>::labeled("stop");

    let mut builder = Workflow::builder();
    builder
        .handle(
            &[start.key()],
            Handler::from_async("remote", |_, _| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<Option<WorkflowEvent>, _>(anyhow!("timed out"))
            }),
        )
        .unwrap();
    let workflow = builder.build();

    let run = workflow.create_run();
    let stream = run.stream();
    run.send(start.with(()));

    let err = stream.collect_until(|e| stop.includes(e)).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn external_abort_is_observed_cooperatively() {
    init_tracing();
    let start = EventType::<()>::labeled("start");
    let finished = EventType::<&'static str>::labeled("finished");

    let mut builder = Workflow::builder();
    builder
        .handle(
            &[start.key()],
            Handler::from_async("long_poll", move |ctx, _| {
                let signal = ctx.signal();
                async move {
                    tokio::select! {
                        reason = signal.aborted() => {
                            anyhow::Ok(Some(finished.with(if reason.to_string() == "shutdown" {
                                "cancelled"
                            } else {
                                "other"
                            })))
                        }
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            anyhow::Ok(Some(finished.with("completed")))
                        }
                    }
                }
            }),
        )
        .unwrap();
    let workflow = builder.build();

    let run = workflow.create_run();
    let stream = run.stream();
    run.send(start.with(()));

    let child = run.root().children()[0];
    let ctx = run.context(child).expect("context exists");
    assert!(ctx.is_async());
    ctx.controller().abort(anyhow!("shutdown"));

    let last = tokio::time::timeout(
        Duration::from_secs(1),
        stream.first_match(|e| finished.includes(e)),
    )
    .await
    .expect("handler observed the abort")
    .unwrap();
    assert_eq!(finished.payload(&last), Some(&"cancelled"));
    run.idle().await;
    assert!(run.failure().is_none());
}

#[tokio::test]
async fn failing_after_abort_keeps_the_first_reason() {
    init_tracing();
    let start = EventType::<()>::labeled("start");

    let mut builder = Workflow::builder();
    builder
        .handle(
            &[start.key()],
            Handler::from_async("checker", |ctx, _| {
                let signal = ctx.signal();
                async move {
                    signal.aborted().await;
                    signal.check()?;
                    anyhow::Ok(None::<WorkflowEvent>)
                }
            }),
        )
        .unwrap();
    let workflow = builder.build();

    let run = workflow.create_run();
    run.send(start.with(()));

    let ctx = run.context(run.root().children()[0]).unwrap();
    let signal = ctx.signal();
    ctx.controller().abort(anyhow!("first"));
    run.idle().await;

    assert_eq!(signal.reason().unwrap().to_string(), "first");
    assert!(run.failure().is_none());
}
