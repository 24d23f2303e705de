use cascade_engine::{EventType, Handler, Workflow};
use cascade_middleware::GraphValidator;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn undeclared_output_is_reported_and_still_delivered() {
    init_tracing();
    let start = EventType::<u32>::labeled("start");
    let declared = EventType::<u32>::labeled("declared");
    let rogue = EventType::<&'static str>::labeled("rogue");

    let validator = GraphValidator::new().edge(&[start.key()], &[declared.key()]);

    let mut builder = Workflow::builder();
    builder
        .handle(
            &[start.key()],
            Handler::new("step", move |ctx, inputs| {
                let n = start.payload(&inputs[0]).copied().unwrap_or_default();
                ctx.emit(declared.with(n + 1));
                Ok(Some(rogue.with("surprise")))
            }),
        )
        .unwrap();
    builder.extension(validator.clone());
    let workflow = builder.build();

    let run = workflow.create_run();
    let stream = run.stream();
    run.send(start.with(1));

    let events = stream.collect_until(|e| rogue.includes(e)).await.unwrap();
    assert_eq!(events.len(), 3, "validation never blocks delivery");

    let diagnostics = validator.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    let diagnostic = &diagnostics[0];
    assert_eq!(diagnostic.run_id, run.id());
    assert_eq!(diagnostic.handler, "step");
    assert_eq!(diagnostic.input_types, vec!["start"]);
    assert_eq!(diagnostic.output_type, "rogue");
    assert_eq!(diagnostic.payload, "\"surprise\"");
    assert!(diagnostic.to_string().contains("undeclared rogue"));

    let json = serde_json::to_value(diagnostic).unwrap();
    assert_eq!(json["handler"], "step");
}

#[tokio::test]
async fn handlers_without_edges_are_flagged_and_root_sends_are_not() {
    init_tracing();
    let ping = EventType::<()>::labeled("ping");
    let pong = EventType::<()>::labeled("pong");

    let validator = GraphValidator::new();
    let mut builder = Workflow::builder();
    builder
        .handle(
            &[ping.key()],
            Handler::new("responder", move |_, _| Ok(Some(pong.with(())))),
        )
        .unwrap();
    builder.extension(validator.clone());
    let workflow = builder.build();

    let run = workflow.create_run();
    run.send(ping.with(()));
    run.send(pong.with(()));

    let diagnostics = validator.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].output_type, "pong");

    validator.clear();
    assert!(validator.diagnostics().is_empty());
}
