//! End-to-end engine scenarios: real child processes driven through the
//! queue pool and process manager, with the in-memory instance store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::instance::LaunchOptions;
use weft_core::retry::RetrySchedule;
use weft_core::runtime::{Runtime, RuntimeConfig};
use weft_core::storage::{InstanceStore, MemoryInstanceStore, MemoryRecord};
use weft_core::workflow::Workflow;
use weft_core::xml::Document;
use weft_db::models::InstanceStatus;

struct TestNode {
    runtime: Runtime,
    store: Arc<MemoryInstanceStore>,
    _logs: tempfile::TempDir,
}

async fn start_node() -> TestNode {
    let logs = tempfile::tempdir().expect("failed to create logs dir");
    let store = Arc::new(MemoryInstanceStore::new());
    let runtime = Runtime::start(
        RuntimeConfig::ephemeral(logs.path().to_path_buf()),
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        None,
    )
    .await
    .expect("runtime failed to start");

    TestNode {
        runtime,
        store,
        _logs: logs,
    }
}

async fn wait_terminal(store: &MemoryInstanceStore, instance_id: i64, timeout: Duration) -> MemoryRecord {
    let deadline = Instant::now() + timeout;
    loop {
        let record = store.get(instance_id).expect("instance record missing");
        if record.status != InstanceStatus::Executing {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "instance {instance_id} did not finish within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn savepoint(record: &MemoryRecord) -> String {
    record.savepoint.clone().expect("no savepoint persisted")
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_echo_task_terminates_cleanly() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "echo-hello",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/echo"><input>hello</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 0);

    let xml = savepoint(&record);
    let doc = Document::parse(&xml).unwrap();
    let outputs: Vec<_> = doc
        .descendant_elements(doc.root())
        .into_iter()
        .filter(|&n| doc.name(n) == Some("output"))
        .collect();
    assert_eq!(outputs.len(), 1);
    assert_eq!(doc.attr(outputs[0], "retval"), Some("0"));
    assert_eq!(doc.text(outputs[0]), "hello\n");

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn failing_task_without_retry_counts_one_error() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "exit-two",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/sh"><input>-c</input><input>exit 2</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 1);

    let xml = savepoint(&record);
    assert!(xml.contains(r#"retval="2""#), "savepoint: {xml}");
    // No engine-error flag for a plain task failure.
    assert!(!xml.contains("engine_error"), "savepoint: {xml}");

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn retry_schedule_produces_spaced_attempts_then_fatal() {
    let node = start_node().await;
    node.runtime.retries.insert(
        RetrySchedule::parse(
            1,
            "fast",
            r#"<schedule><level retry_delay="1" retry_times="1"/></schedule>"#,
        )
        .unwrap(),
    );

    let workflow = Workflow::from_xml(
        "always-fails",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/sh" retry_schedule="fast"><input>-c</input><input>exit 1</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let started = Instant::now();
    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(10)).await;
    let elapsed = started.elapsed();

    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 1);
    // Initial attempt plus one retry, spaced by at least the 1s delay.
    let xml = savepoint(&record);
    assert_eq!(xml.matches("<output").count(), 2, "savepoint: {xml}");
    assert!(
        elapsed >= Duration::from_secs(1),
        "attempts were not spaced: {elapsed:?}"
    );

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn false_condition_skips_subtree_without_running_anything() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "skipped",
        r#"<workflow><subjobs><job condition="false()"><tasks><task type="BINARY" path="/bin/echo"><input>never</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 0);

    let xml = savepoint(&record);
    assert!(xml.contains(r#"status="SKIPPED""#), "savepoint: {xml}");
    // The process manager was never involved.
    assert!(!xml.contains("<output"), "savepoint: {xml}");
    assert_eq!(node.runtime.stats.snapshot().tasks_accepted, 0);

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn child_job_sees_parent_output() {
    let node = start_node().await;

    // B's input binds A's output through the savepoint.
    let workflow = Workflow::from_xml(
        "chained",
        r#"<workflow><subjobs><job name="producer"><tasks><task type="BINARY" path="/bin/echo"><input>alpha</input></task></tasks><subjobs><job name="consumer"><tasks><task type="BINARY" path="/bin/cat"><stdin><value select="evqGetOutput('/bin/echo')"/></stdin></task></tasks></job></subjobs></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 0);

    let xml = savepoint(&record);
    let doc = Document::parse(&xml).unwrap();
    let outputs: Vec<_> = doc
        .descendant_elements(doc.root())
        .into_iter()
        .filter(|&n| doc.name(n) == Some("output"))
        .collect();
    assert_eq!(outputs.len(), 2);
    // The consumer received the producer's stdout on stdin.
    assert_eq!(doc.text(outputs[1]), "alpha\n");

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn loop_clones_job_per_context() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "looped",
        r#"<workflow><parameters><parameter name="first"/><parameter name="second"/></parameters><subjobs><job loop="/workflow/parameters/parameter"><tasks><task type="BINARY" path="/bin/echo"><input><value select="evqGetContext()"/></input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let params = vec![
        ("first".to_owned(), "one".to_owned()),
        ("second".to_owned(), "two".to_owned()),
    ];
    let id = node
        .runtime
        .engine
        .launch(&workflow, &params, LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 0);

    let xml = savepoint(&record);
    assert_eq!(xml.matches("context-id").count(), 2, "savepoint: {xml}");
    assert!(xml.contains("one\n"), "savepoint: {xml}");
    assert!(xml.contains("two\n"), "savepoint: {xml}");

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn cancel_aborts_a_long_running_instance() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "sleeper",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/sleep"><input>10</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    node.runtime.engine.cancel(id, true).await.unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(8)).await;
    assert_eq!(record.status, InstanceStatus::Aborted);

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn launch_rejects_parameter_mismatch_without_creating_an_instance() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "with-params",
        r#"<workflow><parameters><parameter name="target"/></parameters><subjobs><job><tasks><task type="BINARY" path="/bin/true"/></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    // Missing parameter.
    let err = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_WORKFLOW_PARAMETERS");

    // Misnamed parameter.
    let bad = vec![("traget".to_owned(), "x".to_owned())];
    let err = node
        .runtime
        .engine
        .launch(&workflow, &bad, LaunchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_WORKFLOW_PARAMETERS");

    // No instance row was created in either case.
    assert!(node.store.get(1).is_none());

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn environment_parameters_mode_exports_inputs() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "env-mode",
        r#"<workflow><subjobs><job><tasks><task type="SCRIPT" name="show-env" parameters-mode="ENV"><input name="GREETING">bonjour</input><script>#!/bin/sh
echo "$GREETING"</script></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.errors, 0);
    assert!(savepoint(&record).contains("bonjour\n"));

    node.runtime.shutdown().await;
}

#[tokio::test]
async fn terminal_savepoint_round_trips_byte_identically() {
    let node = start_node().await;

    let workflow = Workflow::from_xml(
        "round-trip",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/echo"><input>payload &amp; more</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let id = node
        .runtime
        .engine
        .launch(&workflow, &[], LaunchOptions::default())
        .await
        .unwrap();

    let record = wait_terminal(&node.store, id, Duration::from_secs(5)).await;
    let xml = savepoint(&record);

    let reparsed = Document::parse(&xml).unwrap();
    assert_eq!(reparsed.to_xml(), xml);

    node.runtime.shutdown().await;
}
