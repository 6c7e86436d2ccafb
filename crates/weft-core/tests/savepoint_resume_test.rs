//! Savepoint recovery: rebuilding an instance from persisted XML
//! re-schedules interrupted tasks and preserves completed history.

use weft_core::instance::dag::{Action, WorkflowInstance};
use weft_core::retry::RetrySchedules;
use weft_core::xml::Document;

#[test]
fn interrupted_tasks_are_rescheduled() {
    // Producer finished; consumer was executing when the node died.
    let savepoint = r#"<workflow id="9" name="chain" status="EXECUTING" start_time="2026-07-01T10:00:00Z" errors="0"><subjobs><job name="producer"><tasks><task type="BINARY" path="/bin/echo" status="TERMINATED" retval="0"><input>alpha</input><output retval="0" execution_time="0.010">alpha
</output></task></tasks><subjobs><job name="consumer"><tasks><task type="BINARY" path="/bin/cat" status="EXECUTING" started_at="2026-07-01T10:00:01Z"><stdin>alpha
</stdin></task></tasks></job></subjobs></job></subjobs></workflow>"#;

    let retries = RetrySchedules::new();
    let (instance, actions) = WorkflowInstance::resume(9, savepoint, &retries).unwrap();

    assert_eq!(instance.id, 9);
    assert_eq!(instance.workflow_name, "chain");
    assert!(!instance.is_finished());

    // Exactly the interrupted consumer goes back to the queue.
    let enqueues: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, Action::Enqueue { .. }))
        .collect();
    assert_eq!(enqueues.len(), 1, "actions: {actions:?}");
}

#[test]
fn completed_history_survives_resume() {
    let savepoint = r#"<workflow id="4" name="done" status="EXECUTING" start_time="2026-07-01T10:00:00Z" errors="0"><subjobs><job><tasks><task type="BINARY" path="/bin/true" status="TERMINATED" retval="0"><output retval="0" execution_time="0.002"/></task></tasks></job></subjobs></workflow>"#;

    let retries = RetrySchedules::new();
    let (mut instance, actions) = WorkflowInstance::resume(4, savepoint, &retries).unwrap();

    assert!(actions.is_empty());
    assert!(instance.is_finished());

    // The prior attempt record is still there after re-serialising.
    let xml = instance.savepoint_xml();
    assert!(xml.contains(r#"<output retval="0" execution_time="0.002"/>"#));
}

#[test]
fn unstarted_child_jobs_start_after_resume() {
    // The parent completed but the crash hit before its child was
    // evaluated: resume must schedule the child's task.
    let savepoint = r#"<workflow id="5" name="pending-child" status="EXECUTING" start_time="2026-07-01T10:00:00Z" errors="0"><subjobs><job name="parent"><tasks><task type="BINARY" path="/bin/true" status="TERMINATED" retval="0"><output retval="0" execution_time="0.001"/></task></tasks><subjobs><job name="child"><tasks><task type="BINARY" path="/bin/echo"><input>later</input></task></tasks></job></subjobs></job></subjobs></workflow>"#;

    let retries = RetrySchedules::new();
    let (instance, actions) = WorkflowInstance::resume(5, savepoint, &retries).unwrap();

    assert!(!instance.is_finished());
    assert_eq!(
        actions
            .iter()
            .filter(|a| matches!(a, Action::Enqueue { .. }))
            .count(),
        1,
        "actions: {actions:?}"
    );
}

#[test]
fn resume_tolerates_absent_optional_fields() {
    // Older savepoints may lack retval/started_at/errors attributes.
    let savepoint = r#"<workflow id="6" name="legacy"><subjobs><job><tasks><task type="BINARY" path="/bin/true" status="QUEUED"/></tasks></job></subjobs></workflow>"#;

    let retries = RetrySchedules::new();
    let (instance, actions) = WorkflowInstance::resume(6, savepoint, &retries).unwrap();
    assert!(!instance.is_finished());
    assert_eq!(actions.len(), 1);
}

#[test]
fn savepoint_round_trip_is_stable() {
    let savepoint = r#"<workflow id="7" name="stable" status="TERMINATED" errors="1"><subjobs><job status="FAILED"><tasks><task type="BINARY" path="/bin/false" status="TERMINATED" retval="1"><output retval="1" execution_time="0.003"/><stderr>boom</stderr></task></tasks></job></subjobs></workflow>"#;

    let doc = Document::parse(savepoint).unwrap();
    let once = doc.to_xml();
    let twice = Document::parse(&once).unwrap().to_xml();
    assert_eq!(once, twice);
}
