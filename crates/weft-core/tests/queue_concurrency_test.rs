//! Queue concurrency bound under real load: five single-task instances on
//! a two-slot queue never exceed two running tasks, and the waves are
//! serialised.

use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::instance::LaunchOptions;
use weft_core::runtime::{Runtime, RuntimeConfig};
use weft_core::storage::{InstanceStore, MemoryInstanceStore};
use weft_core::workflow::Workflow;
use weft_db::models::{InstanceStatus, QueueDiscipline};

#[tokio::test]
async fn concurrency_two_serialises_five_sleeps() {
    let logs = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryInstanceStore::new());
    let runtime = Runtime::start(
        RuntimeConfig::ephemeral(logs.path().to_path_buf()),
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        None,
    )
    .await
    .unwrap();

    runtime
        .queue_pool
        .define_queue(1, "bounded", 2, QueueDiscipline::Default, false);

    let workflow = Workflow::from_xml(
        "short-sleep",
        r#"<workflow><subjobs><job><tasks><task type="BINARY" path="/bin/sleep" queue="bounded"><input>0.1</input></task></tasks></job></subjobs></workflow>"#,
    )
    .unwrap();

    let started = Instant::now();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = runtime
            .engine
            .launch(&workflow, &[], LaunchOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }

    // Sample the running gauge while the waves drain.
    let mut max_running = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = runtime.queue_pool.queue_stats();
        if let Some(q) = stats.iter().find(|q| q.name == "bounded") {
            max_running = max_running.max(q.running);
        }

        let all_done = ids.iter().all(|id| {
            store
                .get(*id)
                .map(|r| r.status != InstanceStatus::Executing)
                .unwrap_or(false)
        });
        if all_done {
            break;
        }
        assert!(Instant::now() < deadline, "instances did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started.elapsed();

    assert!(max_running <= 2, "concurrency bound violated: {max_running}");
    // Five 100ms sleeps over two slots take at least three waves.
    assert!(
        elapsed >= Duration::from_millis(300),
        "finished too fast for a bounded queue: {elapsed:?}"
    );

    for id in ids {
        let record = store.get(id).unwrap();
        assert_eq!(record.status, InstanceStatus::Terminated);
        assert_eq!(record.errors, 0);
    }

    runtime.shutdown().await;
}
