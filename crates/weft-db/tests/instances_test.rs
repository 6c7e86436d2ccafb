//! Instance persistence round-trips against a real PostgreSQL.

use chrono::Utc;

use weft_db::models::InstanceStatus;
use weft_db::queries::{gc as gc_db, instances as instance_db, workflows as workflow_db};
use weft_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn instance_lifecycle_round_trip() {
    let (pool, db_name) = create_test_db().await;

    let workflow_id = workflow_db::insert_workflow(
        &pool,
        "demo",
        "<workflow><subjobs><job><tasks><task path=\"/bin/true\"/></tasks></job></subjobs></workflow>",
        "ops",
        "",
        None,
    )
    .await
    .unwrap();

    let instance_id = instance_db::insert_instance(
        &pool,
        &instance_db::NewInstance {
            node_name: "node-1",
            workflow_id,
            workflow_schedule_id: None,
            host: None,
        },
    )
    .await
    .unwrap();

    instance_db::insert_instance_parameters(
        &pool,
        instance_id,
        &[("target".to_owned(), "prod".to_owned())],
    )
    .await
    .unwrap();

    // Progress write keeps the instance executing with no end timestamp.
    instance_db::save_savepoint(
        &pool,
        instance_id,
        "<workflow status=\"EXECUTING\"/>",
        InstanceStatus::Executing,
        0,
        None,
    )
    .await
    .unwrap();

    let recoverable = instance_db::list_recoverable(&pool, "node-1").await.unwrap();
    assert_eq!(recoverable.len(), 1);
    assert_eq!(recoverable[0].workflow_instance_id, instance_id);

    // Terminal write.
    instance_db::save_savepoint(
        &pool,
        instance_id,
        "<workflow status=\"TERMINATED\"/>",
        InstanceStatus::Terminated,
        0,
        Some(Utc::now()),
    )
    .await
    .unwrap();

    let row = instance_db::get_instance(&pool, instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.workflow_instance_status, InstanceStatus::Terminated);
    assert!(row.workflow_instance_end.is_some());
    assert!(instance_db::list_recoverable(&pool, "node-1").await.unwrap().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn gc_purges_only_old_terminated_instances() {
    let (pool, db_name) = create_test_db().await;

    let make = |status: &'static str| {
        let pool = pool.clone();
        async move {
            let id = instance_db::insert_instance(
                &pool,
                &instance_db::NewInstance {
                    node_name: "node-1",
                    workflow_id: 1,
                    workflow_schedule_id: None,
                    host: None,
                },
            )
            .await
            .unwrap();
            sqlx::query(
                "UPDATE t_workflow_instance \
                 SET workflow_instance_status = $1, \
                     workflow_instance_end = now() - interval '90 days' \
                 WHERE workflow_instance_id = $2",
            )
            .bind(status)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
            id
        }
    };

    let old_terminated = make("TERMINATED").await;
    let old_executing = {
        // Executing instances are never purged regardless of age.
        let id = instance_db::insert_instance(
            &pool,
            &instance_db::NewInstance {
                node_name: "node-1",
                workflow_id: 1,
                workflow_schedule_id: None,
                host: None,
            },
        )
        .await
        .unwrap();
        id
    };

    let cutoff = Utc::now() - chrono::Duration::days(30);
    let removed = gc_db::purge_instances(&pool, cutoff, 100).await.unwrap();
    assert_eq!(removed, 1);

    assert!(instance_db::get_instance(&pool, old_terminated)
        .await
        .unwrap()
        .is_none());
    assert!(instance_db::get_instance(&pool, old_executing)
        .await
        .unwrap()
        .is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn workflow_deletion_cascades_to_subscriptions() {
    let (pool, db_name) = create_test_db().await;

    let workflow_id = workflow_db::insert_workflow(
        &pool,
        "doomed",
        "<workflow><subjobs><job><tasks><task path=\"/bin/true\"/></tasks></job></subjobs></workflow>",
        "",
        "",
        None,
    )
    .await
    .unwrap();
    workflow_db::subscribe_notification(&pool, workflow_id, 1).await.unwrap();

    assert!(workflow_db::delete_workflow(&pool, workflow_id).await.unwrap());
    assert!(workflow_db::list_workflow_notifications(&pool, workflow_id)
        .await
        .unwrap()
        .is_empty());

    // Deleting again reports "not found".
    assert!(!workflow_db::delete_workflow(&pool, workflow_id).await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}
