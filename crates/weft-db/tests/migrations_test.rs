//! Schema smoke tests against a real PostgreSQL.

use weft_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_the_expected_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

    for expected in [
        "t_log",
        "t_log_api",
        "t_log_notifications",
        "t_notification",
        "t_notification_type",
        "t_queue",
        "t_schedule",
        "t_tag",
        "t_uniqueaction",
        "t_user",
        "t_workflow",
        "t_workflow_instance",
        "t_workflow_instance_parameters",
        "t_workflow_instance_tag",
        "t_workflow_notification",
        "t_workflow_schedule",
        "t_workflow_schedule_parameters",
    ] {
        assert!(names.contains(&expected), "missing table {expected}: {names:?}");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn default_queue_is_seeded() {
    let (pool, db_name) = create_test_db().await;

    let rows = weft_db::queries::queues::list_queues(&pool).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].queue_name, "default");
    assert!(rows[0].queue_concurrency >= 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // Running the migrator a second time applies nothing and fails nothing.
    weft_db::pool::run_migrations(&pool, weft_db::pool::default_migrations_path())
        .await
        .unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}
