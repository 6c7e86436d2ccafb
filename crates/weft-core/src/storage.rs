//! Instance persistence behind a narrow trait.
//!
//! The engine only needs four operations: create an instance row, record
//! its launch parameters, persist savepoint snapshots, and list instances
//! eligible for crash recovery. The Postgres implementation delegates to
//! `weft-db`; the in-memory one backs engine tests (and `weft run`
//! one-shot executions) without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use weft_db::models::InstanceStatus;
use weft_db::queries::instances as instance_db;

/// Fields for a freshly launched instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub node_name: String,
    pub workflow_id: i64,
    pub workflow_schedule_id: Option<i64>,
    pub host: Option<String>,
}

/// A recoverable instance: its id and persisted savepoint.
#[derive(Debug, Clone)]
pub struct RecoverableInstance {
    pub instance_id: i64,
    pub savepoint: String,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_instance(&self, new: NewInstance) -> anyhow::Result<i64>;

    async fn record_parameters(
        &self,
        instance_id: i64,
        parameters: &[(String, String)],
    ) -> anyhow::Result<()>;

    async fn save_savepoint(
        &self,
        instance_id: i64,
        savepoint: &str,
        status: InstanceStatus,
        errors: i32,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    async fn list_recoverable(&self, node_name: &str) -> anyhow::Result<Vec<RecoverableInstance>>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn create_instance(&self, new: NewInstance) -> anyhow::Result<i64> {
        instance_db::insert_instance(
            &self.pool,
            &instance_db::NewInstance {
                node_name: &new.node_name,
                workflow_id: new.workflow_id,
                workflow_schedule_id: new.workflow_schedule_id,
                host: new.host.as_deref(),
            },
        )
        .await
    }

    async fn record_parameters(
        &self,
        instance_id: i64,
        parameters: &[(String, String)],
    ) -> anyhow::Result<()> {
        instance_db::insert_instance_parameters(&self.pool, instance_id, parameters).await
    }

    async fn save_savepoint(
        &self,
        instance_id: i64,
        savepoint: &str,
        status: InstanceStatus,
        errors: i32,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        instance_db::save_savepoint(&self.pool, instance_id, savepoint, status, errors, end).await
    }

    async fn list_recoverable(&self, node_name: &str) -> anyhow::Result<Vec<RecoverableInstance>> {
        let rows = instance_db::list_recoverable(&self.pool, node_name).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.workflow_instance_savepoint.map(|savepoint| RecoverableInstance {
                    instance_id: row.workflow_instance_id,
                    savepoint,
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// A stored instance record, visible to tests.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub instance_id: i64,
    pub node_name: String,
    pub workflow_id: i64,
    pub parameters: Vec<(String, String)>,
    pub savepoint: Option<String>,
    pub status: InstanceStatus,
    pub errors: i32,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryInstanceStore {
    next_id: AtomicI64,
    records: Mutex<HashMap<i64, MemoryRecord>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Inspect a record (tests).
    pub fn get(&self, instance_id: i64) -> Option<MemoryRecord> {
        self.records.lock().unwrap().get(&instance_id).cloned()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create_instance(&self, new: NewInstance) -> anyhow::Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().insert(
            id,
            MemoryRecord {
                instance_id: id,
                node_name: new.node_name,
                workflow_id: new.workflow_id,
                parameters: Vec::new(),
                savepoint: None,
                status: InstanceStatus::Executing,
                errors: 0,
                end: None,
            },
        );
        Ok(id)
    }

    async fn record_parameters(
        &self,
        instance_id: i64,
        parameters: &[(String, String)],
    ) -> anyhow::Result<()> {
        if let Some(record) = self.records.lock().unwrap().get_mut(&instance_id) {
            record.parameters = parameters.to_vec();
        }
        Ok(())
    }

    async fn save_savepoint(
        &self,
        instance_id: i64,
        savepoint: &str,
        status: InstanceStatus,
        errors: i32,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow::anyhow!("instance {instance_id} not found"))?;
        record.savepoint = Some(savepoint.to_owned());
        record.status = status;
        record.errors = errors;
        if end.is_some() {
            record.end = end;
        }
        Ok(())
    }

    async fn list_recoverable(&self, node_name: &str) -> anyhow::Result<Vec<RecoverableInstance>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.node_name == node_name && r.status == InstanceStatus::Executing)
            .filter_map(|r| {
                r.savepoint.clone().map(|savepoint| RecoverableInstance {
                    instance_id: r.instance_id,
                    savepoint,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryInstanceStore::new();
        let id = store
            .create_instance(NewInstance {
                node_name: "node-1".into(),
                workflow_id: 7,
                workflow_schedule_id: None,
                host: None,
            })
            .await
            .unwrap();

        store
            .record_parameters(id, &[("k".into(), "v".into())])
            .await
            .unwrap();
        store
            .save_savepoint(id, "<workflow/>", InstanceStatus::Terminated, 1, Some(Utc::now()))
            .await
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.workflow_id, 7);
        assert_eq!(record.parameters.len(), 1);
        assert_eq!(record.status, InstanceStatus::Terminated);
        assert_eq!(record.errors, 1);
        assert!(record.end.is_some());

        // Terminated instances are not recoverable.
        assert!(store.list_recoverable("node-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_lists_recoverable_executing_instances() {
        let store = MemoryInstanceStore::new();
        let id = store
            .create_instance(NewInstance {
                node_name: "node-1".into(),
                workflow_id: 1,
                workflow_schedule_id: None,
                host: None,
            })
            .await
            .unwrap();
        store
            .save_savepoint(id, "<workflow/>", InstanceStatus::Executing, 0, None)
            .await
            .unwrap();

        let recoverable = store.list_recoverable("node-1").await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].instance_id, id);
        assert!(store.list_recoverable("other").await.unwrap().is_empty());
    }
}
