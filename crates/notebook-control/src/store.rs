use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use notebook_core::{ProcessHandle, ResourceConfig, ServerKey, ServerRecord};
use notebook_db::entities::notebook_servers;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, sea_query::OnConflict,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),

    #[error("corrupt notebook server row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("record for {0} kept changing during insert")]
    Contended(ServerKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Someone else holds the key; nothing was written.
    Existing(ServerRecord),
}

/// Durable (project, owner) → ServerRecord mapping. No process knowledge.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError>;

    async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError>;

    async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<ServerKey, ServerRecord>>,
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.project == project)
            .cloned()
            .collect())
    }

    async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let key = record.key();
        if let Some(existing) = records.get(&key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.remove(key).is_some())
    }
}

/// sea-orm backed store over the `notebook_servers` table.
#[derive(Clone)]
pub struct DbStore {
    db: Arc<DatabaseConnection>,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn corrupt(m: &notebook_servers::Model, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: m.id.to_string(),
        reason: reason.into(),
    }
}

fn to_record(m: notebook_servers::Model) -> Result<ServerRecord, StoreError> {
    let port = u16::try_from(m.port).map_err(|_| corrupt(&m, format!("port {}", m.port)))?;
    let pid = u32::try_from(m.pid).map_err(|_| corrupt(&m, format!("pid {}", m.pid)))?;
    let resources: ResourceConfig = serde_json::from_value(m.resources.clone())
        .map_err(|e| corrupt(&m, format!("resources: {e}")))?;

    Ok(ServerRecord {
        project: m.project,
        owner: m.owner,
        port,
        token: m.token,
        process: ProcessHandle::new(pid),
        resources,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

fn to_active(record: &ServerRecord) -> Result<notebook_servers::ActiveModel, StoreError> {
    let resources = serde_json::to_value(&record.resources).map_err(|e| StoreError::Corrupt {
        id: record.key().to_string(),
        reason: format!("resources: {e}"),
    })?;
    Ok(notebook_servers::ActiveModel {
        id: Set(uuid::Uuid::new_v4()),
        project: Set(record.project.clone()),
        owner: Set(record.owner.clone()),
        port: Set(i32::from(record.port)),
        token: Set(record.token.clone()),
        pid: Set(i64::from(record.process.pid)),
        resources: Set(resources),
        created_at: Set(record.created_at.into()),
    })
}

#[async_trait]
impl ServerStore for DbStore {
    async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        notebook_servers::Entity::find()
            .filter(notebook_servers::Column::Project.eq(key.project.as_str()))
            .filter(notebook_servers::Column::Owner.eq(key.owner.as_str()))
            .one(&*self.db)
            .await?
            .map(to_record)
            .transpose()
    }

    async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError> {
        notebook_servers::Entity::find()
            .filter(notebook_servers::Column::Project.eq(project))
            .order_by_asc(notebook_servers::Column::Owner)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(to_record)
            .collect()
    }

    async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError> {
        let key = record.key();
        // A conflicting row can be deleted between our insert and re-read;
        // retry a couple of times before giving up.
        for _ in 0..3 {
            let res = notebook_servers::Entity::insert(to_active(record)?)
                .on_conflict(
                    OnConflict::columns([
                        notebook_servers::Column::Project,
                        notebook_servers::Column::Owner,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await;

            match res {
                Ok(n) if n > 0 => return Ok(InsertOutcome::Inserted),
                Ok(_) | Err(DbErr::RecordNotInserted) => {}
                Err(e) => return Err(e.into()),
            }

            if let Some(existing) = self.get(&key).await? {
                return Ok(InsertOutcome::Existing(existing));
            }
        }
        Err(StoreError::Contended(key))
    }

    async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError> {
        let res = notebook_servers::Entity::delete_many()
            .filter(notebook_servers::Column::Project.eq(key.project.as_str()))
            .filter(notebook_servers::Column::Owner.eq(key.owner.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
