use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;
use uuid::Uuid;
use wsm_provider::InstanceKey;

use crate::error::{OrchestratorError, Result};

/// A stored snapshot of a workspace machine's filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Snapshot {
    pub id: String,
    pub workspace_id: String,
    pub machine_id: String,
    pub provider: String,
    pub instance_key: InstanceKey,
    pub created_at: DateTime<Utc>,
}

/// Snapshot records keyed by workspace, newest first.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        workspace_id: &str,
        machine_id: &str,
        provider: &str,
        key: &InstanceKey,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            machine_id: machine_id.to_string(),
            provider: provider.to_string(),
            instance_key: key.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO snapshots (id, workspace_id, machine_id, provider, instance_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.workspace_id)
        .bind(&snapshot.machine_id)
        .bind(&snapshot.provider)
        .bind(serde_json::to_string(&snapshot.instance_key)?)
        .bind(snapshot.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(snapshot)
    }

    pub async fn get(&self, id: &str) -> Result<Snapshot> {
        sqlx::query_as::<_, SnapshotRow>("SELECT * FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Snapshot {id}")))?
            .try_into()
    }

    pub async fn latest_for_workspace(&self, workspace_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM snapshots WHERE workspace_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Snapshot::try_from).transpose()
    }

    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM snapshots WHERE workspace_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Snapshot::try_from).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("Snapshot {id}")));
        }

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    workspace_id: String,
    machine_id: String,
    provider: String,
    instance_key: String,
    created_at: i64,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = OrchestratorError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            machine_id: row.machine_id,
            provider: row.provider,
            instance_key: serde_json::from_str(&row.instance_key)?,
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
        })
    }
}
