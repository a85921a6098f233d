use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Audit record of one lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    pub id: String,
    pub machine_id: String,
    pub workspace_id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationType {
    Start,
    Restore,
    Stop,
    Snapshot,
    Restart,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OperationFilter {
    pub machine_id: Option<String>,
    pub workspace_id: Option<String>,
}

/// Durable operation history.
///
/// Writes are best effort: a failing audit write is logged and never fails
/// the transition it describes.
#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a running operation. Returns its id when the write succeeded.
    pub(crate) async fn begin(
        &self,
        machine_id: &str,
        workspace_id: &str,
        operation_type: OperationType,
    ) -> Option<String> {
        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO operations (id, machine_id, workspace_id, operation_type, status, started_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(machine_id)
        .bind(workspace_id)
        .bind(operation_type)
        .bind(OperationStatus::Running)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Some(id),
            Err(e) => {
                warn!(machine_id, ?operation_type, "Failed to record operation: {}", e);
                None
            }
        }
    }

    pub(crate) async fn finish(&self, id: Option<String>, error: Option<&str>) {
        let Some(id) = id else { return };
        let status = if error.is_some() {
            OperationStatus::Failed
        } else {
            OperationStatus::Success
        };

        let result = sqlx::query(
            "UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now().timestamp_millis())
        .bind(error)
        .bind(&id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(operation_id = %id, "Failed to complete operation record: {}", e);
        }
    }

    pub async fn get(&self, id: &str) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Operation {id}")))?;

        Ok(row.into())
    }

    /// Newest first.
    pub async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if filter.machine_id.is_some() {
            query.push_str(" AND machine_id = ?");
        }
        if filter.workspace_id.is_some() {
            query.push_str(" AND workspace_id = ?");
        }

        query.push_str(" ORDER BY started_at DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(machine_id) = &filter.machine_id {
            q = q.bind(machine_id);
        }
        if let Some(workspace_id) = &filter.workspace_id {
            q = q.bind(workspace_id);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Operation::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    machine_id: String,
    workspace_id: String,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            machine_id: row.machine_id,
            workspace_id: row.workspace_id,
            operation_type: row.operation_type,
            status: row.status,
            started_at: DateTime::from_timestamp_millis(row.started_at).unwrap_or_default(),
            completed_at: row.completed_at.and_then(DateTime::from_timestamp_millis),
            error: row.error,
        }
    }
}
