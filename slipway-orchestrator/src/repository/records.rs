//! Records Repository
//!
//! Persists build and deployment records in Postgres. The engine treats this
//! store as a mirror: every write here may lag the in-memory run table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_core::domain::build::BuildRecord;
use slipway_core::domain::deployment::{DeploymentRecord, RunId, RunStatus, WorkloadRef};
use slipway_runner::repository::RecordStore;
use sqlx::PgPool;
use uuid::Uuid;

/// RecordStore over the `builds` and `deployments` tables
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_build(&self, record: &BuildRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, run_id, status, logs, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.run_id.as_str())
        .bind(record.status.as_str())
        .bind(&record.logs)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert build {}", record.id))?;

        Ok(())
    }

    async fn update_build_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = $1, error = COALESCE($2, error), updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update build {}", id))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("build {} not found", id);
        }
        Ok(())
    }

    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET logs = logs || $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(text)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to append log of build {}", id))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("build {} not found", id);
        }
        Ok(())
    }

    async fn get_build(&self, id: Uuid) -> Result<Option<BuildRecord>> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT id, run_id, status, logs, error, created_at, updated_at
            FROM builds
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BuildRecord::try_from).transpose()
    }

    async fn upsert_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        let workload = record
            .workload
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO deployments
                (id, build_id, owner, repo, branch, status, host_port, workload, error,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                build_id = EXCLUDED.build_id,
                status = EXCLUDED.status,
                host_port = EXCLUDED.host_port,
                workload = EXCLUDED.workload,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.build_id)
        .bind(&record.owner)
        .bind(&record.repo)
        .bind(&record.branch)
        .bind(record.status.as_str())
        .bind(record.host_port.map(i32::from))
        .bind(workload)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert deployment {}", record.id))?;

        Ok(())
    }

    async fn get_deployment(&self, id: &RunId) -> Result<Option<DeploymentRecord>> {
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            SELECT id, build_id, owner, repo, branch, status, host_port, workload, error,
                   created_at, updated_at
            FROM deployments
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeploymentRecord::try_from).transpose()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

fn parse_status(raw: &str) -> Result<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown run status '{}'", raw))
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    run_id: String,
    status: String,
    logs: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for BuildRecord {
    type Error = anyhow::Error;

    fn try_from(row: BuildRow) -> Result<Self> {
        Ok(BuildRecord {
            id: row.id,
            run_id: RunId::parse(&row.run_id)?,
            status: parse_status(&row.status)?,
            logs: row.logs,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    build_id: Uuid,
    owner: String,
    repo: String,
    branch: String,
    status: String,
    host_port: Option<i32>,
    workload: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = anyhow::Error;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        let host_port = row
            .host_port
            .map(u16::try_from)
            .transpose()
            .context("host_port out of range")?;
        let workload = row
            .workload
            .map(serde_json::from_value::<WorkloadRef>)
            .transpose()
            .context("workload is not a valid reference")?;

        Ok(DeploymentRecord {
            id: RunId::parse(&row.id)?,
            build_id: row.build_id,
            owner: row.owner,
            repo: row.repo,
            branch: row.branch,
            status: parse_status(&row.status)?,
            host_port,
            workload,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_row() -> DeploymentRow {
        let now = Utc::now();
        DeploymentRow {
            id: "abc".to_string(),
            build_id: Uuid::new_v4(),
            owner: "acme".to_string(),
            repo: "site".to_string(),
            branch: "main".to_string(),
            status: "RUNNING".to_string(),
            host_port: Some(40001),
            workload: Some(serde_json::json!({"kind": "container", "name": "slipway-ctr-abc"})),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_deployment_row_conversion() {
        let record = DeploymentRecord::try_from(deployment_row()).unwrap();
        assert_eq!(record.id.as_str(), "abc");
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.host_port, Some(40001));
        assert_eq!(
            record.workload,
            Some(WorkloadRef::Container {
                name: "slipway-ctr-abc".to_string()
            })
        );
    }

    #[test]
    fn test_deployment_row_rejects_bad_values() {
        let mut row = deployment_row();
        row.status = "SUCCEEDED".to_string();
        assert!(DeploymentRecord::try_from(row).is_err());

        let mut row = deployment_row();
        row.host_port = Some(70000);
        assert!(DeploymentRecord::try_from(row).is_err());

        let mut row = deployment_row();
        row.workload = Some(serde_json::json!({"kind": "vm"}));
        assert!(DeploymentRecord::try_from(row).is_err());
    }

    #[test]
    fn test_build_row_conversion() {
        let now = Utc::now();
        let row = BuildRow {
            id: Uuid::new_v4(),
            run_id: "abc".to_string(),
            status: "FAILED".to_string(),
            logs: "Status: FAILED\n".to_string(),
            error: Some("BuildFailed: boom".to_string()),
            created_at: now,
            updated_at: now,
        };
        let record = BuildRecord::try_from(row).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("BuildFailed: boom"));
    }
}
