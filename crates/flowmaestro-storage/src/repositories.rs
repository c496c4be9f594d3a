//! Repository layer for database operations

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL and run pending migrations.
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================
    // Users
    // ============================================

    pub async fn create_user(&self, input: CreateUser) -> Result<UserRow> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO flowmaestro.users (id, email, name, is_admin)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email, name, is_admin, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.email)
        .bind(&input.name)
        .bind(input.is_admin)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, is_admin, created_at
            FROM flowmaestro.users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Workflows
    // ============================================

    /// Create a workflow. The initial definition is also written as version 1
    /// so the current definition is always the highest-numbered snapshot.
    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow> {
        let mut tx = self.pool.begin().await?;
        let workflow_id = Uuid::now_v7();

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO flowmaestro.workflows (id, user_id, name, definition, version)
            VALUES ($1, $2, $3, $4, 1)
            RETURNING id, user_id, name, definition, version, deleted_at, created_at, updated_at
            "#,
        )
        .bind(workflow_id)
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.definition)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO flowmaestro.workflow_versions (id, workflow_id, version, definition, created_by)
            VALUES ($1, $2, 1, $3, $4)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(&input.definition)
        .bind(input.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_workflow(&self, id: Uuid, user_id: Uuid) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, definition, version, deleted_at, created_at, updated_at
            FROM flowmaestro.workflows
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_workflows(&self, user_id: Uuid) -> Result<Vec<WorkflowRow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, definition, version, deleted_at, created_at, updated_at
            FROM flowmaestro.workflows
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Update name and/or definition. A definition change bumps the version
    /// counter and writes the new snapshot in the same transaction.
    pub async fn update_workflow(
        &self,
        id: Uuid,
        user_id: Uuid,
        input: UpdateWorkflow,
    ) -> Result<Option<WorkflowRow>> {
        let mut tx = self.pool.begin().await?;

        let Some(current) = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, definition, version, deleted_at, created_at, updated_at
            FROM flowmaestro.workflows
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let definition_changed = input
            .definition
            .as_ref()
            .is_some_and(|d| d != &current.definition);
        let new_version = if definition_changed {
            current.version + 1
        } else {
            current.version
        };

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE flowmaestro.workflows
            SET
                name = COALESCE($3, name),
                definition = COALESCE($4, definition),
                version = $5,
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            RETURNING id, user_id, name, definition, version, deleted_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(&input.name)
        .bind(&input.definition)
        .bind(new_version)
        .fetch_one(&mut *tx)
        .await?;

        if definition_changed {
            sqlx::query(
                r#"
                INSERT INTO flowmaestro.workflow_versions (id, workflow_id, version, definition, created_by)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(id)
            .bind(new_version)
            .bind(input.definition.as_deref().unwrap_or(&current.definition))
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(row))
    }

    pub async fn soft_delete_workflow(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flowmaestro.workflows
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Versions (snapshots)
    // ============================================

    /// Snapshot the workflow's current definition under the next version
    /// number.
    pub async fn create_snapshot(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        label: Option<String>,
    ) -> Result<Option<VersionRow>> {
        let mut tx = self.pool.begin().await?;

        let Some(workflow) = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, definition, version, deleted_at, created_at, updated_at
            FROM flowmaestro.workflows
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let new_version = workflow.version + 1;

        sqlx::query("UPDATE flowmaestro.workflows SET version = $2, updated_at = NOW() WHERE id = $1")
            .bind(workflow_id)
            .bind(new_version)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            INSERT INTO flowmaestro.workflow_versions (id, workflow_id, version, label, definition, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, workflow_id, version, label, definition, created_by, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(new_version)
        .bind(&label)
        .bind(&workflow.definition)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row))
    }

    pub async fn list_versions(&self, workflow_id: Uuid, user_id: Uuid) -> Result<Vec<VersionRow>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT v.id, v.workflow_id, v.version, v.label, v.definition, v.created_by, v.created_at
            FROM flowmaestro.workflow_versions v
            JOIN flowmaestro.workflows w ON w.id = v.workflow_id
            WHERE v.workflow_id = $1 AND w.user_id = $2
            ORDER BY v.version DESC
            "#,
        )
        .bind(workflow_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_version(&self, version_id: Uuid, user_id: Uuid) -> Result<Option<VersionRow>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT v.id, v.workflow_id, v.version, v.label, v.definition, v.created_by, v.created_at
            FROM flowmaestro.workflow_versions v
            JOIN flowmaestro.workflows w ON w.id = v.workflow_id
            WHERE v.id = $1 AND w.user_id = $2
            "#,
        )
        .bind(version_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// The pinned snapshot an execution loads its definition from.
    pub async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<Option<VersionRow>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, workflow_id, version, label, definition, created_by, created_at
            FROM flowmaestro.workflow_versions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Labels may change; definition bytes may not.
    pub async fn rename_version(
        &self,
        version_id: Uuid,
        user_id: Uuid,
        label: Option<String>,
    ) -> Result<Option<VersionRow>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            UPDATE flowmaestro.workflow_versions v
            SET label = $3
            FROM flowmaestro.workflows w
            WHERE v.id = $1 AND w.id = v.workflow_id AND w.user_id = $2
            RETURNING v.id, v.workflow_id, v.version, v.label, v.definition, v.created_by, v.created_at
            "#,
        )
        .bind(version_id)
        .bind(user_id)
        .bind(&label)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn delete_version(&self, version_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(version) = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT v.id, v.workflow_id, v.version, v.label, v.definition, v.created_by, v.created_at
            FROM flowmaestro.workflow_versions v
            JOIN flowmaestro.workflows w ON w.id = v.workflow_id
            WHERE v.id = $1 AND w.user_id = $2
            "#,
        )
        .bind(version_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };

        // The current definition's snapshot must survive.
        let current: i32 =
            sqlx::query_scalar("SELECT version FROM flowmaestro.workflows WHERE id = $1")
                .bind(version.workflow_id)
                .fetch_one(&mut *tx)
                .await?;
        if version.version == current {
            bail!("cannot delete the snapshot backing the current definition");
        }

        sqlx::query("DELETE FROM flowmaestro.workflow_versions WHERE id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Overwrite the current definition with a historical snapshot's bytes
    /// and bump the version counter. In-flight executions keep their pins.
    pub async fn revert_to_version(
        &self,
        version_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<WorkflowRow>> {
        let mut tx = self.pool.begin().await?;

        let Some(version) = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT v.id, v.workflow_id, v.version, v.label, v.definition, v.created_by, v.created_at
            FROM flowmaestro.workflow_versions v
            JOIN flowmaestro.workflows w ON w.id = v.workflow_id
            WHERE v.id = $1 AND w.user_id = $2 AND w.deleted_at IS NULL
            "#,
        )
        .bind(version_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE flowmaestro.workflows
            SET definition = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, name, definition, version, deleted_at, created_at, updated_at
            "#,
        )
        .bind(version.workflow_id)
        .bind(&version.definition)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO flowmaestro.workflow_versions (id, workflow_id, version, label, definition, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(version.workflow_id)
        .bind(row.version)
        .bind(format!("revert of v{}", version.version))
        .bind(&version.definition)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row))
    }

    // ============================================
    // Executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO flowmaestro.executions
                (id, workflow_id, version, user_id, status, inputs, trigger_id, trigger_payload)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING id, workflow_id, version, user_id, status, inputs, outputs, error,
                      failed_node, trigger_id, trigger_payload, created_at, started_at, completed_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.version)
        .bind(input.user_id)
        .bind(&input.inputs)
        .bind(input.trigger_id)
        .bind(&input.trigger_payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_execution(&self, id: Uuid, user_id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, version, user_id, status, inputs, outputs, error,
                   failed_node, trigger_id, trigger_payload, created_at, started_at, completed_at
            FROM flowmaestro.executions
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Unscoped read for engine recovery.
    pub async fn get_execution_any(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, version, user_id, status, inputs, outputs, error,
                   failed_node, trigger_id, trigger_payload, created_at, started_at, completed_at
            FROM flowmaestro.executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_executions(
        &self,
        user_id: Uuid,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRow>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, version, user_id, status, inputs, outputs, error,
                   failed_node, trigger_id, trigger_payload, created_at, started_at, completed_at
            FROM flowmaestro.executions
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR workflow_id = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(&filter.status)
        .bind(filter.workflow_id)
        .bind(if filter.limit > 0 { filter.limit } else { 20 })
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_running_executions(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM flowmaestro.executions
            WHERE user_id = $1 AND status IN ('pending', 'running', 'waiting_for_input')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn update_execution_status(
        &self,
        id: Uuid,
        status: &str,
        outputs: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        failed_node: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flowmaestro.executions
            SET status = $2,
                outputs = COALESCE($3, outputs),
                error = COALESCE($4, error),
                failed_node = COALESCE($5, failed_node),
                started_at = CASE WHEN started_at IS NULL AND $2 <> 'pending' THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&outputs)
        .bind(&error)
        .bind(&failed_node)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Execution logs
    // ============================================

    /// Append one log entry. Entries with a dedupe key are idempotent:
    /// replays hit the unique index and are dropped.
    pub async fn append_log(
        &self,
        execution_id: Uuid,
        node: Option<&str>,
        level: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
        dedupe: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flowmaestro.execution_logs
                (execution_id, node, level, message, payload, dedupe, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id, dedupe) WHERE dedupe IS NOT NULL DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(node)
        .bind(level)
        .bind(message)
        .bind(payload)
        .bind(dedupe)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_logs(
        &self,
        execution_id: Uuid,
        filter: LogFilter,
    ) -> Result<Vec<ExecutionLogRow>> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(
            r#"
            SELECT seq, execution_id, node, level, message, payload, created_at
            FROM flowmaestro.execution_logs
            WHERE execution_id = $1
              AND ($2::bigint IS NULL OR seq > $2)
              AND ($3::text IS NULL OR level = $3)
              AND ($4::text IS NULL OR node = $4)
            ORDER BY seq ASC
            LIMIT $5
            "#,
        )
        .bind(execution_id)
        .bind(filter.min_seq)
        .bind(&filter.level)
        .bind(&filter.node)
        .bind(if filter.limit > 0 { filter.limit } else { 200 })
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Triggers
    // ============================================

    pub async fn create_trigger(&self, input: CreateTrigger) -> Result<TriggerRow> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            INSERT INTO flowmaestro.workflow_triggers
                (id, workflow_id, user_id, name, kind, config, enabled, secret)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                      last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.kind)
        .bind(&input.config)
        .bind(input.enabled)
        .bind(&input.secret)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_trigger(&self, id: Uuid, user_id: Uuid) -> Result<Option<TriggerRow>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                   last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                   created_at, updated_at
            FROM flowmaestro.workflow_triggers
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Webhook ingress lookup: unscoped by user, scoped by workflow + id.
    pub async fn get_trigger_for_webhook(
        &self,
        workflow_id: Uuid,
        trigger_id: Uuid,
    ) -> Result<Option<TriggerRow>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                   last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                   created_at, updated_at
            FROM flowmaestro.workflow_triggers
            WHERE id = $1 AND workflow_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(trigger_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_triggers(
        &self,
        user_id: Uuid,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<TriggerRow>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                   last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                   created_at, updated_at
            FROM flowmaestro.workflow_triggers
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR workflow_id = $2)
              AND deleted_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// All enabled schedule triggers, for scheduler startup.
    pub async fn list_enabled_schedules(&self) -> Result<Vec<TriggerRow>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                   last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                   created_at, updated_at
            FROM flowmaestro.workflow_triggers
            WHERE kind = 'schedule' AND enabled = TRUE AND deleted_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn update_trigger(
        &self,
        id: Uuid,
        user_id: Uuid,
        input: UpdateTrigger,
    ) -> Result<Option<TriggerRow>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            UPDATE flowmaestro.workflow_triggers
            SET
                name = COALESCE($3, name),
                config = COALESCE($4, config),
                enabled = COALESCE($5, enabled),
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            RETURNING id, workflow_id, user_id, name, kind, config, enabled, trigger_count,
                      last_fired_at, next_fire_at, schedule_handle, secret, deleted_at,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(&input.name)
        .bind(&input.config)
        .bind(input.enabled)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn soft_delete_trigger(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flowmaestro.workflow_triggers
            SET deleted_at = NOW(), enabled = FALSE, schedule_handle = NULL, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_schedule_handle(
        &self,
        id: Uuid,
        handle: Option<&str>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flowmaestro.workflow_triggers
            SET schedule_handle = $2, next_fire_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(handle)
        .bind(next_fire_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One fire: bump the counter by exactly one and record the execution.
    pub async fn record_trigger_fire(
        &self,
        trigger_id: Uuid,
        execution_id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE flowmaestro.workflow_triggers
            SET trigger_count = trigger_count + 1,
                last_fired_at = NOW(),
                next_fire_at = COALESCE($2, next_fire_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(trigger_id)
        .bind(next_fire_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO flowmaestro.trigger_executions (trigger_id, execution_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(trigger_id)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_trigger_executions(
        &self,
        trigger_id: Uuid,
        limit: i64,
    ) -> Result<Vec<TriggerExecutionRow>> {
        let rows = sqlx::query_as::<_, TriggerExecutionRow>(
            r#"
            SELECT id, trigger_id, execution_id, fired_at
            FROM flowmaestro.trigger_executions
            WHERE trigger_id = $1
            ORDER BY fired_at DESC
            LIMIT $2
            "#,
        )
        .bind(trigger_id)
        .bind(if limit > 0 { limit } else { 50 })
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Webhook logs
    // ============================================

    pub async fn create_webhook_log(&self, input: CreateWebhookLog) -> Result<WebhookLogRow> {
        let row = sqlx::query_as::<_, WebhookLogRow>(
            r#"
            INSERT INTO flowmaestro.webhook_logs
                (id, workflow_id, trigger_id, method, path, headers, query, body,
                 response_status, response_body, execution_id, source_ip, duration_ms, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id, workflow_id, trigger_id, method, path, headers, query, body,
                      response_status, response_body, execution_id, source_ip, duration_ms,
                      error, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.trigger_id)
        .bind(&input.method)
        .bind(&input.path)
        .bind(&input.headers)
        .bind(&input.query)
        .bind(&input.body)
        .bind(input.response_status)
        .bind(&input.response_body)
        .bind(input.execution_id)
        .bind(&input.source_ip)
        .bind(input.duration_ms)
        .bind(&input.error)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_webhook_logs(
        &self,
        trigger_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WebhookLogRow>> {
        let rows = sqlx::query_as::<_, WebhookLogRow>(
            r#"
            SELECT l.id, l.workflow_id, l.trigger_id, l.method, l.path, l.headers, l.query,
                   l.body, l.response_status, l.response_body, l.execution_id, l.source_ip,
                   l.duration_ms, l.error, l.created_at
            FROM flowmaestro.webhook_logs l
            JOIN flowmaestro.workflow_triggers t ON t.id = l.trigger_id
            WHERE l.trigger_id = $1 AND t.user_id = $2
            ORDER BY l.created_at DESC
            LIMIT $3
            "#,
        )
        .bind(trigger_id)
        .bind(user_id)
        .bind(if limit > 0 { limit } else { 50 })
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Connections
    // ============================================

    pub async fn create_database_connection(
        &self,
        user_id: Uuid,
        name: &str,
        encrypted_config: &str,
    ) -> Result<DatabaseConnectionRow> {
        let row = sqlx::query_as::<_, DatabaseConnectionRow>(
            r#"
            INSERT INTO flowmaestro.database_connections (id, user_id, name, encrypted_config)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, name, encrypted_config, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(name)
        .bind(encrypted_config)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_database_connection(
        &self,
        id: Uuid,
    ) -> Result<Option<DatabaseConnectionRow>> {
        let row = sqlx::query_as::<_, DatabaseConnectionRow>(
            r#"
            SELECT id, user_id, name, encrypted_config, created_at
            FROM flowmaestro.database_connections
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_database_connections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DatabaseConnectionRow>> {
        let rows = sqlx::query_as::<_, DatabaseConnectionRow>(
            r#"
            SELECT id, user_id, name, encrypted_config, created_at
            FROM flowmaestro.database_connections
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn delete_database_connection(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM flowmaestro.database_connections WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn create_integration_connection(
        &self,
        user_id: Uuid,
        provider: &str,
        name: &str,
        encrypted_credentials: &str,
    ) -> Result<IntegrationConnectionRow> {
        let row = sqlx::query_as::<_, IntegrationConnectionRow>(
            r#"
            INSERT INTO flowmaestro.integration_connections
                (id, user_id, provider, name, encrypted_credentials)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, provider, name, encrypted_credentials, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(provider)
        .bind(name)
        .bind(encrypted_credentials)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_integration_connection(
        &self,
        id: Uuid,
    ) -> Result<Option<IntegrationConnectionRow>> {
        let row = sqlx::query_as::<_, IntegrationConnectionRow>(
            r#"
            SELECT id, user_id, provider, name, encrypted_credentials, created_at
            FROM flowmaestro.integration_connections
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_integration_connections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<IntegrationConnectionRow>> {
        let rows = sqlx::query_as::<_, IntegrationConnectionRow>(
            r#"
            SELECT id, user_id, provider, name, encrypted_credentials, created_at
            FROM flowmaestro.integration_connections
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn delete_integration_connection(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM flowmaestro.integration_connections WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
