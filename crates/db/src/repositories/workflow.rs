//! SQLite implementation of the workflow procedures.
//!
//! Every mutation runs in one transaction. Decisions open it with
//! `BEGIN IMMEDIATE` so a second writer waits for the lock instead of failing
//! its upgrade, then re-reads the committed status. Status changes are also
//! written with a compare-and-swap on the status that was read, so of two
//! concurrent decisions on the same request exactly one updates the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use esgflow_core::backend::WorkflowBackend;
use esgflow_core::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus, HistoryAction,
    NewApprovalRequest, Priority, ProcessApproval, RecordType, RequestFilter,
};
use esgflow_core::domain::module::Module;
use esgflow_core::domain::session::{TenantId, UserId};
use esgflow_core::domain::version::{snapshot_fields, VersionRecord};
use esgflow_core::errors::ApplicationError;
use esgflow_core::flows::{
    ApprovalEvent, FlowAction, FlowContext, FlowEngine, FlowTransitionError, MakerCheckerFlow,
};
use esgflow_core::sla::SlaPolicy;

use super::{
    format_timestamp, history_entry, not_found, parse_timestamp, submitted_request,
    RepositoryError,
};
use crate::DbPool;

const WRITE_TRANSACTION: &str = "BEGIN IMMEDIATE";

const REQUEST_COLUMNS: &str = "id, portfolio_company_id, module, record_id, record_type,
    current_data, previous_data, change_summary, status, maker_id, assigned_checker_id,
    priority, due_at, materiality_flag, checker_comment, reviewed_at, created_at, updated_at";

pub struct SqlWorkflowBackend {
    pool: DbPool,
    policy: SlaPolicy,
    engine: FlowEngine<MakerCheckerFlow>,
}

impl SqlWorkflowBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, policy: SlaPolicy::default(), engine: FlowEngine::default() }
    }

    pub fn with_sla_policy(mut self, policy: SlaPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn list_requests_inner(
        &self,
        tenant: &TenantId,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let module = filter.module.map(|module| module.as_str());
        let status = filter.status.map(|status| status.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_requests
             WHERE portfolio_company_id = ?
               AND (? IS NULL OR module = ?)
               AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(&tenant.0)
        .bind(module)
        .bind(module)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn find_request_inner(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_requests
             WHERE id = ? AND portfolio_company_id = ?"
        ))
        .bind(&id.0)
        .bind(&tenant.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn create_inner(
        &self,
        tenant: &TenantId,
        maker: &UserId,
        input: NewApprovalRequest,
    ) -> Result<ApprovalId, RepositoryError> {
        let now = Utc::now();
        let request = submitted_request(
            tenant,
            maker,
            input,
            self.engine.initial_state(),
            &self.policy,
            now,
        );

        let mut tx = self.pool.begin().await?;
        insert_request(&mut tx, &request).await?;
        insert_history(
            &mut tx,
            tenant,
            &history_entry(
                &request.id,
                HistoryAction::Submit,
                None,
                request.status,
                maker,
                request.change_summary.clone(),
                now,
            ),
        )
        .await?;
        tx.commit().await?;

        debug!(
            event_name = "db.approval.created",
            request_id = %request.id.0,
            priority = request.priority.as_str(),
            "approval request row inserted"
        );
        Ok(request.id)
    }

    async fn process_inner(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, RepositoryError> {
        let now = Utc::now();
        let event = ApprovalEvent::from(command.action);
        let mut tx = self.pool.begin_with(WRITE_TRANSACTION).await?;

        let current = fetch_request_tx(&mut tx, tenant, &command.request_id)
            .await?
            .ok_or_else(|| not_found(&command.request_id))?;
        let outcome = self.engine.apply(
            current.status,
            event,
            &FlowContext { record_type: current.record_type },
        )?;

        let updated = sqlx::query(
            "UPDATE approval_requests
             SET status = ?, checker_comment = COALESCE(?, checker_comment),
                 reviewed_at = ?, updated_at = ?
             WHERE id = ? AND portfolio_company_id = ? AND status = ?",
        )
        .bind(outcome.to.as_str())
        .bind(command.comment.as_deref())
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .bind(&current.id.0)
        .bind(&tenant.0)
        .bind(current.status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(lost_race(&mut tx, &current.id, event).await);
        }

        for action in &outcome.actions {
            match action {
                FlowAction::RecordHistory => {
                    let entry = history_entry(
                        &current.id,
                        HistoryAction::from(event),
                        Some(outcome.from),
                        outcome.to,
                        actor,
                        command.comment.clone(),
                        now,
                    );
                    insert_history(&mut tx, tenant, &entry).await?;
                }
                FlowAction::AppendCurrentVersion => {
                    let version = promote_version(&mut tx, &current, now).await?;
                    info!(
                        event_name = "db.version.promoted",
                        request_id = %current.id.0,
                        module = %current.module,
                        record_id = %current.record_id,
                        version_number = version,
                        "new current version appended"
                    );
                }
                FlowAction::RetireCurrentVersion => {
                    retire_current_version(&mut tx, &current, now).await?;
                }
            }
        }

        let processed = fetch_request_tx(&mut tx, tenant, &current.id)
            .await?
            .ok_or_else(|| not_found(&current.id))?;
        tx.commit().await?;
        Ok(processed)
    }

    async fn assign_inner(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        id: &ApprovalId,
        checker: &UserId,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin_with(WRITE_TRANSACTION).await?;

        let current = fetch_request_tx(&mut tx, tenant, id).await?.ok_or_else(|| not_found(id))?;
        let outcome = self.engine.apply(
            current.status,
            ApprovalEvent::AssignChecker,
            &FlowContext { record_type: current.record_type },
        )?;

        // Direct update: due_at keeps its submission-time value.
        let updated = sqlx::query(
            "UPDATE approval_requests
             SET assigned_checker_id = ?, status = ?, updated_at = ?
             WHERE id = ? AND portfolio_company_id = ? AND status = ?",
        )
        .bind(&checker.0)
        .bind(outcome.to.as_str())
        .bind(format_timestamp(now))
        .bind(&id.0)
        .bind(&tenant.0)
        .bind(current.status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(lost_race(&mut tx, id, ApprovalEvent::AssignChecker).await);
        }

        let entry = history_entry(
            id,
            HistoryAction::AssignChecker,
            Some(outcome.from),
            outcome.to,
            actor,
            Some(format!("assigned to {}", checker.0)),
            now,
        );
        insert_history(&mut tx, tenant, &entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_history_inner(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, action, from_status, to_status, actor_id, comment, created_at
             FROM approval_history
             WHERE request_id = ? AND portfolio_company_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&id.0)
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn list_versions_inner(
        &self,
        tenant: &TenantId,
        module: Module,
        record_id: &str,
    ) -> Result<Vec<VersionRecord>, RepositoryError> {
        let table = module.version_table();
        let rows = sqlx::query(&format!(
            "SELECT id, portfolio_company_id, {field} AS record_id, version_number, is_current,
                    data, approval_request_id, created_by, created_at, updated_at
             FROM {table}
             WHERE portfolio_company_id = ? AND {field} = ?
             ORDER BY version_number DESC",
            field = table.record_id_field,
            table = table.table_name,
        ))
        .bind(&tenant.0)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| version_from_row(row, module)).collect()
    }

    async fn list_open_with_due_inner(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_requests
             WHERE portfolio_company_id = ?
               AND status IN ('pending_review', 'in_review')
               AND due_at IS NOT NULL
             ORDER BY due_at ASC"
        ))
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl WorkflowBackend for SqlWorkflowBackend {
    async fn list_requests(
        &self,
        tenant: &TenantId,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        Ok(self.list_requests_inner(tenant, filter).await?)
    }

    async fn find_request(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, ApplicationError> {
        Ok(self.find_request_inner(tenant, id).await?)
    }

    async fn create_approval_request(
        &self,
        tenant: &TenantId,
        maker: &UserId,
        request: NewApprovalRequest,
    ) -> Result<ApprovalId, ApplicationError> {
        Ok(self.create_inner(tenant, maker, request).await?)
    }

    async fn process_approval_request(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, ApplicationError> {
        Ok(self.process_inner(tenant, actor, command).await?)
    }

    async fn assign_checker(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        id: &ApprovalId,
        checker: &UserId,
    ) -> Result<(), ApplicationError> {
        Ok(self.assign_inner(tenant, actor, id, checker).await?)
    }

    async fn list_history(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ApplicationError> {
        Ok(self.list_history_inner(tenant, id).await?)
    }

    async fn list_versions(
        &self,
        tenant: &TenantId,
        module: Module,
        record_id: &str,
    ) -> Result<Vec<VersionRecord>, ApplicationError> {
        Ok(self.list_versions_inner(tenant, module, record_id).await?)
    }

    async fn list_open_with_due(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        Ok(self.list_open_with_due_inner(tenant).await?)
    }
}

async fn fetch_request_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    id: &ApprovalId,
) -> Result<Option<ApprovalRequest>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM approval_requests
         WHERE id = ? AND portfolio_company_id = ?"
    ))
    .bind(&id.0)
    .bind(&tenant.0)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// Error for a compare-and-swap that matched no row: the status moved
/// between read and write.
async fn lost_race(
    tx: &mut Transaction<'_, Sqlite>,
    id: &ApprovalId,
    event: ApprovalEvent,
) -> RepositoryError {
    let status = sqlx::query("SELECT status FROM approval_requests WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(&mut **tx)
        .await;

    match status {
        Ok(Some(row)) => match row.try_get::<String, _>("status") {
            Ok(status) => match ApprovalStatus::parse(&status) {
                Some(from) => FlowTransitionError::InvalidTransition { from, event }.into(),
                None => RepositoryError::Decode(format!("unknown approval status `{status}`")),
            },
            Err(error) => RepositoryError::Decode(error.to_string()),
        },
        Ok(None) => not_found(id),
        Err(error) => error.into(),
    }
}

async fn insert_request(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
) -> Result<(), RepositoryError> {
    let current_data = encode_json(&request.current_data)?;
    let previous_data = request.previous_data.as_ref().map(encode_json).transpose()?;

    sqlx::query(&format!(
        "INSERT INTO approval_requests ({REQUEST_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&request.id.0)
    .bind(&request.tenant_id.0)
    .bind(request.module.as_str())
    .bind(&request.record_id)
    .bind(request.record_type.as_str())
    .bind(current_data)
    .bind(previous_data)
    .bind(request.change_summary.as_deref())
    .bind(request.status.as_str())
    .bind(&request.maker_id.0)
    .bind(request.assigned_checker_id.as_ref().map(|id| id.0.as_str()))
    .bind(request.priority.as_str())
    .bind(request.due_at.map(format_timestamp))
    .bind(request.materiality_flag)
    .bind(request.checker_comment.as_deref())
    .bind(request.reviewed_at.map(format_timestamp))
    .bind(format_timestamp(request.created_at))
    .bind(format_timestamp(request.updated_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    entry: &ApprovalHistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_history
            (id, request_id, portfolio_company_id, action, from_status, to_status,
             actor_id, comment, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.request_id.0)
    .bind(&tenant.0)
    .bind(entry.action.as_str())
    .bind(entry.from_status.map(|status| status.as_str()))
    .bind(entry.to_status.as_str())
    .bind(&entry.actor_id.0)
    .bind(entry.comment.as_deref())
    .bind(format_timestamp(entry.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Appends `max + 1` as the record's only current version. Returns the new number.
async fn promote_version(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
    now: DateTime<Utc>,
) -> Result<u32, RepositoryError> {
    let table = request.module.version_table();

    retire_current_version(tx, request, now).await?;

    let max_version: i64 = sqlx::query(&format!(
        "SELECT COALESCE(MAX(version_number), 0) AS max_version FROM {table}
         WHERE portfolio_company_id = ? AND {field} = ?",
        table = table.table_name,
        field = table.record_id_field,
    ))
    .bind(&request.tenant_id.0)
    .bind(&request.record_id)
    .fetch_one(&mut **tx)
    .await?
    .try_get("max_version")
    .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let next_version = max_version + 1;

    let data = encode_json(&Value::Object(snapshot_fields(&request.current_data)))?;
    sqlx::query(&format!(
        "INSERT INTO {table}
            (id, portfolio_company_id, {field}, version_number, is_current, data,
             approval_request_id, created_by, created_at, updated_at)
         VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
        table = table.table_name,
        field = table.record_id_field,
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&request.tenant_id.0)
    .bind(&request.record_id)
    .bind(next_version)
    .bind(data)
    .bind(&request.id.0)
    .bind(&request.maker_id.0)
    .bind(format_timestamp(now))
    .bind(format_timestamp(now))
    .execute(&mut **tx)
    .await?;

    u32::try_from(next_version)
        .map_err(|_| RepositoryError::Decode(format!("version number {next_version} out of range")))
}

async fn retire_current_version(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let table = request.module.version_table();
    sqlx::query(&format!(
        "UPDATE {table} SET is_current = 0, updated_at = ?
         WHERE portfolio_company_id = ? AND {field} = ? AND is_current = 1",
        table = table.table_name,
        field = table.record_id_field,
    ))
    .bind(format_timestamp(now))
    .bind(&request.tenant_id.0)
    .bind(&request.record_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn request_from_row(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let module: String = column(row, "module")?;
    let record_type: String = column(row, "record_type")?;
    let status: String = column(row, "status")?;
    let priority: String = column(row, "priority")?;
    let current_data: String = column(row, "current_data")?;
    let previous_data: Option<String> = column(row, "previous_data")?;
    let due_at: Option<String> = column(row, "due_at")?;
    let reviewed_at: Option<String> = column(row, "reviewed_at")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(ApprovalRequest {
        id: ApprovalId(column(row, "id")?),
        tenant_id: TenantId(column(row, "portfolio_company_id")?),
        module: Module::parse(&module)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown module `{module}`")))?,
        record_id: column(row, "record_id")?,
        record_type: RecordType::parse(&record_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown record type `{record_type}`"))
        })?,
        current_data: decode_json(&current_data, "current_data")?,
        previous_data: previous_data
            .as_deref()
            .map(|raw| decode_json(raw, "previous_data"))
            .transpose()?,
        change_summary: column(row, "change_summary")?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status}`")))?,
        maker_id: UserId(column(row, "maker_id")?),
        assigned_checker_id: column::<Option<String>>(row, "assigned_checker_id")?.map(UserId),
        priority: Priority::parse(&priority)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority}`")))?,
        due_at: due_at.as_deref().map(|raw| parse_timestamp(raw, "due_at")).transpose()?,
        materiality_flag: column(row, "materiality_flag")?,
        checker_comment: column(row, "checker_comment")?,
        reviewed_at: reviewed_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, "reviewed_at"))
            .transpose()?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<ApprovalHistoryEntry, RepositoryError> {
    let action: String = column(row, "action")?;
    let from_status: Option<String> = column(row, "from_status")?;
    let to_status: String = column(row, "to_status")?;
    let created_at: String = column(row, "created_at")?;

    let parse_status = |raw: &str| {
        ApprovalStatus::parse(raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{raw}`")))
    };

    Ok(ApprovalHistoryEntry {
        id: column(row, "id")?,
        request_id: ApprovalId(column(row, "request_id")?),
        action: HistoryAction::parse(&action)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown history action `{action}`")))?,
        from_status: from_status.as_deref().map(parse_status).transpose()?,
        to_status: parse_status(&to_status)?,
        actor_id: UserId(column(row, "actor_id")?),
        comment: column(row, "comment")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn version_from_row(row: &SqliteRow, module: Module) -> Result<VersionRecord, RepositoryError> {
    let version_number: i64 = column(row, "version_number")?;
    let data: String = column(row, "data")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    let data = match decode_json(&data, "data")? {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    Ok(VersionRecord {
        id: column(row, "id")?,
        tenant_id: TenantId(column(row, "portfolio_company_id")?),
        module,
        record_id: column(row, "record_id")?,
        version_number: u32::try_from(version_number).map_err(|_| {
            RepositoryError::Decode(format!("version number {version_number} out of range"))
        })?,
        is_current: column(row, "is_current")?,
        data,
        approval_request_id: column::<Option<String>>(row, "approval_request_id")?.map(ApprovalId),
        created_by: column::<Option<String>>(row, "created_by")?.map(UserId),
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn encode_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn decode_json(raw: &str, field: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}
