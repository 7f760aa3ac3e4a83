use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{BillingEventStore, Page, Pagination, ServerStore};
use crate::billing::models::{BillingEvent, EventFilter};
use crate::error::{AppError, AppResult};
use crate::servers::{ProvisionHandle, ServerPatch, ServerStatus, StreamServer};

const SERVER_COLUMNS: &str =
    "id, owner_id, server_name, stream_name, channel_name, provision_handle, ip_address, status";

const EVENT_COLUMNS: &str =
    "id, resource_id, owner_id, plan_id, started_at, ended_at, invoice_item_id, amount_billed";

const EVENT_FILTER: &str = r#"
    WHERE ($1::uuid IS NULL OR owner_id = $1)
      AND ($2::uuid IS NULL OR resource_id = $2)
      AND (NOT $3 OR ended_at IS NULL)
      AND (NOT $4 OR invoice_item_id IS NULL)
"#;

/// key: store-postgres -> sqlx-backed servers + billing ledger
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ServerRow {
    id: Uuid,
    owner_id: Uuid,
    server_name: String,
    stream_name: String,
    channel_name: String,
    provision_handle: Option<i64>,
    ip_address: Option<String>,
    status: i16,
}

impl TryFrom<ServerRow> for StreamServer {
    type Error = AppError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        let status = ServerStatus::from_code(row.status).ok_or_else(|| {
            AppError::Internal(format!(
                "server {} has unknown status code {}",
                row.id, row.status
            ))
        })?;
        Ok(StreamServer {
            id: row.id,
            owner_id: row.owner_id,
            server_name: row.server_name,
            stream_name: row.stream_name,
            channel_name: row.channel_name,
            provision_handle: row.provision_handle.map(ProvisionHandle),
            ip_address: row.ip_address,
            status,
        })
    }
}

#[async_trait]
impl ServerStore for PgStore {
    async fn insert_server(&self, server: &StreamServer) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_servers (
                id,
                owner_id,
                server_name,
                stream_name,
                channel_name,
                provision_handle,
                ip_address,
                status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(server.id)
        .bind(server.owner_id)
        .bind(&server.server_name)
        .bind(&server.stream_name)
        .bind(&server.channel_name)
        .bind(server.provision_handle.map(|handle| handle.0))
        .bind(server.ip_address.as_deref())
        .bind(server.status.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_server(&self, id: Uuid) -> AppResult<Option<StreamServer>> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "SELECT {SERVER_COLUMNS} FROM stream_servers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StreamServer::try_from).transpose()
    }

    async fn list_servers(
        &self,
        owner_id: Uuid,
        page: Pagination,
    ) -> AppResult<Page<StreamServer>> {
        let rows = sqlx::query_as::<_, ServerRow>(&format!(
            r#"
            SELECT {SERVER_COLUMNS} FROM stream_servers
            WHERE owner_id = $1
            ORDER BY created_at, id
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(owner_id)
        .bind(page.start)
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stream_servers WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

        let servers = rows
            .into_iter()
            .map(StreamServer::try_from)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Page::new(servers, page, total))
    }

    async fn update_server(&self, id: Uuid, patch: &ServerPatch) -> AppResult<StreamServer> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            r#"
            UPDATE stream_servers SET
                server_name = COALESCE($2, server_name),
                stream_name = COALESCE($3, stream_name),
                provision_handle = COALESCE($4, provision_handle),
                ip_address = COALESCE($5, ip_address),
                status = COALESCE($6, status),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SERVER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.server_name.as_deref())
        .bind(patch.stream_name.as_deref())
        .bind(patch.provision_handle.map(|handle| handle.0))
        .bind(patch.ip_address.as_deref())
        .bind(patch.status.map(ServerStatus::code))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => StreamServer::try_from(row),
            None => Err(AppError::NotFound(format!("server {id}"))),
        }
    }

    async fn delete_server(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM stream_servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BillingEventStore for PgStore {
    async fn insert_open_event(&self, event: &BillingEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id,
                resource_id,
                owner_id,
                plan_id,
                started_at,
                ended_at,
                invoice_item_id,
                amount_billed
            ) VALUES ($1, $2, $3, $4, $5, NULL, NULL, 0)
            "#,
        )
        .bind(event.id)
        .bind(event.resource_id)
        .bind(event.owner_id)
        .bind(&event.plan_id)
        .bind(event.started_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match AppError::from(err) {
            AppError::Conflict(_) => AppError::Conflict(format!(
                "resource {} already has an open billing event",
                event.resource_id
            )),
            other => other,
        })?;
        Ok(())
    }

    async fn find_event(&self, id: Uuid) -> AppResult<Option<BillingEvent>> {
        let event = sqlx::query_as::<_, BillingEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn find_events(
        &self,
        filter: &EventFilter,
        page: Pagination,
    ) -> AppResult<Page<BillingEvent>> {
        let events = sqlx::query_as::<_, BillingEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events {EVENT_FILTER} ORDER BY started_at, id OFFSET $5 LIMIT $6"
        ))
        .bind(filter.owner_id)
        .bind(filter.resource_id)
        .bind(filter.open_only)
        .bind(filter.uninvoiced_only)
        .bind(page.start)
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM billing_events {EVENT_FILTER}"))
                .bind(filter.owner_id)
                .bind(filter.resource_id)
                .bind(filter.open_only)
                .bind(filter.uninvoiced_only)
                .fetch_one(&self.pool)
                .await?;

        Ok(Page::new(events, page, total))
    }

    async fn close_event(&self, id: Uuid, ended_at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE billing_events SET ended_at = $2 WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(id)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_invoiced(
        &self,
        id: Uuid,
        invoice_item_id: &str,
        amount_billed: Decimal,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_events
            SET invoice_item_id = $2, amount_billed = $3
            WHERE id = $1 AND invoice_item_id IS NULL
            "#,
        )
        .bind(id)
        .bind(invoice_item_id)
        .bind(amount_billed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
