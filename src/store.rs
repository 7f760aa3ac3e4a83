use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::models::{BillingEvent, EventFilter};
use crate::error::{AppError, AppResult};
use crate::servers::{ServerPatch, StreamServer};

pub mod postgres;
pub mod testing;

pub use postgres::PgStore;

/// Half-open `[start, end)` window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub start: i64,
    pub end: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { start: 0, end: 10 }
    }
}

impl Pagination {
    pub fn new(start: i64, end: i64) -> AppResult<Self> {
        if start < 0 || end < start {
            return Err(AppError::Validation(format!(
                "invalid page window {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn unbounded() -> Self {
        Self {
            start: 0,
            end: i64::MAX,
        }
    }

    pub fn limit(&self) -> i64 {
        self.end - self.start
    }

    pub fn next(&self) -> Self {
        let size = self.limit();
        Self {
            start: self.end,
            end: self.end.saturating_add(size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub start: i64,
    pub end: i64,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(results: Vec<T>, page: Pagination, total: i64) -> Self {
        Self {
            results,
            start: page.start,
            end: page.end,
            total,
        }
    }
}

/// key: store-servers -> stream server persistence
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn insert_server(&self, server: &StreamServer) -> AppResult<()>;

    async fn find_server(&self, id: Uuid) -> AppResult<Option<StreamServer>>;

    async fn list_servers(&self, owner_id: Uuid, page: Pagination)
        -> AppResult<Page<StreamServer>>;

    /// Applies `patch` and returns the updated row, `NotFound` when the row is gone.
    async fn update_server(&self, id: Uuid, patch: &ServerPatch) -> AppResult<StreamServer>;

    /// Returns whether a row was removed.
    async fn delete_server(&self, id: Uuid) -> AppResult<bool>;
}

/// key: store-billing-events -> ledger persistence with conditional writes
#[async_trait]
pub trait BillingEventStore: Send + Sync {
    /// Inserts an open event; `Conflict` when the resource already has one.
    async fn insert_open_event(&self, event: &BillingEvent) -> AppResult<()>;

    async fn find_event(&self, id: Uuid) -> AppResult<Option<BillingEvent>>;

    /// Ordered by start time, then id.
    async fn find_events(
        &self,
        filter: &EventFilter,
        page: Pagination,
    ) -> AppResult<Page<BillingEvent>>;

    /// Sets the end time only if the event is still open. Returns whether it was.
    async fn close_event(&self, id: Uuid, ended_at: DateTime<Utc>) -> AppResult<bool>;

    /// Sets invoice fields only if no invoice reference exists yet. Returns whether it was set.
    async fn mark_invoiced(
        &self,
        id: Uuid,
        invoice_item_id: &str,
        amount_billed: Decimal,
    ) -> AppResult<bool>;
}
