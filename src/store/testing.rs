//! In-memory store used by tests and local runs without Postgres.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingEventStore, Page, Pagination, ServerStore};
use crate::billing::models::{BillingEvent, EventFilter};
use crate::error::{AppError, AppResult};
use crate::servers::{ServerPatch, StreamServer};

/// Store operations that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    InsertServer,
    FindServer,
    UpdateServer,
    DeleteServer,
    InsertEvent,
    FindEvents,
    CloseEvent,
    MarkInvoiced,
}

#[derive(Default)]
pub struct InMemoryStore {
    servers: Mutex<Vec<StreamServer>>,
    events: Mutex<Vec<BillingEvent>>,
    failing: Mutex<HashSet<StoreOp>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, op: StoreOp) {
        self.failing.lock().await.insert(op);
    }

    pub async fn recover(&self, op: StoreOp) {
        self.failing.lock().await.remove(&op);
    }

    pub async fn servers(&self) -> Vec<StreamServer> {
        self.servers.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<BillingEvent> {
        self.events.lock().await.clone()
    }

    /// Inserts rows as-is, skipping the open-event check.
    pub async fn seed_event(&self, event: BillingEvent) {
        self.events.lock().await.push(event);
    }

    pub async fn seed_server(&self, server: StreamServer) {
        self.servers.lock().await.push(server);
    }

    async fn check(&self, op: StoreOp) -> AppResult<()> {
        if self.failing.lock().await.contains(&op) {
            return Err(AppError::dependency("store", format!("{op:?} unavailable")));
        }
        Ok(())
    }
}

fn window<T: Clone>(items: &[T], page: Pagination) -> Vec<T> {
    let start = usize::try_from(page.start).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.limit()).unwrap_or(usize::MAX);
    items.iter().skip(start).take(limit).cloned().collect()
}

#[async_trait]
impl ServerStore for InMemoryStore {
    async fn insert_server(&self, server: &StreamServer) -> AppResult<()> {
        self.check(StoreOp::InsertServer).await?;
        let mut guard = self.servers.lock().await;
        if guard.iter().any(|existing| existing.id == server.id) {
            return Err(AppError::Conflict(format!("server {} exists", server.id)));
        }
        guard.push(server.clone());
        Ok(())
    }

    async fn find_server(&self, id: Uuid) -> AppResult<Option<StreamServer>> {
        self.check(StoreOp::FindServer).await?;
        let guard = self.servers.lock().await;
        Ok(guard.iter().find(|server| server.id == id).cloned())
    }

    async fn list_servers(
        &self,
        owner_id: Uuid,
        page: Pagination,
    ) -> AppResult<Page<StreamServer>> {
        self.check(StoreOp::FindServer).await?;
        let guard = self.servers.lock().await;
        let owned: Vec<StreamServer> = guard
            .iter()
            .filter(|server| server.owner_id == owner_id)
            .cloned()
            .collect();
        let total = owned.len() as i64;
        Ok(Page::new(window(&owned, page), page, total))
    }

    async fn update_server(&self, id: Uuid, patch: &ServerPatch) -> AppResult<StreamServer> {
        self.check(StoreOp::UpdateServer).await?;
        let mut guard = self.servers.lock().await;
        let server = guard
            .iter_mut()
            .find(|server| server.id == id)
            .ok_or_else(|| AppError::NotFound(format!("server {id}")))?;
        patch.apply(server);
        Ok(server.clone())
    }

    async fn delete_server(&self, id: Uuid) -> AppResult<bool> {
        self.check(StoreOp::DeleteServer).await?;
        let mut guard = self.servers.lock().await;
        let before = guard.len();
        guard.retain(|server| server.id != id);
        Ok(guard.len() < before)
    }
}

#[async_trait]
impl BillingEventStore for InMemoryStore {
    async fn insert_open_event(&self, event: &BillingEvent) -> AppResult<()> {
        self.check(StoreOp::InsertEvent).await?;
        let mut guard = self.events.lock().await;
        if guard
            .iter()
            .any(|existing| existing.resource_id == event.resource_id && existing.is_open())
        {
            return Err(AppError::Conflict(format!(
                "resource {} already has an open billing event",
                event.resource_id
            )));
        }
        guard.push(event.clone());
        Ok(())
    }

    async fn find_event(&self, id: Uuid) -> AppResult<Option<BillingEvent>> {
        self.check(StoreOp::FindEvents).await?;
        let guard = self.events.lock().await;
        Ok(guard.iter().find(|event| event.id == id).cloned())
    }

    async fn find_events(
        &self,
        filter: &EventFilter,
        page: Pagination,
    ) -> AppResult<Page<BillingEvent>> {
        self.check(StoreOp::FindEvents).await?;
        let guard = self.events.lock().await;
        let mut matching: Vec<BillingEvent> = guard
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        let total = matching.len() as i64;
        Ok(Page::new(window(&matching, page), page, total))
    }

    async fn close_event(&self, id: Uuid, ended_at: DateTime<Utc>) -> AppResult<bool> {
        self.check(StoreOp::CloseEvent).await?;
        let mut guard = self.events.lock().await;
        match guard.iter_mut().find(|event| event.id == id && event.is_open()) {
            Some(event) => {
                event.ended_at = Some(ended_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_invoiced(
        &self,
        id: Uuid,
        invoice_item_id: &str,
        amount_billed: Decimal,
    ) -> AppResult<bool> {
        self.check(StoreOp::MarkInvoiced).await?;
        let mut guard = self.events.lock().await;
        match guard
            .iter_mut()
            .find(|event| event.id == id && !event.is_invoiced())
        {
            Some(event) => {
                event.invoice_item_id = Some(invoice_item_id.to_string());
                event.amount_billed = amount_billed;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
