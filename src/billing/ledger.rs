use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{BillingEvent, EventFilter};
use crate::error::AppResult;
use crate::store::{BillingEventStore, Pagination};

/// key: billing-ledger -> open/close usage intervals
///
/// The one-open-event-per-resource rule lives in the store's conditional insert,
/// so several service instances can share a ledger without coordinating.
#[derive(Clone)]
pub struct BillingLedger {
    events: Arc<dyn BillingEventStore>,
}

impl BillingLedger {
    pub fn new(events: Arc<dyn BillingEventStore>) -> Self {
        Self { events }
    }

    /// Opens a usage interval at `now`. `Conflict` when the resource already has one open.
    pub async fn start(
        &self,
        resource_id: Uuid,
        owner_id: Uuid,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BillingEvent> {
        let event = BillingEvent::open(resource_id, owner_id, plan_id, now);
        self.events.insert_open_event(&event).await?;
        info!(
            event_id = %event.id,
            %resource_id,
            %owner_id,
            plan = %plan_id,
            "billing started"
        );
        Ok(event)
    }

    pub async fn open_events(&self, resource_id: Uuid) -> AppResult<Vec<BillingEvent>> {
        let page = self
            .events
            .find_events(
                &EventFilter::open_for_resource(resource_id),
                Pagination::unbounded(),
            )
            .await?;
        Ok(page.results)
    }

    /// Closes `event` at `now` unless another writer closed it first.
    pub async fn close(
        &self,
        event: &BillingEvent,
        now: DateTime<Utc>,
    ) -> AppResult<CloseOutcome> {
        if self.events.close_event(event.id, now).await? {
            let mut closed = event.clone();
            closed.ended_at = Some(now);
            debug!(event_id = %event.id, resource_id = %event.resource_id, "billing event closed");
            return Ok(CloseOutcome::Closed(closed));
        }
        debug!(event_id = %event.id, "billing event already closed elsewhere");
        Ok(match self.events.find_event(event.id).await? {
            Some(stored) => CloseOutcome::AlreadyClosed(stored),
            None => CloseOutcome::Missing,
        })
    }
}

/// Result of `BillingLedger::close`.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// This call set the end time.
    Closed(BillingEvent),
    /// Another writer closed it first; the event as stored now.
    AlreadyClosed(BillingEvent),
    Missing,
}

impl CloseOutcome {
    pub fn into_event(self) -> Option<BillingEvent> {
        match self {
            CloseOutcome::Closed(event) | CloseOutcome::AlreadyClosed(event) => Some(event),
            CloseOutcome::Missing => None,
        }
    }
}
