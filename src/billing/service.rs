use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::charge::ChargeEngine;
use super::ledger::BillingLedger;
use super::models::{BillingEvent, ChargedEvent, EventFilter, CANCELLED_INVOICE};
use crate::error::{AppError, AppResult};
use crate::store::{BillingEventStore, Page, Pagination};

/// What `BillingService::stop` closed and how much of it was charged right away.
#[derive(Debug)]
pub struct StoppedBilling {
    pub closed: Vec<BillingEvent>,
    pub charged: Vec<ChargedEvent>,
    /// Set when charging failed; the closed events wait for the next aggregation run.
    pub charge_error: Option<AppError>,
}

/// key: billing-service -> ledger lifecycle used by the server orchestrator
#[derive(Clone)]
pub struct BillingService {
    ledger: BillingLedger,
    engine: ChargeEngine,
    events: Arc<dyn BillingEventStore>,
}

impl BillingService {
    pub fn new(
        ledger: BillingLedger,
        engine: ChargeEngine,
        events: Arc<dyn BillingEventStore>,
    ) -> Self {
        Self {
            ledger,
            engine,
            events,
        }
    }

    pub fn engine(&self) -> &ChargeEngine {
        &self.engine
    }

    pub async fn start(
        &self,
        resource_id: Uuid,
        owner_id: Uuid,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BillingEvent> {
        self.ledger.start(resource_id, owner_id, plan_id, now).await
    }

    /// Closes the resource's open event at `now` and charges it.
    ///
    /// `NotFound` when nothing is open; the charge engine is not invoked then.
    /// More than one open event is closed and charged, then reported as `Internal`.
    pub async fn stop(&self, resource_id: Uuid, now: DateTime<Utc>) -> AppResult<StoppedBilling> {
        let open = self.ledger.open_events(resource_id).await?;
        if open.is_empty() {
            return Err(AppError::NotFound(format!(
                "no open billing event for resource {resource_id}"
            )));
        }
        let duplicated = open.len() > 1;
        if duplicated {
            error!(
                %resource_id,
                open = open.len(),
                "resource had several open billing events; closing all"
            );
        }

        let mut closed = Vec::with_capacity(open.len());
        for event in &open {
            if let Some(event) = self.ledger.close(event, now).await?.into_event() {
                if !event.is_invoiced() {
                    closed.push(event);
                }
            }
        }
        if closed.is_empty() {
            return Err(AppError::NotFound(format!(
                "billing for resource {resource_id} was stopped concurrently"
            )));
        }

        let mut by_owner: BTreeMap<Uuid, Vec<BillingEvent>> = BTreeMap::new();
        for event in &closed {
            by_owner.entry(event.owner_id).or_default().push(event.clone());
        }

        let mut charged = Vec::new();
        let mut charge_error = None;
        for (owner_id, events) in by_owner {
            match self.engine.charge(owner_id, events, now).await {
                Ok(outcome) => charged.extend(outcome),
                Err(failure) => {
                    warn!(
                        %resource_id,
                        %owner_id,
                        error = %failure,
                        "charging stopped billing failed; left for the next aggregation run"
                    );
                    charged.extend(failure.charged);
                    charge_error.get_or_insert(failure.error);
                }
            }
        }

        if duplicated {
            return Err(AppError::Internal(format!(
                "resource {resource_id} had {} open billing events",
                open.len()
            )));
        }

        info!(%resource_id, closed = closed.len(), charged = charged.len(), "billing stopped");
        Ok(StoppedBilling {
            closed,
            charged,
            charge_error,
        })
    }

    /// Voids closed usage that will never be charged, such as a rolled-back create.
    ///
    /// Uses the same write-once marker as charging, so events invoiced meanwhile keep
    /// their charge. Returns how many events were voided.
    pub async fn cancel(&self, events: &[BillingEvent]) -> AppResult<usize> {
        let mut cancelled = 0;
        for event in events {
            if event.is_open() {
                return Err(AppError::Conflict(format!(
                    "billing event {} is still open and cannot be cancelled",
                    event.id
                )));
            }
            if self
                .events
                .mark_invoiced(event.id, CANCELLED_INVOICE, Decimal::ZERO)
                .await?
            {
                info!(event_id = %event.id, resource_id = %event.resource_id, "billing event cancelled");
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn events_for_owner(
        &self,
        owner_id: Uuid,
        filter: EventFilter,
        page: Pagination,
    ) -> AppResult<Page<BillingEvent>> {
        let filter = EventFilter {
            owner_id: Some(owner_id),
            ..filter
        };
        self.events.find_events(&filter, page).await
    }
}
