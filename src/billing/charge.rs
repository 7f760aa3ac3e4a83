use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ledger::{BillingLedger, CloseOutcome};
use super::models::{BillingEvent, ChargedEvent};
use crate::error::{bounded, AppError, AppResult};
use crate::owners::CustomerDirectory;
use crate::payments::{PaymentCustomer, PaymentGateway, Plan};
use crate::store::BillingEventStore;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Whole hours billed for an interval, rounded up. Empty or inverted intervals bill nothing.
pub fn billed_units(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + MILLIS_PER_HOUR - 1) / MILLIS_PER_HOUR
}

/// `quantity × (rate / 100)`, with the rate in the smallest currency unit.
pub fn amount_billed(quantity: i64, unit_amount: i64) -> Decimal {
    Decimal::from(quantity) * Decimal::new(unit_amount, 2)
}

/// A charge call that stopped early. Events in `charged` stay charged.
#[derive(Debug, Error)]
#[error("{error} ({} event(s) charged before the failure)", .charged.len())]
pub struct ChargeFailure {
    pub charged: Vec<ChargedEvent>,
    pub error: AppError,
}

impl ChargeFailure {
    fn abort(charged: Vec<ChargedEvent>, error: AppError) -> Self {
        Self { charged, error }
    }
}

/// key: billing-charge-engine -> usage records + invoice markers
#[derive(Clone)]
pub struct ChargeEngine {
    ledger: BillingLedger,
    events: Arc<dyn BillingEventStore>,
    payments: Arc<dyn PaymentGateway>,
    customers: Arc<dyn CustomerDirectory>,
    call_timeout: Duration,
}

impl ChargeEngine {
    pub fn new(
        ledger: BillingLedger,
        events: Arc<dyn BillingEventStore>,
        payments: Arc<dyn PaymentGateway>,
        customers: Arc<dyn CustomerDirectory>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            events,
            payments,
            customers,
            call_timeout,
        }
    }

    /// Charges `events`, all owned by `owner_id`, one at a time in start order.
    ///
    /// Still-open events are closed at `now` and a carry-over event is opened for the
    /// same resource and plan, unless another writer closed the event first. The first
    /// failure stops the remaining events; the ones already charged keep their invoice
    /// reference.
    ///
    /// The plan rate is looked up before usage is submitted, so a missing plan fails
    /// the event before anything is recorded with the payment provider.
    pub async fn charge(
        &self,
        owner_id: Uuid,
        mut events: Vec<BillingEvent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChargedEvent>, ChargeFailure> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(foreign) = events.iter().find(|event| event.owner_id != owner_id) {
            return Err(ChargeFailure::abort(
                Vec::new(),
                AppError::Validation(format!(
                    "billing event {} does not belong to owner {owner_id}",
                    foreign.id
                )),
            ));
        }
        events.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));

        let customer = self
            .resolve_customer(owner_id)
            .await
            .map_err(|error| ChargeFailure::abort(Vec::new(), error))?;

        let mut plans: HashMap<String, Plan> = HashMap::new();
        let mut charged = Vec::with_capacity(events.len());
        for event in events {
            match self.charge_one(&customer, &mut plans, event, now).await {
                Ok(Some(outcome)) => charged.push(outcome),
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        %owner_id,
                        charged = charged.len(),
                        ?error,
                        "charge stopped; remaining events left uninvoiced"
                    );
                    return Err(ChargeFailure::abort(charged, error));
                }
            }
        }

        info!(%owner_id, events = charged.len(), "usage charged");
        Ok(charged)
    }

    async fn resolve_customer(&self, owner_id: Uuid) -> AppResult<PaymentCustomer> {
        let customer_id = bounded(
            "accounts",
            self.call_timeout,
            self.customers.payment_customer_id(owner_id),
        )
        .await
        .map_err(as_dependency)?;
        bounded(
            "payments",
            self.call_timeout,
            self.payments.get_customer(&customer_id),
        )
        .await
        .map_err(as_dependency)
    }

    async fn charge_one(
        &self,
        customer: &PaymentCustomer,
        plans: &mut HashMap<String, Plan>,
        event: BillingEvent,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ChargedEvent>> {
        // the caller's copy may predate a concurrent stop or charge
        let Some(mut event) = self.events.find_event(event.id).await? else {
            debug!(event_id = %event.id, "billing event disappeared before charging");
            return Ok(None);
        };
        if event.is_invoiced() {
            debug!(event_id = %event.id, "billing event already invoiced");
            return Ok(None);
        }

        let mut carry_over_id = None;
        if event.is_open() {
            match self.ledger.close(&event, now).await? {
                CloseOutcome::Closed(closed) => {
                    event = closed;
                    let carry_over = self
                        .ledger
                        .start(event.resource_id, event.owner_id, &event.plan_id, now)
                        .await?;
                    carry_over_id = Some(carry_over.id);
                }
                // a concurrent stop ended the usage; no carry-over
                CloseOutcome::AlreadyClosed(stored) if !stored.is_invoiced() => event = stored,
                CloseOutcome::AlreadyClosed(_) | CloseOutcome::Missing => return Ok(None),
            }
        }
        let ended_at = event.ended_at.unwrap_or(now);
        let units = billed_units(event.started_at, ended_at);

        let item = customer
            .subscription_item_for(&event.plan_id)
            .ok_or_else(|| {
                AppError::BusinessRule(format!(
                    "customer {} is not subscribed to plan {}",
                    customer.id, event.plan_id
                ))
            })?;

        let unit_amount = match plans.get(&event.plan_id) {
            Some(plan) => plan.amount,
            None => {
                let plan = bounded(
                    "payments",
                    self.call_timeout,
                    self.payments.get_plan(&event.plan_id),
                )
                .await?;
                let amount = plan.amount;
                plans.insert(event.plan_id.clone(), plan);
                amount
            }
        };

        let usage = bounded(
            "payments",
            self.call_timeout,
            self.payments
                .record_usage(&item.id, units, now, &event.id.to_string()),
        )
        .await
        .map_err(as_dependency)?;

        let amount = amount_billed(usage.quantity, unit_amount);
        if !self.events.mark_invoiced(event.id, &usage.id, amount).await? {
            return Err(AppError::Conflict(format!(
                "billing event {} was invoiced concurrently",
                event.id
            )));
        }

        debug!(
            event_id = %event.id,
            resource_id = %event.resource_id,
            units,
            %amount,
            invoice_item = %usage.id,
            "billing event invoiced"
        );
        Ok(Some(ChargedEvent {
            event_id: event.id,
            units,
            invoice_item_id: usage.id,
            amount_billed: amount,
            carry_over_id,
        }))
    }
}

fn as_dependency(error: AppError) -> AppError {
    match error {
        AppError::Dependency { .. } => error,
        other => AppError::dependency("payments", other.to_string()),
    }
}
