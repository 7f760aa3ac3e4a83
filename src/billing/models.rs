use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::AppError;

/// Invoice reference written instead of a provider usage id when usage is voided.
pub const CANCELLED_INVOICE: &str = "cancelled";

/// key: billing-models -> metered usage intervals
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub owner_id: Uuid,
    pub plan_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Write-once; once set the event is never charged again.
    pub invoice_item_id: Option<String>,
    pub amount_billed: Decimal,
}

impl BillingEvent {
    pub fn open(resource_id: Uuid, owner_id: Uuid, plan_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id,
            owner_id,
            plan_id: plan_id.to_string(),
            started_at: now,
            ended_at: None,
            invoice_item_id: None,
            amount_billed: Decimal::ZERO,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn is_invoiced(&self) -> bool {
        self.invoice_item_id.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.invoice_item_id.as_deref() == Some(CANCELLED_INVOICE)
    }
}

/// Selection criteria for billing event queries. Every set field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub owner_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    #[serde(default)]
    pub open_only: bool,
    #[serde(default)]
    pub uninvoiced_only: bool,
}

impl EventFilter {
    pub fn open_for_resource(resource_id: Uuid) -> Self {
        Self {
            resource_id: Some(resource_id),
            open_only: true,
            ..Self::default()
        }
    }

    pub fn uninvoiced() -> Self {
        Self {
            uninvoiced_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &BillingEvent) -> bool {
        self.owner_id.map_or(true, |owner| event.owner_id == owner)
            && self.resource_id.map_or(true, |resource| event.resource_id == resource)
            && (!self.open_only || event.is_open())
            && (!self.uninvoiced_only || !event.is_invoiced())
    }
}

/// Result of charging one event against the payment provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargedEvent {
    pub event_id: Uuid,
    pub units: i64,
    pub invoice_item_id: String,
    pub amount_billed: Decimal,
    /// Open event created to keep accruing usage past the billing boundary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carry_over_id: Option<Uuid>,
}

/// key: billing-aggregation-report -> per-run outcome
#[derive(Debug, Default)]
pub struct AggregationReport {
    pub owners_attempted: usize,
    pub events_charged: usize,
    pub charged: Vec<ChargedEvent>,
    pub failures: Vec<GroupFailure>,
}

impl AggregationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct GroupFailure {
    pub owner_id: Uuid,
    /// Events charged before the failure stopped the group.
    pub events_charged: usize,
    pub error: AppError,
}
