pub mod aggregator;
pub mod charge;
pub mod ledger;
pub mod models;
pub mod service;

pub use aggregator::{spawn as spawn_usage_aggregator, UsageAggregator};
pub use charge::{amount_billed, billed_units, ChargeEngine, ChargeFailure};
pub use ledger::{BillingLedger, CloseOutcome};
pub use models::{
    AggregationReport, BillingEvent, ChargedEvent, EventFilter, GroupFailure, CANCELLED_INVOICE,
};
pub use service::{BillingService, StoppedBilling};
