#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use streamhost::billing::{
    BillingEvent, BillingLedger, BillingService, ChargeEngine, UsageAggregator,
};
use streamhost::config::BillingConfig;
use streamhost::notifications::testing::RecordingNotificationBus;
use streamhost::owners::testing::StaticCustomerDirectory;
use streamhost::payments::testing::InMemoryPaymentGateway;
use streamhost::provisioning::testing::InMemoryProvisioner;
use streamhost::servers::ServerOrchestrator;
use streamhost::store::testing::InMemoryStore;

pub const PLAN: &str = "plan_stream_hourly";
/// 1.50 per billed hour.
pub const PLAN_RATE: i64 = 150;

/// Every component wired against in-memory doubles.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub payments: Arc<InMemoryPaymentGateway>,
    pub customers: Arc<StaticCustomerDirectory>,
    pub provisioner: Arc<InMemoryProvisioner>,
    pub notifier: Arc<RecordingNotificationBus>,
    pub ledger: BillingLedger,
    pub engine: ChargeEngine,
    pub billing: BillingService,
    pub orchestrator: ServerOrchestrator,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let payments = Arc::new(InMemoryPaymentGateway::new());
        payments.add_plan(PLAN, PLAN_RATE).await;
        let customers = Arc::new(StaticCustomerDirectory::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let notifier = Arc::new(RecordingNotificationBus::new());

        let mut config = BillingConfig::new(PLAN);
        config.call_timeout = Duration::from_secs(5);

        let ledger = BillingLedger::new(store.clone());
        let engine = ChargeEngine::new(
            ledger.clone(),
            store.clone(),
            payments.clone(),
            customers.clone(),
            config.call_timeout,
        );
        let billing = BillingService::new(ledger.clone(), engine.clone(), store.clone());
        let orchestrator = ServerOrchestrator::new(
            store.clone(),
            provisioner.clone(),
            billing.clone(),
            notifier.clone(),
            &config,
        );

        Self {
            store,
            payments,
            customers,
            provisioner,
            notifier,
            ledger,
            engine,
            billing,
            orchestrator,
        }
    }

    /// A new owner linked to a payment customer subscribed to `PLAN`.
    pub async fn subscribed_owner(&self, customer_id: &str) -> Uuid {
        let owner_id = Uuid::new_v4();
        self.customers.link(owner_id, customer_id).await;
        self.payments.add_customer(customer_id, &[PLAN]).await;
        owner_id
    }

    pub fn aggregator(&self, concurrency: usize, page_size: i64) -> UsageAggregator {
        UsageAggregator::new(self.store.clone(), self.engine.clone(), concurrency, page_size)
    }

    pub async fn event(&self, id: Uuid) -> BillingEvent {
        self.store
            .events()
            .await
            .into_iter()
            .find(|event| event.id == id)
            .expect("billing event exists")
    }

    pub async fn open_events_for(&self, resource_id: Uuid) -> Vec<BillingEvent> {
        self.store
            .events()
            .await
            .into_iter()
            .filter(|event| event.resource_id == resource_id && event.is_open())
            .collect()
    }
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

/// A closed, uninvoiced event.
pub fn closed_event(
    owner_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> BillingEvent {
    let mut event = BillingEvent::open(Uuid::new_v4(), owner_id, PLAN, start);
    event.ended_at = Some(end);
    event
}
