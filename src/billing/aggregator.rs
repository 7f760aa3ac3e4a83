use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::charge::ChargeEngine;
use super::models::{AggregationReport, BillingEvent, EventFilter, GroupFailure};
use crate::error::AppResult;
use crate::store::{BillingEventStore, Pagination};

/// key: billing-usage-aggregator -> periodic charge of uninvoiced usage
pub struct UsageAggregator {
    events: Arc<dyn BillingEventStore>,
    engine: ChargeEngine,
    concurrency: usize,
    page_size: i64,
}

impl UsageAggregator {
    pub fn new(
        events: Arc<dyn BillingEventStore>,
        engine: ChargeEngine,
        concurrency: usize,
        page_size: i64,
    ) -> Self {
        Self {
            events,
            engine,
            concurrency: concurrency.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Charges every uninvoiced event, one charge call per owner.
    ///
    /// Owner groups run concurrently up to the configured bound and the call returns
    /// only after each group has finished. A failing group is recorded in the report
    /// and its events stay uninvoiced for the next run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> AppResult<AggregationReport> {
        let pending = self.uninvoiced().await?;
        let mut groups: BTreeMap<Uuid, Vec<BillingEvent>> = BTreeMap::new();
        for event in pending {
            groups.entry(event.owner_id).or_default().push(event);
        }
        info!(owners = groups.len(), "charging uninvoiced usage");

        let engine = &self.engine;
        let outcomes: Vec<_> = stream::iter(groups)
            .map(|(owner_id, events)| async move {
                (owner_id, engine.charge(owner_id, events, now).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = AggregationReport {
            owners_attempted: outcomes.len(),
            ..AggregationReport::default()
        };
        for (owner_id, outcome) in outcomes {
            match outcome {
                Ok(charged) => {
                    debug!(%owner_id, events = charged.len(), "owner group charged");
                    report.events_charged += charged.len();
                    report.charged.extend(charged);
                }
                Err(failure) => {
                    warn!(%owner_id, error = %failure, "owner group charge failed");
                    report.events_charged += failure.charged.len();
                    report.failures.push(GroupFailure {
                        owner_id,
                        events_charged: failure.charged.len(),
                        error: failure.error,
                    });
                    report.charged.extend(failure.charged);
                }
            }
        }
        report.failures.sort_by_key(|failure| failure.owner_id);

        info!(
            owners = report.owners_attempted,
            events = report.events_charged,
            failures = report.failures.len(),
            "usage aggregation finished"
        );
        Ok(report)
    }

    /// Snapshot of uninvoiced events taken before any charging starts.
    async fn uninvoiced(&self) -> AppResult<Vec<BillingEvent>> {
        let filter = EventFilter::uninvoiced();
        let mut page = Pagination::new(0, self.page_size)?;
        let mut pending = Vec::new();
        loop {
            let batch = self.events.find_events(&filter, page).await?;
            let fetched = batch.results.len() as i64;
            pending.extend(batch.results);
            if fetched < page.limit() || page.end >= batch.total {
                break;
            }
            page = page.next();
        }
        Ok(pending)
    }
}

/// key: billing-usage-scheduler -> fixed-interval aggregation runs
pub fn spawn(aggregator: Arc<UsageAggregator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // the first tick fires immediately; wait a full period before charging
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match aggregator.run_once(Utc::now()).await {
                Ok(report) if report.is_clean() => {}
                Ok(report) => {
                    for failure in &report.failures {
                        warn!(
                            owner_id = %failure.owner_id,
                            charged = failure.events_charged,
                            error = %failure.error,
                            "owner group will be retried next run"
                        );
                    }
                }
                Err(err) => warn!(?err, "usage aggregation run failed"),
            }
        }
    })
}
