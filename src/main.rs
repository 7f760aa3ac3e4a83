use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Extension;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use streamhost::billing::{
    spawn_usage_aggregator, BillingLedger, BillingService, ChargeEngine, UsageAggregator,
};
use streamhost::config::AppConfig;
use streamhost::notifications::{BroadcastNotificationBus, HttpNotificationBus, NotificationBus};
use streamhost::owners::PgCustomerDirectory;
use streamhost::payments::StripeGateway;
use streamhost::provisioning::HttpProvisioner;
use streamhost::routes::{service_routes, with_metrics};
use streamhost::servers::ServerOrchestrator;
use streamhost::store::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("invalid configuration")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if config.allow_migration_failure {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("database migrations failed");
        }
    }

    let billing_config = &config.billing;
    let timeout = billing_config.call_timeout;
    let store = Arc::new(PgStore::new(pool.clone()));
    let payments = Arc::new(StripeGateway::new(&config.payments, timeout)?);
    let customers = Arc::new(PgCustomerDirectory::new(pool.clone()));
    let provisioner = Arc::new(HttpProvisioner::new(&config.provisioning, timeout)?);
    let notifier: Arc<dyn NotificationBus> =
        match HttpNotificationBus::from_config(&config.notifications, timeout)? {
            Some(relay) => Arc::new(relay),
            None => {
                tracing::info!("no notification relay configured; using in-process broadcast");
                Arc::new(BroadcastNotificationBus::new())
            }
        };

    let ledger = BillingLedger::new(store.clone());
    let engine = ChargeEngine::new(ledger.clone(), store.clone(), payments, customers, timeout);
    let billing = BillingService::new(ledger, engine.clone(), store.clone());
    let orchestrator =
        ServerOrchestrator::new(store.clone(), provisioner, billing, notifier, billing_config);

    let aggregator = Arc::new(UsageAggregator::new(
        store,
        engine,
        billing_config.aggregation_concurrency,
        billing_config.aggregation_page_size,
    ));
    spawn_usage_aggregator(aggregator, billing_config.aggregation_interval);

    let app = with_metrics(service_routes()).layer(Extension(orchestrator));

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
