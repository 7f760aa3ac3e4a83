use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::PaymentsConfig;
use crate::error::{AppError, AppResult};

const SERVICE: &str = "payments";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub plan_id: String,
}

/// key: payments-customer -> provider-side customer with metered subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCustomer {
    pub id: String,
    pub subscription_items: Vec<SubscriptionItem>,
    pub default_source: Option<String>,
}

impl PaymentCustomer {
    pub fn subscription_item_for(&self, plan_id: &str) -> Option<&SubscriptionItem> {
        self.subscription_items
            .iter()
            .find(|item| item.plan_id == plan_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Unit price in the smallest currency unit.
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub quantity: i64,
}

/// key: payments-adapter -> provider integration
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> AppResult<PaymentCustomer>;

    async fn get_plan(&self, plan_id: &str) -> AppResult<Plan>;

    /// `idempotency_key` lets the provider drop replays of the same submission.
    async fn record_usage(
        &self,
        subscription_item_id: &str,
        units: i64,
        timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> AppResult<UsageRecord>;

    async fn set_default_source(&self, customer_id: &str, source_id: &str) -> AppResult<()>;

    async fn detach_source(&self, customer_id: &str, source_id: &str) -> AppResult<()>;
}

/// Talks to the Stripe REST API.
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
    #[serde(default)]
    default_source: Option<String>,
    #[serde(default)]
    subscriptions: Option<StripeList<StripeSubscription>>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    items: StripeList<StripeSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionItem {
    id: String,
    plan: StripePlanRef,
}

#[derive(Debug, Deserialize)]
struct StripePlanRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripePlan {
    id: String,
    #[serde(default)]
    amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl StripeGateway {
    pub fn new(config: &PaymentsConfig, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build payments client: {err}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/v1/{}", self.api_base.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> AppResult<Response> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| AppError::dependency(SERVICE, err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let message = match response.json::<StripeErrorBody>().await {
            Ok(body) => {
                let detail = body.error;
                match (detail.code, detail.message) {
                    (Some(code), Some(message)) => format!("{code}: {message}"),
                    (None, Some(message)) => message,
                    (Some(code), None) => code,
                    (None, None) => "request rejected".to_string(),
                }
            }
            Err(_) => "request rejected".to_string(),
        };
        Err(AppError::dependency_status(SERVICE, status, message))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> AppResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|err| AppError::dependency(SERVICE, format!("failed to decode response: {err}")))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn get_customer(&self, customer_id: &str) -> AppResult<PaymentCustomer> {
        let response = self
            .send(
                self.client
                    .get(self.endpoint(&format!("customers/{customer_id}")))
                    .query(&[("expand[]", "subscriptions")]),
            )
            .await?;
        let customer: StripeCustomer = Self::decode(response).await?;

        let subscription_items = customer
            .subscriptions
            .map(|subscriptions| {
                subscriptions
                    .data
                    .into_iter()
                    .flat_map(|subscription| subscription.items.data)
                    .map(|item| SubscriptionItem {
                        id: item.id,
                        plan_id: item.plan.id,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(PaymentCustomer {
            id: customer.id,
            subscription_items,
            default_source: customer.default_source,
        })
    }

    async fn get_plan(&self, plan_id: &str) -> AppResult<Plan> {
        let response = self
            .send(self.client.get(self.endpoint(&format!("plans/{plan_id}"))))
            .await?;
        let plan: StripePlan = Self::decode(response).await?;
        let amount = plan.amount.ok_or_else(|| {
            AppError::BusinessRule(format!("plan {} has no per-unit amount", plan.id))
        })?;
        Ok(Plan {
            id: plan.id,
            amount,
        })
    }

    async fn record_usage(
        &self,
        subscription_item_id: &str,
        units: i64,
        timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> AppResult<UsageRecord> {
        let quantity = units.to_string();
        let timestamp = timestamp.timestamp().to_string();
        let response = self
            .send(
                self.client
                    .post(self.endpoint(&format!(
                        "subscription_items/{subscription_item_id}/usage_records"
                    )))
                    .header("Idempotency-Key", idempotency_key)
                    .form(&[
                        ("quantity", quantity.as_str()),
                        ("timestamp", timestamp.as_str()),
                    ]),
            )
            .await?;
        Self::decode(response).await
    }

    async fn set_default_source(&self, customer_id: &str, source_id: &str) -> AppResult<()> {
        self.send(
            self.client
                .post(self.endpoint(&format!("customers/{customer_id}")))
                .form(&[("default_source", source_id)]),
        )
        .await?;
        Ok(())
    }

    async fn detach_source(&self, customer_id: &str, source_id: &str) -> AppResult<()> {
        self.send(self.client.delete(
            self.endpoint(&format!("customers/{customer_id}/sources/{source_id}")),
        ))
        .await?;
        Ok(())
    }
}

pub mod testing {
    use std::collections::{HashMap, HashSet};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedUsage {
        pub subscription_item_id: String,
        pub units: i64,
        pub timestamp: DateTime<Utc>,
        pub idempotency_key: String,
    }

    /// Payment provider double with per-customer failure switches.
    #[derive(Default)]
    pub struct InMemoryPaymentGateway {
        customers: Mutex<HashMap<String, PaymentCustomer>>,
        plans: Mutex<HashMap<String, Plan>>,
        usage: Mutex<Vec<RecordedUsage>>,
        failing_customers: Mutex<HashSet<String>>,
        failing_items: Mutex<HashSet<String>>,
    }

    impl InMemoryPaymentGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn add_plan(&self, plan_id: &str, amount: i64) {
            self.plans.lock().await.insert(
                plan_id.to_string(),
                Plan {
                    id: plan_id.to_string(),
                    amount,
                },
            );
        }

        /// Registers a customer subscribed to `plan_ids`; item ids are `si_{customer}_{plan}`.
        pub async fn add_customer(&self, customer_id: &str, plan_ids: &[&str]) {
            let subscription_items = plan_ids
                .iter()
                .map(|plan_id| SubscriptionItem {
                    id: format!("si_{customer_id}_{plan_id}"),
                    plan_id: plan_id.to_string(),
                })
                .collect();
            self.customers.lock().await.insert(
                customer_id.to_string(),
                PaymentCustomer {
                    id: customer_id.to_string(),
                    subscription_items,
                    default_source: None,
                },
            );
        }

        pub async fn fail_customer_lookup(&self, customer_id: &str) {
            self.failing_customers
                .lock()
                .await
                .insert(customer_id.to_string());
        }

        pub async fn fail_usage_for(&self, subscription_item_id: &str) {
            self.failing_items
                .lock()
                .await
                .insert(subscription_item_id.to_string());
        }

        pub async fn recorded_usage(&self) -> Vec<RecordedUsage> {
            self.usage.lock().await.clone()
        }

        pub async fn customer(&self, customer_id: &str) -> Option<PaymentCustomer> {
            self.customers.lock().await.get(customer_id).cloned()
        }
    }

    #[async_trait]
    impl PaymentGateway for InMemoryPaymentGateway {
        async fn get_customer(&self, customer_id: &str) -> AppResult<PaymentCustomer> {
            if self.failing_customers.lock().await.contains(customer_id) {
                return Err(AppError::dependency_status(SERVICE, 503, "customer lookup failed"));
            }
            self.customers
                .lock()
                .await
                .get(customer_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::dependency_status(SERVICE, 404, format!("no such customer: {customer_id}"))
                })
        }

        async fn get_plan(&self, plan_id: &str) -> AppResult<Plan> {
            self.plans
                .lock()
                .await
                .get(plan_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::dependency_status(SERVICE, 404, format!("no such plan: {plan_id}"))
                })
        }

        async fn record_usage(
            &self,
            subscription_item_id: &str,
            units: i64,
            timestamp: DateTime<Utc>,
            idempotency_key: &str,
        ) -> AppResult<UsageRecord> {
            if self.failing_items.lock().await.contains(subscription_item_id) {
                return Err(AppError::dependency_status(SERVICE, 402, "usage record rejected"));
            }
            let mut guard = self.usage.lock().await;
            guard.push(RecordedUsage {
                subscription_item_id: subscription_item_id.to_string(),
                units,
                timestamp,
                idempotency_key: idempotency_key.to_string(),
            });
            Ok(UsageRecord {
                id: format!("mbur_{}", guard.len()),
                quantity: units,
            })
        }

        async fn set_default_source(&self, customer_id: &str, source_id: &str) -> AppResult<()> {
            let mut guard = self.customers.lock().await;
            let customer = guard.get_mut(customer_id).ok_or_else(|| {
                AppError::dependency_status(SERVICE, 404, format!("no such customer: {customer_id}"))
            })?;
            customer.default_source = Some(source_id.to_string());
            Ok(())
        }

        async fn detach_source(&self, customer_id: &str, source_id: &str) -> AppResult<()> {
            let mut guard = self.customers.lock().await;
            let customer = guard.get_mut(customer_id).ok_or_else(|| {
                AppError::dependency_status(SERVICE, 404, format!("no such customer: {customer_id}"))
            })?;
            if customer.default_source.as_deref() == Some(source_id) {
                customer.default_source = None;
            }
            Ok(())
        }
    }
}
