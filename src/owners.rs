use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Resolves an owner to the payment-provider customer it was registered with.
/// Users are owned by the account service; this side only reads the mapping.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn payment_customer_id(&self, owner_id: Uuid) -> AppResult<String>;
}

#[derive(Clone)]
pub struct PgCustomerDirectory {
    pool: PgPool,
}

impl PgCustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerDirectory for PgCustomerDirectory {
    async fn payment_customer_id(&self, owner_id: Uuid) -> AppResult<String> {
        let customer: Option<Option<String>> =
            sqlx::query_scalar("SELECT stripe_customer_id FROM users WHERE id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;

        match customer {
            Some(Some(id)) if !id.is_empty() => Ok(id),
            Some(_) => Err(AppError::dependency(
                "accounts",
                format!("owner {owner_id} has no payment customer"),
            )),
            None => Err(AppError::dependency(
                "accounts",
                format!("owner {owner_id} not found"),
            )),
        }
    }
}

pub mod testing {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct StaticCustomerDirectory {
        customers: Mutex<HashMap<Uuid, String>>,
    }

    impl StaticCustomerDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn link(&self, owner_id: Uuid, customer_id: &str) {
            self.customers
                .lock()
                .await
                .insert(owner_id, customer_id.to_string());
        }
    }

    #[async_trait]
    impl CustomerDirectory for StaticCustomerDirectory {
        async fn payment_customer_id(&self, owner_id: Uuid) -> AppResult<String> {
            self.customers
                .lock()
                .await
                .get(&owner_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::dependency("accounts", format!("owner {owner_id} not found"))
                })
        }
    }
}
