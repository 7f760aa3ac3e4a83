use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::broadcast;

use crate::config::NotificationConfig;
use crate::error::{AppError, AppResult};

const SERVICE: &str = "notifications";

pub const UPDATE_STATUS_EVENT: &str = "update__status";
pub const UPDATE_IP_EVENT: &str = "update__ip_address";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

/// Best-effort push to clients subscribed to a server's channel.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn send(&self, channel: &str, event: &str, data: Value) -> AppResult<()>;
}

/// key: notifications-broadcast -> in-process fan-out per channel
#[derive(Default)]
pub struct BroadcastNotificationBus {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl BroadcastNotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        use dashmap::mapref::entry::Entry;
        match self.channels.entry(channel.to_string()) {
            Entry::Occupied(e) => e.get().subscribe(),
            Entry::Vacant(v) => {
                let (tx, rx) = broadcast::channel(16);
                v.insert(tx);
                rx
            }
        }
    }
}

#[async_trait]
impl NotificationBus for BroadcastNotificationBus {
    async fn send(&self, channel: &str, event: &str, data: Value) -> AppResult<()> {
        let Some(tx) = self.channels.get(channel) else {
            tracing::debug!(%channel, %event, "no subscribers for channel");
            return Ok(());
        };
        let notification = Notification {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        };
        if tx.send(notification).is_err() {
            // every receiver is gone; forget the channel
            drop(tx);
            self.channels.remove(channel);
        }
        Ok(())
    }
}

/// key: notifications-relay -> signed webhook to the push gateway
#[derive(Clone)]
pub struct HttpNotificationBus {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpNotificationBus {
    pub fn new(endpoint: impl Into<String>, secret: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                AppError::Internal(format!("failed to build notification client: {err}"))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret,
        })
    }

    pub fn from_config(config: &NotificationConfig, timeout: Duration) -> AppResult<Option<Self>> {
        config
            .relay_endpoint
            .as_ref()
            .map(|endpoint| Self::new(endpoint.clone(), config.relay_secret.clone(), timeout))
            .transpose()
    }
}

/// `sha256=<hex>` HMAC over the raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl NotificationBus for HttpNotificationBus {
    async fn send(&self, channel: &str, event: &str, data: Value) -> AppResult<()> {
        let body = serde_json::to_vec(&Notification {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        })
        .map_err(|err| AppError::Internal(format!("failed to encode notification: {err}")))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header("x-signature-256", sign_payload(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| AppError::dependency(SERVICE, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::dependency_status(
                SERVICE,
                response.status().as_u16(),
                format!("relay rejected `{event}` on {channel}"),
            ));
        }
        Ok(())
    }
}

pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotificationBus {
        sent: Mutex<Vec<Notification>>,
        failing: AtomicBool,
    }

    impl RecordingNotificationBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub async fn sent(&self) -> Vec<Notification> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl NotificationBus for RecordingNotificationBus {
        async fn send(&self, channel: &str, event: &str, data: Value) -> AppResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::dependency_status(SERVICE, 503, "push gateway unavailable"));
            }
            self.sent.lock().await.push(Notification {
                channel: channel.to_string(),
                event: event.to_string(),
                data,
            });
            Ok(())
        }
    }
}
