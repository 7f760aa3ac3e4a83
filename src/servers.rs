use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub mod orchestrator;

pub use orchestrator::ServerOrchestrator;

/// Lifecycle of a provisioned stream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Starting,
    Ready,
    Stopping,
    Inactive,
    Errored,
}

/// The only place status variants are tied to their stored code and wire name.
const STATUS_TABLE: [(ServerStatus, i16, &str); 5] = [
    (ServerStatus::Starting, 1, "Starting"),
    (ServerStatus::Ready, 2, "Ready"),
    (ServerStatus::Stopping, 3, "Stopping"),
    (ServerStatus::Inactive, 4, "Inactive"),
    (ServerStatus::Errored, 5, "Errored"),
];

impl ServerStatus {
    fn entry(self) -> &'static (ServerStatus, i16, &'static str) {
        match self {
            ServerStatus::Starting => &STATUS_TABLE[0],
            ServerStatus::Ready => &STATUS_TABLE[1],
            ServerStatus::Stopping => &STATUS_TABLE[2],
            ServerStatus::Inactive => &STATUS_TABLE[3],
            ServerStatus::Errored => &STATUS_TABLE[4],
        }
    }

    pub fn code(self) -> i16 {
        self.entry().1
    }

    pub fn as_str(self) -> &'static str {
        self.entry().2
    }

    pub fn from_code(code: i16) -> Option<Self> {
        STATUS_TABLE
            .iter()
            .find(|(_, stored, _)| *stored == code)
            .map(|(status, _, _)| *status)
    }

    /// Callback-driven transitions accepted by `set_status`.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self, next) {
            (current, next) if current == next => true,
            (_, Errored) | (_, Starting) => true,
            (Starting, Ready) | (Ready, Stopping) | (Stopping, Inactive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        STATUS_TABLE
            .iter()
            .find(|(_, _, name)| *name == value)
            .map(|(status, _, _)| *status)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "status must be one of Starting, Ready, Stopping, Inactive or Errored, got `{value}`"
                ))
            })
    }
}

impl Serialize for ServerStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServerStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Opaque reference to the remote instance returned by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionHandle(pub i64);

impl fmt::Display for ProvisionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// key: servers-model -> metered stream server owned by a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamServer {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub server_name: String,
    pub stream_name: String,
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_handle: Option<ProvisionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub status: ServerStatus,
}

impl StreamServer {
    /// Fresh row for a server that has not been provisioned yet.
    pub fn starting(owner_id: Uuid, server_name: &str, stream_name: &str) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            owner_id,
            server_name: server_name.to_string(),
            stream_name: stream_name.to_string(),
            channel_name: channel_for(id),
            provision_handle: None,
            ip_address: None,
            status: ServerStatus::Starting,
        }
    }
}

/// Partial update applied through `ServerStore::update`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerPatch {
    pub server_name: Option<String>,
    pub stream_name: Option<String>,
    pub provision_handle: Option<ProvisionHandle>,
    pub ip_address: Option<String>,
    pub status: Option<ServerStatus>,
}

impl ServerPatch {
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn ip_address(address: impl Into<String>) -> Self {
        Self {
            ip_address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn provision_handle(handle: ProvisionHandle) -> Self {
        Self {
            provision_handle: Some(handle),
            ..Self::default()
        }
    }

    pub fn apply(&self, server: &mut StreamServer) {
        if let Some(name) = &self.server_name {
            server.server_name = name.clone();
        }
        if let Some(stream) = &self.stream_name {
            server.stream_name = stream.clone();
        }
        if let Some(handle) = self.provision_handle {
            server.provision_handle = Some(handle);
        }
        if let Some(address) = &self.ip_address {
            server.ip_address = Some(address.clone());
        }
        if let Some(status) = self.status {
            server.status = status;
        }
    }
}

/// Notification channel a server's subscribers listen on.
pub fn channel_for(server_id: Uuid) -> String {
    format!("{server_id}-channel")
}

static SERVER_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\-]{1,63}$").expect("valid server name pattern"));

/// Server names become provisioning-service hostnames.
pub fn validate_server_info(server_name: &str, stream_name: &str) -> AppResult<()> {
    if !SERVER_NAME_PATTERN.is_match(server_name) {
        return Err(AppError::Validation(format!(
            "server name `{server_name}` may only contain letters, digits, '.' and '-'"
        )));
    }
    if stream_name.trim().is_empty() {
        return Err(AppError::Validation("stream name must not be empty".into()));
    }
    Ok(())
}
