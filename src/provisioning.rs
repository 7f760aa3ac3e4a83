use std::time::Duration;

use async_trait::async_trait;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProvisioningConfig;
use crate::error::{AppError, AppResult};
use crate::servers::ProvisionHandle;

const SERVICE: &str = "provisioning";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedServer {
    pub handle: ProvisionHandle,
}

/// key: provisioning-adapter -> remote stream server lifecycle
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_server(
        &self,
        server_name: &str,
        stream_name: &str,
        server_id: Uuid,
    ) -> AppResult<ProvisionedServer>;

    async fn restart_server(
        &self,
        server_id: Uuid,
        stream_name: &str,
        handle: ProvisionHandle,
    ) -> AppResult<()>;

    async fn delete_server(&self, handle: ProvisionHandle) -> AppResult<()>;
}

#[derive(Clone)]
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateServerRequest<'a> {
    server_name: &'a str,
    stream_name: &'a str,
    server_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    droplet_id: i64,
}

#[derive(Debug, Serialize)]
struct RestartServerRequest<'a> {
    server_id: Uuid,
    stream_name: &'a str,
}

impl HttpProvisioner {
    pub fn new(config: &ProvisioningConfig, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                AppError::Internal(format!("failed to build provisioning client: {err}"))
            })?;
        Ok(Self {
            client,
            base_url: config.endpoint.clone(),
            auth_token: config.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, action: &str) -> AppResult<Response> {
        let response = self
            .auth(request)
            .send()
            .await
            .map_err(|err| AppError::dependency(SERVICE, format!("failed to {action}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = body.trim();
            let message = if detail.is_empty() {
                format!("rejected {action}")
            } else {
                format!("rejected {action}: {detail}")
            };
            return Err(AppError::dependency_status(SERVICE, status.as_u16(), message));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_server(
        &self,
        server_name: &str,
        stream_name: &str,
        server_id: Uuid,
    ) -> AppResult<ProvisionedServer> {
        let response = self
            .send(
                self.client
                    .post(self.endpoint("server"))
                    .json(&CreateServerRequest {
                        server_name,
                        stream_name,
                        server_id,
                    }),
                "create server",
            )
            .await?;
        let parsed: CreateServerResponse = response.json().await.map_err(|err| {
            AppError::dependency(SERVICE, format!("failed to decode create response: {err}"))
        })?;
        Ok(ProvisionedServer {
            handle: ProvisionHandle(parsed.droplet_id),
        })
    }

    async fn restart_server(
        &self,
        server_id: Uuid,
        stream_name: &str,
        handle: ProvisionHandle,
    ) -> AppResult<()> {
        self.send(
            self.client
                .post(self.endpoint(&format!("server/{handle}/restart")))
                .json(&RestartServerRequest {
                    server_id,
                    stream_name,
                }),
            "restart server",
        )
        .await?;
        Ok(())
    }

    async fn delete_server(&self, handle: ProvisionHandle) -> AppResult<()> {
        self.send(
            self.client.delete(self.endpoint(&format!("server/{handle}"))),
            "delete server",
        )
        .await?;
        Ok(())
    }
}

pub mod testing {
    use std::collections::{HashMap, HashSet};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ProvisionOp {
        Create,
        Restart,
        Delete,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct RemoteServer {
        pub server_name: String,
        pub stream_name: String,
        pub server_id: Uuid,
        pub restarts: u32,
    }

    #[derive(Default)]
    struct State {
        next_handle: i64,
        servers: HashMap<ProvisionHandle, RemoteServer>,
        failing: HashSet<ProvisionOp>,
    }

    /// Provisioning service double; failures answer with a 500.
    #[derive(Default)]
    pub struct InMemoryProvisioner {
        state: Mutex<State>,
    }

    impl InMemoryProvisioner {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn fail_on(&self, op: ProvisionOp) {
            self.state.lock().await.failing.insert(op);
        }

        pub async fn recover(&self, op: ProvisionOp) {
            self.state.lock().await.failing.remove(&op);
        }

        pub async fn remote(&self, handle: ProvisionHandle) -> Option<RemoteServer> {
            self.state.lock().await.servers.get(&handle).cloned()
        }

        pub async fn remote_count(&self) -> usize {
            self.state.lock().await.servers.len()
        }

        fn check(state: &State, op: ProvisionOp) -> AppResult<()> {
            if state.failing.contains(&op) {
                return Err(AppError::dependency_status(
                    SERVICE,
                    500,
                    format!("{op:?} failed"),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Provisioner for InMemoryProvisioner {
        async fn create_server(
            &self,
            server_name: &str,
            stream_name: &str,
            server_id: Uuid,
        ) -> AppResult<ProvisionedServer> {
            let mut state = self.state.lock().await;
            Self::check(&state, ProvisionOp::Create)?;
            state.next_handle += 1;
            let handle = ProvisionHandle(state.next_handle);
            state.servers.insert(
                handle,
                RemoteServer {
                    server_name: server_name.to_string(),
                    stream_name: stream_name.to_string(),
                    server_id,
                    restarts: 0,
                },
            );
            Ok(ProvisionedServer { handle })
        }

        async fn restart_server(
            &self,
            server_id: Uuid,
            stream_name: &str,
            handle: ProvisionHandle,
        ) -> AppResult<()> {
            let mut state = self.state.lock().await;
            Self::check(&state, ProvisionOp::Restart)?;
            let remote = state.servers.get_mut(&handle).ok_or_else(|| {
                AppError::dependency_status(SERVICE, 404, format!("no server {handle}"))
            })?;
            if remote.server_id != server_id {
                return Err(AppError::dependency_status(
                    SERVICE,
                    409,
                    format!("server {handle} belongs to another resource"),
                ));
            }
            remote.stream_name = stream_name.to_string();
            remote.restarts += 1;
            Ok(())
        }

        async fn delete_server(&self, handle: ProvisionHandle) -> AppResult<()> {
            let mut state = self.state.lock().await;
            Self::check(&state, ProvisionOp::Delete)?;
            state.servers.remove(&handle).map(|_| ()).ok_or_else(|| {
                AppError::dependency_status(SERVICE, 404, format!("no server {handle}"))
            })
        }
    }
}
