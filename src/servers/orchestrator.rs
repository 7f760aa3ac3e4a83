use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{validate_server_info, ProvisionHandle, ServerPatch, ServerStatus, StreamServer};
use crate::billing::BillingService;
use crate::config::BillingConfig;
use crate::error::{bounded, AppError, AppResult};
use crate::notifications::{NotificationBus, UPDATE_IP_EVENT, UPDATE_STATUS_EVENT};
use crate::provisioning::Provisioner;
use crate::store::{Page, Pagination, ServerStore};

/// key: servers-orchestrator -> create/update/delete sagas over store, provisioning and billing
///
/// Operations on the same server are not serialised here. The billing ledger's
/// conditional insert is what keeps concurrent sagas from double-opening usage.
#[derive(Clone)]
pub struct ServerOrchestrator {
    servers: Arc<dyn ServerStore>,
    provisioner: Arc<dyn Provisioner>,
    billing: BillingService,
    notifier: Arc<dyn NotificationBus>,
    plan_id: String,
    call_timeout: Duration,
}

/// Steps of `create` that completed and must be undone on a later failure.
#[derive(Default)]
struct Completed {
    row: bool,
    billing: bool,
    remote: Option<ProvisionHandle>,
}

impl ServerOrchestrator {
    pub fn new(
        servers: Arc<dyn ServerStore>,
        provisioner: Arc<dyn Provisioner>,
        billing: BillingService,
        notifier: Arc<dyn NotificationBus>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            servers,
            provisioner,
            billing,
            notifier,
            plan_id: config.server_plan_id.clone(),
            call_timeout: config.call_timeout,
        }
    }

    pub fn billing(&self) -> &BillingService {
        &self.billing
    }

    /// Provisions a new stream server and opens its usage interval.
    ///
    /// The returned server is still `Starting`; the provisioning callback moves it on.
    /// Any failure undoes the completed steps in reverse order before returning.
    pub async fn create(
        &self,
        owner_id: Uuid,
        server_name: &str,
        stream_name: &str,
    ) -> AppResult<StreamServer> {
        validate_server_info(server_name, stream_name)?;
        let server = StreamServer::starting(owner_id, server_name, stream_name);
        let server_id = server.id;
        let mut done = Completed::default();

        bounded("store", self.call_timeout, self.servers.insert_server(&server)).await?;
        done.row = true;
        debug!(%server_id, %owner_id, "stream server row inserted");

        if let Err(err) = self
            .billing
            .start(server_id, owner_id, &self.plan_id, Utc::now())
            .await
        {
            self.compensate(server_id, done).await;
            return Err(err);
        }
        done.billing = true;

        let provisioned = match bounded(
            "provisioning",
            self.call_timeout,
            self.provisioner
                .create_server(server_name, stream_name, server_id),
        )
        .await
        {
            Ok(provisioned) => provisioned,
            Err(err) => {
                self.compensate(server_id, done).await;
                return Err(as_dependency("provisioning", err));
            }
        };
        done.remote = Some(provisioned.handle);

        let stored = match bounded(
            "store",
            self.call_timeout,
            self.servers
                .update_server(server_id, &ServerPatch::provision_handle(provisioned.handle)),
        )
        .await
        {
            Ok(stored) => stored,
            Err(err) => {
                self.compensate(server_id, done).await;
                return Err(as_dependency("store", err));
            }
        };

        info!(
            %server_id,
            %owner_id,
            handle = %provisioned.handle,
            "stream server provisioned"
        );
        Ok(stored)
    }

    /// Undoes completed `create` steps, newest first. Failures are logged only.
    async fn compensate(&self, server_id: Uuid, done: Completed) {
        warn!(%server_id, "rolling back stream server creation");

        if let Some(handle) = done.remote {
            if let Err(err) = bounded(
                "provisioning",
                self.call_timeout,
                self.provisioner.delete_server(handle),
            )
            .await
            {
                // nothing reconciles this remote instance afterwards
                error!(%server_id, %handle, ?err, "failed to delete provisioned server during rollback");
            }
        }

        if done.billing {
            match self.billing.stop(server_id, Utc::now()).await {
                Ok(stopped) => {
                    if let Some(err) = stopped.charge_error {
                        // the server never ran; void what could not be charged
                        warn!(%server_id, ?err, "charging rolled back usage failed; cancelling it");
                        let uncharged: Vec<_> = stopped
                            .closed
                            .into_iter()
                            .filter(|event| {
                                !stopped.charged.iter().any(|c| c.event_id == event.id)
                            })
                            .collect();
                        if let Err(err) = self.billing.cancel(&uncharged).await {
                            error!(%server_id, ?err, "failed to cancel rolled back usage");
                        }
                    }
                }
                Err(AppError::NotFound(_)) => {}
                Err(err) => error!(%server_id, ?err, "failed to stop billing during rollback"),
            }
        }

        if done.row {
            if let Err(err) =
                bounded("store", self.call_timeout, self.servers.delete_server(server_id)).await
            {
                error!(%server_id, ?err, "failed to delete stream server row during rollback");
            }
        }
    }

    /// The server, provided `owner_id` owns it.
    pub async fn get(&self, server_id: Uuid, owner_id: Uuid) -> AppResult<StreamServer> {
        let server = self.find(server_id).await?;
        if server.owner_id != owner_id {
            return Err(AppError::Auth(format!(
                "stream server {server_id} belongs to another owner"
            )));
        }
        Ok(server)
    }

    pub async fn list(&self, owner_id: Uuid, page: Pagination) -> AppResult<Page<StreamServer>> {
        bounded(
            "store",
            self.call_timeout,
            self.servers.list_servers(owner_id, page),
        )
        .await
    }

    /// Re-provisions the remote server under a new name and stream, keeping its identity.
    pub async fn update_info(
        &self,
        server_id: Uuid,
        owner_id: Uuid,
        server_name: &str,
        stream_name: &str,
    ) -> AppResult<StreamServer> {
        let server = self.get(server_id, owner_id).await?;
        validate_server_info(server_name, stream_name)?;

        if let Some(handle) = server.provision_handle {
            self.delete_remote(server_id, handle).await?;
            debug!(%server_id, %handle, "old remote server deleted");
        }

        let provisioned = match bounded(
            "provisioning",
            self.call_timeout,
            self.provisioner
                .create_server(server_name, stream_name, server_id),
        )
        .await
        {
            Ok(provisioned) => provisioned,
            Err(err) => {
                // the old instance is gone; leave the row visibly broken
                if let Err(mark_err) = bounded(
                    "store",
                    self.call_timeout,
                    self.servers
                        .update_server(server_id, &ServerPatch::status(ServerStatus::Errored)),
                )
                .await
                {
                    error!(%server_id, ?mark_err, "failed to mark stream server errored");
                }
                return Err(as_dependency("provisioning", err));
            }
        };

        let patch = ServerPatch {
            server_name: Some(server_name.to_string()),
            stream_name: Some(stream_name.to_string()),
            provision_handle: Some(provisioned.handle),
            status: Some(ServerStatus::Starting),
            ..ServerPatch::default()
        };
        let updated = bounded(
            "store",
            self.call_timeout,
            self.servers.update_server(server_id, &patch),
        )
        .await?;
        info!(%server_id, handle = %provisioned.handle, "stream server re-provisioned");
        Ok(updated)
    }

    /// Callback-driven status change. The write is kept even when notifying fails.
    pub async fn set_status(
        &self,
        server_id: Uuid,
        status: ServerStatus,
    ) -> AppResult<StreamServer> {
        let current = self.find(server_id).await?;
        if !current.status.can_transition_to(status) {
            return Err(AppError::Conflict(format!(
                "stream server {server_id} cannot move from {} to {status}",
                current.status
            )));
        }
        let updated = bounded(
            "store",
            self.call_timeout,
            self.servers
                .update_server(server_id, &ServerPatch::status(status)),
        )
        .await?;
        info!(%server_id, from = %current.status, to = %status, "stream server status changed");

        self.notify(&updated, UPDATE_STATUS_EVENT, json!(status.as_str()))
            .await?;
        Ok(updated)
    }

    /// Callback-driven address change. The write is kept even when notifying fails.
    pub async fn set_address(&self, server_id: Uuid, address: &str) -> AppResult<StreamServer> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AppError::Validation("ip address must not be empty".into()));
        }
        let updated = bounded(
            "store",
            self.call_timeout,
            self.servers
                .update_server(server_id, &ServerPatch::ip_address(address)),
        )
        .await?;
        debug!(%server_id, %address, "stream server address recorded");

        self.notify(&updated, UPDATE_IP_EVENT, json!(address)).await?;
        Ok(updated)
    }

    pub async fn restart(&self, server_id: Uuid, owner_id: Uuid) -> AppResult<()> {
        let server = self.get(server_id, owner_id).await?;
        let handle = server.provision_handle.ok_or_else(|| {
            AppError::Conflict(format!("stream server {server_id} has not been provisioned"))
        })?;
        bounded(
            "provisioning",
            self.call_timeout,
            self.provisioner
                .restart_server(server_id, &server.stream_name, handle),
        )
        .await?;
        info!(%server_id, %handle, "stream server restarted");
        Ok(())
    }

    /// Stops billing, tears down the remote server, then drops the row.
    ///
    /// A failed remote delete keeps the row so the call can be retried. Billing is
    /// already stopped at that point.
    pub async fn delete(&self, server_id: Uuid, owner_id: Uuid) -> AppResult<()> {
        let server = self.get(server_id, owner_id).await?;

        match self.billing.stop(server_id, Utc::now()).await {
            Ok(stopped) => {
                if let Some(err) = stopped.charge_error {
                    warn!(%server_id, ?err, "final usage left for aggregation");
                }
            }
            Err(AppError::NotFound(_)) => {
                debug!(%server_id, "no open usage to stop");
            }
            Err(err) => return Err(err),
        }

        if server.status != ServerStatus::Stopping {
            if let Err(err) = bounded(
                "store",
                self.call_timeout,
                self.servers
                    .update_server(server_id, &ServerPatch::status(ServerStatus::Stopping)),
            )
            .await
            {
                warn!(%server_id, ?err, "failed to mark stream server stopping");
            }
        }

        if let Some(handle) = server.provision_handle {
            if let Err(err) = self.delete_remote(server_id, handle).await {
                warn!(%server_id, %handle, ?err, "remote delete failed; row kept for retry");
                return Err(as_dependency("provisioning", err));
            }
        }

        bounded(
            "store",
            self.call_timeout,
            self.servers.delete_server(server_id),
        )
        .await?;
        info!(%server_id, %owner_id, "stream server deleted");
        Ok(())
    }

    /// Deletes the remote server, treating one the provisioning service no longer
    /// knows as already deleted.
    async fn delete_remote(&self, server_id: Uuid, handle: ProvisionHandle) -> AppResult<()> {
        match bounded(
            "provisioning",
            self.call_timeout,
            self.provisioner.delete_server(handle),
        )
        .await
        {
            Err(AppError::Dependency {
                status: Some(404), ..
            }) => {
                debug!(%server_id, %handle, "remote server already gone");
                Ok(())
            }
            result => result,
        }
    }

    async fn find(&self, server_id: Uuid) -> AppResult<StreamServer> {
        bounded("store", self.call_timeout, self.servers.find_server(server_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("stream server {server_id}")))
    }

    async fn notify(
        &self,
        server: &StreamServer,
        event: &str,
        data: serde_json::Value,
    ) -> AppResult<()> {
        bounded(
            "notifications",
            self.call_timeout,
            self.notifier.send(&server.channel_name, event, data),
        )
        .await
        .map_err(|err| {
            warn!(server_id = %server.id, %event, ?err, "notification not delivered");
            err
        })
    }
}

fn as_dependency(service: &'static str, error: AppError) -> AppError {
    match error {
        AppError::Dependency { .. } => error,
        other => AppError::dependency(service, other.to_string()),
    }
}
