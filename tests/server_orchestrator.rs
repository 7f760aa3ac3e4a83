mod common;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use common::{Harness, PLAN};
use streamhost::notifications::{UPDATE_IP_EVENT, UPDATE_STATUS_EVENT};
use streamhost::provisioning::testing::ProvisionOp;
use streamhost::servers::{ServerStatus, StreamServer};
use streamhost::store::testing::StoreOp;
use streamhost::store::Pagination;
use streamhost::{AppError, ErrorKind};

async fn provisioned(harness: &Harness, customer_id: &str) -> (Uuid, StreamServer) {
    let owner_id = harness.subscribed_owner(customer_id).await;
    let server = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap();
    (owner_id, server)
}

/// No row and nothing open or unbilled may survive a failed create.
async fn assert_rolled_back(harness: &Harness) {
    assert!(harness.store.servers().await.is_empty());
    assert!(harness
        .store
        .events()
        .await
        .iter()
        .all(|event| !event.is_open() && event.is_invoiced()));
}

// key: server-orchestrator-tests -> create saga and compensation
#[tokio::test]
async fn create_opens_billing_and_provisions() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_create").await;

    let server = harness
        .orchestrator
        .create(owner_id, "n", "s")
        .await
        .unwrap();

    assert_eq!(server.status, ServerStatus::Starting);
    assert_eq!(server.owner_id, owner_id);
    assert_eq!(server.channel_name, format!("{}-channel", server.id));
    let handle = server.provision_handle.expect("handle persisted");

    let remote = harness.provisioner.remote(handle).await.unwrap();
    assert_eq!(remote.server_name, "n");
    assert_eq!(remote.stream_name, "s");
    assert_eq!(remote.server_id, server.id);

    let open = harness.open_events_for(server.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].owner_id, owner_id);
    assert_eq!(open[0].plan_id, PLAN);
    assert!(open[0].ended_at.is_none());
    assert_eq!(harness.store.servers().await, vec![server]);
}

#[tokio::test]
async fn create_rejects_invalid_names_before_any_side_effect() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_names").await;

    let err = harness
        .orchestrator
        .create(owner_id, "not a hostname", "main")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(harness.store.servers().await.is_empty());
    assert!(harness.store.events().await.is_empty());
    assert_eq!(harness.provisioner.remote_count().await, 0);
}

#[tokio::test]
async fn create_rolls_back_when_provisioning_fails() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_prov").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;

    let err = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap_err();

    match err {
        AppError::Dependency { service, status, .. } => {
            assert_eq!(service, "provisioning");
            assert_eq!(status, Some(500));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_rolled_back(&harness).await;
    assert_eq!(harness.store.events().await.len(), 1);
}

#[tokio::test]
async fn create_rolls_back_when_handle_cannot_be_stored() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_store").await;
    harness.store.fail_on(StoreOp::UpdateServer).await;

    let err = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert_rolled_back(&harness).await;
    assert_eq!(harness.provisioner.remote_count().await, 0);
}

#[tokio::test]
async fn create_rolls_back_when_billing_cannot_start() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_ledger").await;
    harness.store.fail_on(StoreOp::InsertEvent).await;

    let err = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert!(harness.store.servers().await.is_empty());
    assert!(harness.store.events().await.is_empty());
    assert_eq!(harness.provisioner.remote_count().await, 0);
}

#[tokio::test]
async fn rolled_back_usage_is_cancelled_when_it_cannot_be_charged() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_void").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;
    harness.payments.fail_customer_lookup("cus_void").await;

    let err = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert_rolled_back(&harness).await;
    let events = harness.store.events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].is_cancelled());
    assert_eq!(events[0].amount_billed, Decimal::ZERO);
    assert!(harness.payments.recorded_usage().await.is_empty());
}

#[tokio::test]
async fn failed_compensation_keeps_the_first_error() {
    let harness = Harness::new().await;
    let owner_id = harness.subscribed_owner("cus_comp").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;
    harness.store.fail_on(StoreOp::DeleteServer).await;

    let err = harness
        .orchestrator
        .create(owner_id, "edge-1", "main")
        .await
        .unwrap_err();

    match err {
        AppError::Dependency { service, .. } => assert_eq!(service, "provisioning"),
        other => panic!("unexpected error: {other:?}"),
    }
    // billing was still stopped even though the row could not be removed
    assert!(harness
        .store
        .events()
        .await
        .iter()
        .all(|event| !event.is_open()));
}

#[tokio::test]
async fn reads_are_scoped_to_the_owner() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_read").await;
    harness
        .orchestrator
        .create(owner_id, "edge-2", "backup")
        .await
        .unwrap();

    let fetched = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(fetched, server);

    let err = harness
        .orchestrator
        .get(server.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);

    let err = harness
        .orchestrator
        .get(Uuid::new_v4(), owner_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let page = harness
        .orchestrator
        .list(owner_id, Pagination::new(0, 1).unwrap())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.results.len(), 1);
    let empty = harness
        .orchestrator
        .list(Uuid::new_v4(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(empty.total, 0);
}

// key: server-orchestrator-tests -> re-provisioning
#[tokio::test]
async fn update_info_reprovisions_under_the_same_identity() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_update").await;
    let old_handle = server.provision_handle.unwrap();

    let updated = harness
        .orchestrator
        .update_info(server.id, owner_id, "edge-9", "backup")
        .await
        .unwrap();

    assert_eq!(updated.id, server.id);
    assert_eq!(updated.server_name, "edge-9");
    assert_eq!(updated.stream_name, "backup");
    assert_eq!(updated.channel_name, server.channel_name);
    let new_handle = updated.provision_handle.unwrap();
    assert_ne!(new_handle, old_handle);
    assert!(harness.provisioner.remote(old_handle).await.is_none());
    let remote = harness.provisioner.remote(new_handle).await.unwrap();
    assert_eq!(remote.server_name, "edge-9");
    assert_eq!(remote.server_id, server.id);
    // billing continues untouched
    assert_eq!(harness.open_events_for(server.id).await.len(), 1);
}

#[tokio::test]
async fn update_info_requires_ownership() {
    let harness = Harness::new().await;
    let (_, server) = provisioned(&harness, "cus_owner").await;

    let err = harness
        .orchestrator
        .update_info(server.id, Uuid::new_v4(), "edge-9", "backup")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    let handle = server.provision_handle.unwrap();
    assert_eq!(
        harness.provisioner.remote(handle).await.unwrap().server_name,
        "edge-1"
    );
    assert_eq!(harness.store.servers().await, vec![server]);
}

#[tokio::test]
async fn update_info_marks_server_errored_when_recreate_fails() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_broken").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;

    let err = harness
        .orchestrator
        .update_info(server.id, owner_id, "edge-9", "backup")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Dependency);
    let stored = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(stored.status, ServerStatus::Errored);
    assert_eq!(stored.server_name, "edge-1");
    assert_eq!(harness.provisioner.remote_count().await, 0);
}

// key: server-orchestrator-tests -> callback mutations
#[tokio::test]
async fn set_status_persists_and_notifies_the_channel() {
    let harness = Harness::new().await;
    let (_, server) = provisioned(&harness, "cus_status").await;

    let updated = harness
        .orchestrator
        .set_status(server.id, ServerStatus::Ready)
        .await
        .unwrap();

    assert_eq!(updated.status, ServerStatus::Ready);
    let sent = harness.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel, server.channel_name);
    assert_eq!(sent[0].event, UPDATE_STATUS_EVENT);
    assert_eq!(sent[0].data, json!("Ready"));
}

#[tokio::test]
async fn set_status_rejects_skipped_lifecycle_steps() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_skip").await;

    let err = harness
        .orchestrator
        .set_status(server.id, ServerStatus::Inactive)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    let stored = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(stored.status, ServerStatus::Starting);
    assert!(harness.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn notification_failure_keeps_the_persisted_change() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_push").await;
    harness.notifier.set_failing(true);

    let err = harness
        .orchestrator
        .set_status(server.id, ServerStatus::Ready)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);

    let err = harness
        .orchestrator
        .set_address(server.id, "203.0.113.7")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);

    let stored = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(stored.status, ServerStatus::Ready);
    assert_eq!(stored.ip_address.as_deref(), Some("203.0.113.7"));
}

#[tokio::test]
async fn set_address_notifies_the_channel() {
    let harness = Harness::new().await;
    let (_, server) = provisioned(&harness, "cus_ip").await;

    harness
        .orchestrator
        .set_address(server.id, " 203.0.113.9 ")
        .await
        .unwrap();

    let sent = harness.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, UPDATE_IP_EVENT);
    assert_eq!(sent[0].data, json!("203.0.113.9"));

    let err = harness
        .orchestrator
        .set_address(server.id, "  ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = harness
        .orchestrator
        .set_address(Uuid::new_v4(), "203.0.113.9")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn restart_uses_current_handle_and_leaves_billing_alone() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_restart").await;
    let events_before = harness.store.events().await;

    harness
        .orchestrator
        .restart(server.id, owner_id)
        .await
        .unwrap();

    let remote = harness
        .provisioner
        .remote(server.provision_handle.unwrap())
        .await
        .unwrap();
    assert_eq!(remote.restarts, 1);
    assert_eq!(harness.store.events().await, events_before);

    let err = harness
        .orchestrator
        .restart(server.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

// key: server-orchestrator-tests -> teardown
#[tokio::test]
async fn delete_stops_billing_and_removes_everything() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_delete").await;

    harness
        .orchestrator
        .delete(server.id, owner_id)
        .await
        .unwrap();

    assert!(harness.store.servers().await.is_empty());
    assert_eq!(harness.provisioner.remote_count().await, 0);
    let events = harness.store.events().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_open());
    assert!(events[0].is_invoiced());
}

#[tokio::test]
async fn delete_keeps_row_when_remote_delete_fails_and_can_be_retried() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_retry").await;
    harness.provisioner.fail_on(ProvisionOp::Delete).await;

    let err = harness
        .orchestrator
        .delete(server.id, owner_id)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Dependency);
    let kept = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(kept.status, ServerStatus::Stopping);
    assert!(harness.open_events_for(server.id).await.is_empty());

    harness.provisioner.recover(ProvisionOp::Delete).await;
    harness
        .orchestrator
        .delete(server.id, owner_id)
        .await
        .unwrap();
    assert!(harness.store.servers().await.is_empty());
    assert_eq!(harness.store.events().await.len(), 1);
}

#[tokio::test]
async fn delete_succeeds_after_a_failed_reprovision() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_orphan").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;
    harness
        .orchestrator
        .update_info(server.id, owner_id, "edge-9", "backup")
        .await
        .unwrap_err();
    // the row still points at the remote server that was already removed
    let stale = harness.orchestrator.get(server.id, owner_id).await.unwrap();
    assert_eq!(stale.provision_handle, server.provision_handle);

    harness
        .orchestrator
        .delete(server.id, owner_id)
        .await
        .unwrap();

    assert!(harness.store.servers().await.is_empty());
    assert!(harness.open_events_for(server.id).await.is_empty());
}

#[tokio::test]
async fn update_info_can_be_retried_after_a_failed_reprovision() {
    let harness = Harness::new().await;
    let (owner_id, server) = provisioned(&harness, "cus_again").await;
    harness.provisioner.fail_on(ProvisionOp::Create).await;
    harness
        .orchestrator
        .update_info(server.id, owner_id, "edge-9", "backup")
        .await
        .unwrap_err();

    harness.provisioner.recover(ProvisionOp::Create).await;
    let updated = harness
        .orchestrator
        .update_info(server.id, owner_id, "edge-9", "backup")
        .await
        .unwrap();

    assert_eq!(updated.status, ServerStatus::Starting);
    assert_eq!(updated.server_name, "edge-9");
    assert_ne!(updated.provision_handle, server.provision_handle);
    assert_eq!(harness.provisioner.remote_count().await, 1);
}

#[tokio::test]
async fn delete_requires_ownership() {
    let harness = Harness::new().await;
    let (_, server) = provisioned(&harness, "cus_guard").await;

    let err = harness
        .orchestrator
        .delete(server.id, Uuid::new_v4())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(harness.open_events_for(server.id).await.len(), 1);
    assert_eq!(harness.provisioner.remote_count().await, 1);
}
