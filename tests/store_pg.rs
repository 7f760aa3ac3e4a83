use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use streamhost::billing::{BillingEvent, EventFilter};
use streamhost::servers::{ProvisionHandle, ServerPatch, ServerStatus, StreamServer};
use streamhost::store::{BillingEventStore, Pagination, PgStore, ServerStore};
use streamhost::ErrorKind;

// key: store-postgres-tests -> conditional writes backing the ledger invariants
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn open_event_index_rejects_second_open_event(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);
    let resource_id = Uuid::new_v4();
    let owner_id = Uuid::new_v4();
    let now = Utc::now();

    let first = BillingEvent::open(resource_id, owner_id, "plan_stream_hourly", now);
    store.insert_open_event(&first).await.unwrap();

    let second = BillingEvent::open(resource_id, owner_id, "plan_stream_hourly", now);
    let err = store.insert_open_event(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert!(store.close_event(first.id, now + Duration::hours(1)).await.unwrap());
    assert!(!store.close_event(first.id, now + Duration::hours(2)).await.unwrap());
    store.insert_open_event(&second).await.unwrap();

    let open = store
        .find_events(&EventFilter::open_for_resource(resource_id), Pagination::unbounded())
        .await
        .unwrap();
    assert_eq!(open.total, 1);
    assert_eq!(open.results[0].id, second.id);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn invoice_reference_is_write_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);
    let now = Utc::now();
    let event = BillingEvent::open(Uuid::new_v4(), Uuid::new_v4(), "plan_stream_hourly", now);
    store.insert_open_event(&event).await.unwrap();
    store.close_event(event.id, now + Duration::minutes(30)).await.unwrap();

    assert!(store
        .mark_invoiced(event.id, "mbur_1", Decimal::new(150, 2))
        .await
        .unwrap());
    assert!(!store
        .mark_invoiced(event.id, "mbur_2", Decimal::new(300, 2))
        .await
        .unwrap());

    let stored = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.invoice_item_id.as_deref(), Some("mbur_1"));
    assert_eq!(stored.amount_billed, Decimal::new(150, 2));

    let pending = store
        .find_events(&EventFilter::uninvoiced(), Pagination::default())
        .await
        .unwrap();
    assert!(pending.results.iter().all(|pending| pending.id != event.id));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn server_rows_round_trip_status_codes(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);
    let owner_id = Uuid::new_v4();
    let server = StreamServer::starting(owner_id, "edge-1", "main");
    store.insert_server(&server).await.unwrap();

    let updated = store
        .update_server(
            server.id,
            &ServerPatch {
                provision_handle: Some(ProvisionHandle(77)),
                status: Some(ServerStatus::Ready),
                ..ServerPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.provision_handle, Some(ProvisionHandle(77)));
    assert_eq!(updated.status, ServerStatus::Ready);
    assert_eq!(updated.server_name, "edge-1");

    let page = store.list_servers(owner_id, Pagination::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.results, vec![updated]);

    assert!(store.delete_server(server.id).await.unwrap());
    assert!(!store.delete_server(server.id).await.unwrap());
    let err = store
        .update_server(server.id, &ServerPatch::status(ServerStatus::Errored))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
