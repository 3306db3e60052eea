mod common;

use common::{fields, memory_client, FakeRemote};
use erpsync_core::{EntityType, LocalId};
use erpsync_offline::{
    AbortReason, ConnectivityState, GatewayError, MutationOperation, PendingMutation, RemoteError,
    SyncPolicy, SyncState,
};
use serde_json::json;

#[tokio::test]
async fn offline_customer_is_listed_pending_then_synced() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    let customers = client.customers();

    client.oracle().report(ConnectivityState::Offline);
    let outcome = customers.create(json!({"customer_name": "Acme"})).await.unwrap();
    assert!(outcome.offline);
    let local_id = outcome.local_id().unwrap();

    let views = customers.list().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(customers.title(&views[0]), Some("Acme"));
    assert_eq!(views[0].sync_state, SyncState::Pending);
    assert_eq!(views[0].local_id, Some(local_id));
    assert_eq!(remote.call_count(), 0);

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.synced.len(), 1);

    let record = client.engine().store().get(local_id).await.unwrap();
    assert_eq!(record.sync_state, SyncState::Synced);
    assert_eq!(record.remote_id.as_deref(), Some("CUSTOMER-0001"));
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());

    // Online list shows the server document once, linked to the local record.
    let views = customers.list().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].local_id, Some(local_id));
    assert_eq!(views[0].remote_id.as_deref(), Some("CUSTOMER-0001"));
}

#[tokio::test]
async fn online_writes_go_straight_to_the_server() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Online);

    let outcome = client.tasks().create(json!({"subject": "Visit site"})).await.unwrap();
    assert!(!outcome.offline);
    assert_eq!(outcome.remote_id(), Some("TASK-0001"));
    assert_eq!(remote.call_count(), 1);
    assert_eq!(client.tasks().counts().await.unwrap().pending, 0);
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());
}

#[tokio::test]
async fn unknown_connectivity_refuses_writes() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;

    let err = client
        .quotations()
        .create(json!({"party_name": "Acme"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ConnectivityIndeterminate));

    let err = client
        .quotations()
        .update("QTN-0001", json!({"status": "Lost"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ConnectivityIndeterminate));

    assert!(client.quotations().list().await.unwrap().is_empty());
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn non_object_payloads_are_rejected() {
    let client = memory_client(FakeRemote::new()).await;
    client.oracle().report(ConnectivityState::Offline);

    let err = client.customers().create(json!("Acme")).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidPayload(_)));
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());
}

#[tokio::test]
async fn replay_is_fifo_across_entity_types() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);

    client.sales_orders().create(json!({"customer": "CUST-1"})).await.unwrap();
    client.customers().create(json!({"customer_name": "Globex"})).await.unwrap();
    client.tasks().create(json!({"subject": "Follow up"})).await.unwrap();

    client.oracle().report(ConnectivityState::Online);
    client.engine().run_sync_cycle().await.unwrap();

    let order: Vec<_> = remote.calls().iter().map(|c| c.entity).collect();
    assert_eq!(
        order,
        vec![EntityType::SalesOrder, EntityType::Customer, EntityType::Task]
    );
}

#[tokio::test]
async fn second_cycle_without_writes_makes_no_remote_calls() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);
    client.customers().create(json!({"customer_name": "Acme"})).await.unwrap();
    client.check_ins().create(json!({"employee": "EMP-1", "log_type": "IN"})).await.unwrap();

    client.oracle().report(ConnectivityState::Online);
    let first = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(first.remote_calls, 2);

    let second = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(second.remote_calls, 0);
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test]
async fn permanent_failure_is_surfaced_and_not_retried() {
    let remote = FakeRemote::new();
    remote.reject_when("customer", json!("CUST-404"), "Could not find Customer: CUST-404");
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);

    let bad = client
        .sales_orders()
        .create(json!({"customer": "CUST-404"}))
        .await
        .unwrap()
        .local_id()
        .unwrap();
    let good = client
        .sales_orders()
        .create(json!({"customer": "CUST-1"}))
        .await
        .unwrap()
        .local_id()
        .unwrap();

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].mutation_id, bad);
    assert!(report.failed[0].error.contains("CUST-404"));
    // a rejection does not hold back later entries
    assert_eq!(report.synced.len(), 1);

    let failed = client.sales_orders().failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].local_id, bad);
    assert!(failed[0].last_error.as_deref().unwrap().contains("CUST-404"));
    assert_eq!(
        client.engine().store().get(good).await.unwrap().sync_state,
        SyncState::Synced
    );

    let again = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(again.remote_calls, 0);
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test]
async fn transient_failure_stops_the_cycle_and_keeps_order() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);

    let first = client.customers().create(json!({"customer_name": "A"})).await.unwrap();
    client.customers().create(json!({"customer_name": "B"})).await.unwrap();

    client.oracle().report(ConnectivityState::Online);
    remote.fail_next(RemoteError::status(503, "maintenance"));

    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.aborted, Some(AbortReason::TransientFailure));
    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.retried[0].attempt_count, 1);
    assert_eq!(remote.call_count(), 1);

    let head = client
        .engine()
        .queue()
        .get(first.local_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.attempt_count, 1);
    assert!(head.last_error.as_deref().unwrap().contains("maintenance"));

    let report = client.engine().run_sync_cycle().await.unwrap();
    assert!(report.is_clean());
    let names: Vec<_> = remote
        .calls()
        .iter()
        .map(|c| c.payload["customer_name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["A", "A", "B"]);
}

#[tokio::test]
async fn attempt_ceiling_turns_transient_into_permanent() {
    let remote = FakeRemote::new();
    let db = erpsync_offline::Database::in_memory().await.unwrap();
    let client = common::client_with(db, remote.clone(), SyncPolicy::default().with_max_attempts(2)).await;
    client.oracle().report(ConnectivityState::Offline);
    let id = client
        .tasks()
        .create(json!({"subject": "Flaky"}))
        .await
        .unwrap()
        .local_id()
        .unwrap();

    client.oracle().report(ConnectivityState::Online);
    remote.fail_next(RemoteError::Timeout("20s".into()));
    remote.fail_next(RemoteError::Timeout("20s".into()));

    let first = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(first.retried.len(), 1);

    let second = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(second.failed.len(), 1);
    assert!(second.failed[0].error.contains("gave up after 2 attempts"));

    let record = client.engine().store().get(id).await.unwrap();
    assert_eq!(record.sync_state, SyncState::Failed);
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());
}

#[tokio::test]
async fn connection_lost_mid_cycle_leaves_the_rest_queued() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);
    for n in 0..3 {
        client.tasks().create(json!({"subject": format!("task {n}")})).await.unwrap();
    }

    let oracle = client.oracle().clone();
    remote.after_call(move |n| {
        if n == 1 {
            oracle.report(ConnectivityState::Offline);
        }
    });

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.aborted, Some(AbortReason::ConnectionLost));
    assert_eq!(report.synced.len(), 1);
    assert_eq!(client.pending_uploads().await.unwrap().mutations.len(), 2);

    let counts = client.tasks().counts().await.unwrap();
    assert_eq!((counts.pending, counts.synced), (2, 1));
}

#[tokio::test]
async fn synced_record_with_leftover_mutation_is_not_resubmitted() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);
    let id = client
        .customers()
        .create(json!({"customer_name": "Acme"}))
        .await
        .unwrap()
        .local_id()
        .unwrap();

    // Simulate a crash after reconciling the record but before removing the mutation.
    client.engine().store().mark_synced(id, "CUSTOMER-0042").await.unwrap();

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.remote_calls, 0);
    assert_eq!(report.synced[0].remote_id, "CUSTOMER-0042");
    assert_eq!(remote.call_count(), 0);
    assert!(client.pending_uploads().await.unwrap().mutations.is_empty());
}

#[tokio::test]
async fn offline_update_is_replayed_against_the_document() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);

    let outcome = client
        .quotations()
        .update("QTN-0007", json!({"status": "Ordered"}))
        .await
        .unwrap();
    assert!(outcome.offline);
    let queued = client.pending_uploads().await.unwrap().mutations;
    assert_eq!(queued[0].operation, MutationOperation::Update);
    assert!(client.quotations().list().await.unwrap().is_empty());

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.synced[0].remote_id, "QTN-0007");
    assert_eq!(remote.calls()[0].remote_id.as_deref(), Some("QTN-0007"));
}

#[tokio::test]
async fn corrupt_queue_rows_do_not_block_later_ones() {
    let remote = FakeRemote::new();
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);
    client.customers().create(json!({"customer_name": "Before"})).await.unwrap();

    sqlx::query(
        "INSERT INTO pending_mutations (id, entity_type, operation, payload, created_at) \
         VALUES ('not-a-uuid', 'spaceship', 'Create', '{}', '2024-01-01T00:00:00Z')",
    )
    .execute(client.database().pool())
    .await
    .unwrap();

    client.customers().create(json!({"customer_name": "After"})).await.unwrap();

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert_eq!(report.synced.len(), 2);
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].raw_id, "not-a-uuid");
    assert_eq!(client.engine().queue().len().await.unwrap(), 0);
}

#[tokio::test]
async fn every_offline_record_ends_synced_or_failed() {
    let remote = FakeRemote::new();
    remote.reject_when("subject", json!(""), "Subject is mandatory");
    let client = memory_client(remote.clone()).await;
    client.oracle().report(ConnectivityState::Offline);

    for subject in ["a", "", "b", "", "c"] {
        client.tasks().create(json!({"subject": subject})).await.unwrap();
    }

    client.oracle().report(ConnectivityState::Online);
    let report = client.engine().run_sync_cycle().await.unwrap();
    assert!(report.retried.is_empty());

    let counts = client.tasks().counts().await.unwrap();
    assert_eq!((counts.pending, counts.synced, counts.failed), (0, 3, 2));
}

#[tokio::test]
async fn retired_ids_cannot_be_enqueued_again() {
    let client = memory_client(FakeRemote::new()).await;
    client.oracle().report(ConnectivityState::Offline);
    let id: LocalId = client
        .customers()
        .create(json!({"customer_name": "Acme"}))
        .await
        .unwrap()
        .local_id()
        .unwrap();

    client.oracle().report(ConnectivityState::Online);
    client.engine().run_sync_cycle().await.unwrap();

    let replay = PendingMutation::create(id, EntityType::Customer, fields(json!({"customer_name": "Acme"})));
    assert!(matches!(
        client.engine().queue().enqueue(&replay).await,
        Err(erpsync_offline::QueueError::DuplicateMutation(_))
    ));
}
