//! Integration tests for per-message outcomes
//!
//! These tests verify:
//! - Expired messages are dropped without delivery or dead-lettering
//! - Poison rows are moved to the error queue unchanged
//! - Delayed messages are forwarded or delivered locally
//! - The recoverability policy sees original headers and attempt counts

mod common;

use bytes::Bytes;
use common::*;
use std::sync::Arc;
use tablequeue_core::{
    MessageRow, OutgoingMessage, TransportTransactionMode, FORWARD_DESTINATION_HEADER,
};
use tokio::time::Duration;

// ============================================================================
// Expiry Tests
// ============================================================================

/// An expired message is neither delivered nor dead-lettered, and the receive
/// completes normally.
#[tokio::test(start_paused = true)]
async fn test_expired_message_is_dropped() {
    let storage = create_storage();
    storage
        .enqueue(
            &queue(INPUT_QUEUE),
            &OutgoingMessage::new("m-expired", headers(&[]), Bytes::from_static(b"late")),
            Some(Duration::ZERO),
        )
        .expect("enqueue expired message");
    enqueue(&storage, "m-1", headers(&[]));
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || {
        test.pump.stats().expired == 1 && test.handler.delivery_count() == 1
    })
    .await;
    test.pump.stop().await;

    let delivered: Vec<String> = test.handler.deliveries().into_iter().map(|(id, _)| id).collect();
    assert_eq!(delivered, vec!["m-1".to_string()]);
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 0);
    assert_eq!(storage.depth(&queue(ERROR_QUEUE)), 0);
    assert_eq!(test.policy.call_count(), 0);
    assert_eq!(test.critical.count(), 0);
}

// ============================================================================
// Poison Message Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_poison_row_is_moved_to_error_queue_unchanged() {
    let storage = create_storage();
    let poison = MessageRow {
        id: "m-poison".to_string(),
        headers: "{\"unterminated".to_string(),
        body: Bytes::from_static(b"raw bytes"),
        expired: false,
    };
    storage
        .insert_row(&queue(INPUT_QUEUE), poison.clone())
        .expect("insert poison row");
    enqueue(&storage, "m-1", headers(&[]));
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || {
        storage.depth(&queue(ERROR_QUEUE)) == 1 && test.handler.delivery_count() == 1
    })
    .await;
    test.pump.stop().await;

    assert_eq!(storage.rows(&queue(ERROR_QUEUE)), vec![poison]);
    assert_eq!(test.handler.deliveries()[0].0, "m-1");
    assert_eq!(test.policy.call_count(), 0);
    assert_eq!(test.pump.stats().poison, 1);
}

// ============================================================================
// Forwarding Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_delayed_message_is_forwarded_to_destination() {
    let storage = create_storage();
    enqueue(
        &storage,
        "m-remote",
        headers(&[(FORWARD_DESTINATION_HEADER, AUDIT_QUEUE), ("custom", "kept")]),
    );
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || storage.depth(&queue(AUDIT_QUEUE)) == 1).await;
    test.pump.stop().await;

    let audit_rows = storage.rows(&queue(AUDIT_QUEUE));
    let forwarded = &audit_rows[0];
    assert_eq!(forwarded.id, "m-remote");
    assert!(forwarded.headers.contains("custom"));
    assert!(!forwarded.headers.contains(FORWARD_DESTINATION_HEADER));
    assert_eq!(forwarded.body, Bytes::from("body-m-remote"));
    assert_eq!(test.handler.delivery_count(), 0);
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 0);
    assert_eq!(test.pump.stats().forwarded, 1);
}

/// A forward destination equal to the input queue means "deliver here".
#[tokio::test(start_paused = true)]
async fn test_delayed_message_for_input_queue_is_delivered_locally() {
    let storage = create_storage();
    enqueue(
        &storage,
        "m-local",
        headers(&[(FORWARD_DESTINATION_HEADER, INPUT_QUEUE), ("custom", "kept")]),
    );
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || test.handler.delivery_count() == 1).await;
    test.pump.stop().await;

    let deliveries = test.handler.deliveries();
    let (id, seen_headers) = &deliveries[0];
    assert_eq!(id, "m-local");
    assert_eq!(seen_headers, &headers(&[("custom", "kept")]));
    assert_eq!(storage.depth(&queue(AUDIT_QUEUE)), 0);
    assert_eq!(test.pump.stats().forwarded, 0);
}

// ============================================================================
// Recoverability Tests
// ============================================================================

/// The policy sees the headers read from the row, not the handler's mutations.
#[tokio::test(start_paused = true)]
async fn test_policy_receives_original_headers() {
    let storage = create_storage();
    enqueue(&storage, "m-1", headers(&[("origin", "integration-test")]));
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;
    test.handler.set_failure("handler failed");
    test.handler.set_header_mutation(true);

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || test.policy.call_count() == 1).await;
    test.pump.stop().await;

    let calls = test.policy.get_calls();
    assert_eq!(calls[0].message_id, "m-1");
    assert_eq!(calls[0].headers, headers(&[("origin", "integration-test")]));
    assert_eq!(calls[0].processing_attempts, 1);
    assert_eq!(calls[0].error.to_string(), "handler failed");
    assert_eq!(calls[0].body, Bytes::from("body-m-1"));

    // The handler itself did see its own mutation
    assert!(test.handler.deliveries()[0].1.contains_key("test.mutated"));

    // Handled commits the receive
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 0);
    assert_eq!(test.critical.count(), 0);
    assert_eq!(test.pump.stats().failed, 1);
}

/// A retry verdict rolls the receive back; the attempt count grows until the
/// policy handles the message.
#[tokio::test]
async fn test_retry_verdict_redelivers_until_handled() {
    let storage = create_storage();
    enqueue(&storage, "m-1", headers(&[]));
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;
    test.handler.set_failure("still failing");
    test.policy.set_retry_until(3);

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || test.policy.call_count() == 3).await;
    test.pump.stop().await;

    let attempts: Vec<u32> = test
        .policy
        .get_calls()
        .iter()
        .map(|context| context.processing_attempts)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(test.handler.delivery_count(), 3);
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 0);
}

/// Without a receive transaction the row is gone before delivery, so a retry
/// verdict cannot bring it back.
#[tokio::test]
async fn test_retry_verdict_without_transaction_loses_message() {
    let storage = create_storage();
    enqueue(&storage, "m-1", headers(&[]));
    let mut settings = create_test_settings();
    settings.transaction_mode = TransportTransactionMode::None;
    let mut test = create_test_pump(Arc::clone(&storage), settings).await;
    test.handler.set_failure("failing once");
    test.policy.set_retry_until(5);

    test.pump.start(2).expect("start pump");
    wait_for(Duration::from_secs(10), || test.policy.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    test.pump.stop().await;

    assert_eq!(test.policy.call_count(), 1);
    assert_eq!(test.policy.get_calls()[0].processing_attempts, 1);
    assert_eq!(
        test.policy.get_calls()[0].transport_transaction.mode,
        TransportTransactionMode::None
    );
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 0);
}

/// A failing policy raises a critical error naming the message and leaves
/// the row in the queue.
#[tokio::test]
async fn test_policy_failure_raises_critical_error() {
    let storage = create_storage();
    enqueue(&storage, "m-1", headers(&[]));
    let mut test = create_test_pump(Arc::clone(&storage), create_test_settings()).await;
    test.handler.set_failure("handler failed");
    test.policy.set_error("policy unavailable");

    test.pump.start(1).expect("start pump");
    wait_for(Duration::from_secs(10), || test.critical.count() >= 1).await;
    test.pump.stop().await;

    assert_eq!(
        test.critical.descriptions()[0],
        "Failed to execute recoverability policy for message with native ID: `m-1`"
    );
    assert_eq!(test.critical.causes()[0], "policy unavailable");
    assert_eq!(storage.depth(&queue(INPUT_QUEUE)), 1);
    assert_eq!(storage.depth(&queue(ERROR_QUEUE)), 0);
    assert_eq!(storage.open_transactions(), 0);
}
