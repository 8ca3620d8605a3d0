//! End-to-end tests for message submission, delivery, claim, and
//! request/response flows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quorum_core::{
    AuditFilter, Coordinator, DeliveryStatus, MessageKind, MessageStatus, QuorumError, Submit,
};
use serde_json::json;

#[test]
fn test_ask_reply_round_trip() {
    let coordinator = Arc::new(Coordinator::in_memory().unwrap());
    let asker = coordinator.messenger("a1").unwrap();
    let responder = coordinator.messenger("cm").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let responder_done = done.clone();
    let responder_thread = std::thread::spawn(move || {
        // Serve exactly one context query, the way a context-manager
        // agent's loop would.
        while !responder_done.load(Ordering::Relaxed) {
            let messages = responder.receive(10).unwrap();
            for msg in messages {
                if msg.kind == MessageKind::ContextQuery && responder.claim(&msg.id).unwrap() {
                    responder
                        .reply(&msg, json!({"context": {"framework": "React 18"}}))
                        .unwrap();
                    responder_done.store(true, Ordering::Relaxed);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let response = asker
        .ask(
            "cm",
            MessageKind::ContextQuery,
            json!({"query": "ui"}),
            Duration::from_secs(5),
        )
        .unwrap();
    done.store(true, Ordering::Relaxed);
    responder_thread.join().unwrap();

    assert_eq!(response["context"]["framework"], "React 18");
    assert_eq!(coordinator.maintenance().dead_letter_count().unwrap(), 0);

    // The audit trail shows the whole exchange.
    let audit = coordinator.audit();
    for kind in ["message.submit", "message.claim", "message.reply", "message.complete"] {
        assert!(
            !audit.by_kind(kind, 10).unwrap().is_empty(),
            "missing audit events of kind {}",
            kind
        );
    }
}

#[test]
fn test_concurrent_claim_exactly_once() {
    let coordinator = Arc::new(Coordinator::in_memory().unwrap());
    let broker = coordinator.broker();

    let message_id = broker
        .submit(Submit::direct("sender", "w", MessageKind::TaskClaim, json!({"unit": 1})))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let broker = broker.clone();
        let message_id = message_id.clone();
        handles.push(std::thread::spawn(move || broker.claim("w", &message_id).unwrap()));
    }
    let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|&&won| won).count(), 1);

    let msg = broker.get(&message_id).unwrap();
    assert_eq!(msg.status, MessageStatus::Processing);
    assert_eq!(msg.delivery_count, 1);
}

#[test]
fn test_broadcast_delivery_tracking() {
    let coordinator = Coordinator::in_memory().unwrap();
    let registry = coordinator.registry();
    for agent in ["a", "b", "c"] {
        registry.subscribe(agent, "general").unwrap();
    }

    let broker = coordinator.broker();
    let message_id = broker
        .submit(Submit::broadcast("announcer", MessageKind::Broadcast, json!({"note": "hi"})))
        .unwrap();

    let tracker = coordinator.broadcasts();
    let stats = tracker.status(&message_id).unwrap();
    assert_eq!((stats.delivered, stats.acknowledged, stats.skipped), (3, 0, 0));

    // Each subscriber sees the broadcast until they act on it.
    let visible = broker.peek("a", &["general".to_string()], 10).unwrap();
    assert_eq!(visible.len(), 1);

    assert!(broker.claim("a", &message_id).unwrap());
    let stats = tracker.status(&message_id).unwrap();
    assert_eq!((stats.delivered, stats.acknowledged, stats.skipped), (2, 1, 0));

    // A second claim by the same recipient fails, and the message is gone
    // from their peek.
    assert!(!broker.claim("a", &message_id).unwrap());
    assert!(broker.peek("a", &["general".to_string()], 10).unwrap().is_empty());

    // Other recipients still see it.
    assert_eq!(broker.peek("b", &["general".to_string()], 10).unwrap().len(), 1);

    // Dismissal moves the row to skipped.
    assert!(broker.dismiss("b", &message_id).unwrap());
    let stats = tracker.status(&message_id).unwrap();
    assert_eq!((stats.delivered, stats.acknowledged, stats.skipped), (1, 1, 1));
    assert_eq!(
        tracker.recipient_state(&message_id, "b").unwrap(),
        Some(DeliveryStatus::Skipped)
    );
}

#[test]
fn test_late_subscriber_gets_no_delivery_row() {
    let coordinator = Coordinator::in_memory().unwrap();
    let registry = coordinator.registry();
    registry.subscribe("a", "general").unwrap();

    let broker = coordinator.broker();
    let message_id = broker
        .submit(Submit::broadcast("announcer", MessageKind::Broadcast, json!({})))
        .unwrap();

    registry.subscribe("late", "general").unwrap();

    let tracker = coordinator.broadcasts();
    assert_eq!(tracker.recipient_state(&message_id, "late").unwrap(), None);
    assert!(broker.peek("late", &["general".to_string()], 10).unwrap().is_empty());
}

#[test]
fn test_expiration_sweep() {
    let coordinator = Coordinator::in_memory().unwrap();
    let registry = coordinator.registry();
    registry.subscribe("a", "general").unwrap();

    let broker = coordinator.broker();
    let message_id = broker
        .submit(
            Submit::broadcast("s", MessageKind::Other("ping".to_string()), json!({}))
                .with_ttl(1),
        )
        .unwrap();
    assert_eq!(broker.peek("a", &["general".to_string()], 10).unwrap().len(), 1);

    std::thread::sleep(Duration::from_millis(1_100));
    let report = coordinator.maintenance().run_once().unwrap();
    assert_eq!(report.expired_messages, 1);

    assert!(broker.peek("a", &["general".to_string()], 10).unwrap().is_empty());
    assert!(matches!(
        broker.get(&message_id),
        Err(quorum_core::BrokerError::NotFound(_))
    ));
    // Delivery rows go with the parent.
    let tracker = coordinator.broadcasts();
    assert!(matches!(
        tracker.status(&message_id),
        Err(quorum_core::BrokerError::NotFound(_))
    ));
}

#[test]
fn test_peek_orders_by_priority_then_age() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let low = broker
        .submit(Submit::direct("s", "w", MessageKind::TaskUpdate, json!({})).with_priority(2))
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let urgent = broker
        .submit(Submit::direct("s", "w", MessageKind::TaskUpdate, json!({})).with_priority(9))
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let normal_old = broker
        .submit(Submit::direct("s", "w", MessageKind::TaskUpdate, json!({})).with_priority(5))
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let normal_new = broker
        .submit(Submit::direct("s", "w", MessageKind::TaskUpdate, json!({})).with_priority(5))
        .unwrap();

    let order: Vec<String> = broker
        .peek("w", &["general".to_string()], 10)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(order, vec![urgent, normal_old, normal_new, low]);
}

#[test]
fn test_submit_validation() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let bad_priority =
        broker.submit(Submit::direct("s", "w", MessageKind::Heartbeat, json!({})).with_priority(11));
    assert!(matches!(bad_priority, Err(quorum_core::BrokerError::InvalidMessage(_))));

    let bad_payload =
        broker.submit(Submit::direct("s", "w", MessageKind::Heartbeat, json!([1, 2])));
    assert!(matches!(bad_payload, Err(quorum_core::BrokerError::InvalidMessage(_))));

    let unknown_channel = broker.submit(
        Submit::broadcast("s", MessageKind::Broadcast, json!({})).on_channel("nonexistent"),
    );
    assert!(matches!(unknown_channel, Err(quorum_core::BrokerError::UnknownChannel(_))));
}

#[test]
fn test_submit_drain_exactly_once() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let message_id = broker
        .submit(Submit::direct("s", "w", MessageKind::ContextQuery, json!({"q": 1})))
        .unwrap();

    let visible = broker.peek("w", &["general".to_string()], 10).unwrap();
    assert_eq!(visible.len(), 1);
    assert!(broker.claim("w", &message_id).unwrap());
    broker.complete(&message_id, None).unwrap();

    // Drained: no longer pending anywhere.
    assert!(broker.peek("w", &["general".to_string()], 10).unwrap().is_empty());
    assert_eq!(broker.get(&message_id).unwrap().status, MessageStatus::Done);
}

#[test]
fn test_complete_unclaimed_message_is_rejected() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let message_id = broker
        .submit(Submit::direct("s", "w", MessageKind::Heartbeat, json!({})))
        .unwrap();
    let result = broker.complete(&message_id, None);
    assert!(matches!(result, Err(quorum_core::BrokerError::InvalidMessage(_))));
}

#[test]
fn test_reply_preserves_correlation() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let request_id = broker
        .submit(
            Submit::direct("a1", "cm", MessageKind::ContextQuery, json!({"q": "db"}))
                .with_correlation_id("corr-42"),
        )
        .unwrap();
    assert!(broker.claim("cm", &request_id).unwrap());

    let request = broker.get(&request_id).unwrap();
    let response_id = broker.reply(&request, json!({"answer": "postgres"})).unwrap();

    let response = broker.get(&response_id).unwrap();
    assert_eq!(response.correlation_id.as_deref(), Some("corr-42"));
    assert_eq!(response.from_agent, "cm");
    assert_eq!(response.to_agent.as_deref(), Some("a1"));
    assert_eq!(response.kind, MessageKind::ContextResponse);
    assert_eq!(response.priority, request.priority);
    assert_eq!(response.channel, request.channel);

    // The inbound request was completed by the reply.
    assert_eq!(broker.get(&request_id).unwrap().status, MessageStatus::Done);
}

#[test]
fn test_ask_times_out_without_responder() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let result = broker.ask(
        "a1",
        "nobody",
        MessageKind::ContextQuery,
        json!({}),
        Duration::from_millis(200),
    );
    assert!(matches!(result, Err(quorum_core::BrokerError::Timeout { .. })));
}

#[test]
fn test_failed_completion_records_error() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    let message_id = broker
        .submit(Submit::direct("s", "w", MessageKind::TaskUpdate, json!({})))
        .unwrap();
    assert!(broker.claim("w", &message_id).unwrap());
    broker.complete(&message_id, Some("handler crashed")).unwrap();

    let msg = broker.get(&message_id).unwrap();
    assert_eq!(msg.status, MessageStatus::Failed);
    assert_eq!(msg.error.as_deref(), Some("handler crashed"));
}

#[test]
fn test_messenger_auto_subscribes_general() {
    let coordinator = Coordinator::in_memory().unwrap();
    let agent = coordinator.messenger("w1").unwrap();

    assert_eq!(agent.channels().unwrap(), vec!["general".to_string()]);
    let health = agent.health().unwrap();
    assert_eq!(health.agent_id, "w1");

    // Another messenger for the same agent changes nothing observable but
    // the heartbeat timestamp.
    let _again = coordinator.messenger("w1").unwrap();
    assert_eq!(agent.channels().unwrap(), vec!["general".to_string()]);
}

#[test]
fn test_rate_limit_error_kind() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    // Capacity is 100; the refill of 10/s cannot keep up with a tight loop.
    let mut limited = false;
    for i in 0..120 {
        let result =
            broker.submit(Submit::direct("burst", "w", MessageKind::Heartbeat, json!({"i": i})));
        if matches!(result, Err(quorum_core::BrokerError::RateLimited { .. })) {
            limited = true;
            break;
        }
    }
    assert!(limited, "expected the token bucket to run dry");
}

#[test]
fn test_audit_is_append_ordered() {
    let coordinator = Coordinator::in_memory().unwrap();
    let broker = coordinator.broker();

    for i in 0..3 {
        broker
            .submit(Submit::direct("s", "w", MessageKind::Heartbeat, json!({"seq": i})))
            .unwrap();
    }

    let events = coordinator.audit().query(&AuditFilter::default()).unwrap();
    // Newest first; ids strictly decreasing.
    let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(ids, sorted);
}

#[test]
fn test_messenger_error_type_converts() {
    let coordinator = Coordinator::in_memory().unwrap();
    let agent = coordinator.messenger("w1").unwrap();

    let result = agent.complete("missing-id", None);
    assert!(matches!(result, Err(QuorumError::Broker(_))));
}
