//! End-to-end behaviour of the pipeline behind a host transport.

use std::time::Duration;

use http_interceptor::dispatch::{DispatchEvent, HeldEvent, ObserverDecision};
use http_interceptor::message::Direction;
use http_interceptor::pipeline::Decision;
use http_interceptor::transport::{serve_connection, Delivery};
use tokio::time::Instant;

mod common;

const BLOCK_A: &str = r#"
    [[rules]]
    name = "block-a"
    match = { type = "path_prefix", prefix = "/a" }
    action = { type = "drop" }
"#;

const HOLD_ALL: &str = r#"
    [hold]
    timeout_ms = 1000

    [[rules]]
    name = "hold-all"
    match = { type = "any" }
    action = { type = "hold" }
"#;

async fn next_held(observer: &mut http_interceptor::dispatch::Subscription) -> HeldEvent {
    loop {
        match observer.recv().await {
            Some(DispatchEvent::Held(event)) => return event,
            Some(_) => continue,
            None => panic!("dispatcher gone"),
        }
    }
}

#[tokio::test]
async fn test_drop_rule_rejects_without_forwarding() {
    let pipeline = common::pipeline(BLOCK_A);
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };
    handle.send_request("GET /a HTTP/1.1\r\nHost: origin\r\n\r\n");

    match handle.delivered.recv().await.unwrap() {
        Delivery::Reply(reply) => {
            assert_eq!(reply.status(), Some(403));
            assert_eq!(reply.header("connection"), Some("close"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
    task.await.unwrap();
    assert!(handle.delivered.recv().await.is_none(), "nothing else may be delivered");
    assert_eq!(pipeline.sessions().pending_count(), 0);
}

#[tokio::test]
async fn test_close_mode_drop_closes_silently() {
    let pipeline = common::pipeline(&format!("[drop]\nmode = \"close\"\n{}", BLOCK_A));
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();
    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };

    handle.send_request("GET /a/b HTTP/1.1\r\nHost: origin\r\n\r\n");
    assert!(matches!(handle.delivered.recv().await, Some(Delivery::Close)));
    task.await.unwrap();
}

#[tokio::test]
async fn test_unmatched_exchange_passes_through() {
    let pipeline = common::pipeline(BLOCK_A);
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();
    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };

    let request = "GET /b?x=1 HTTP/1.1\r\nHost: origin\r\nX-Odd:  spaced \r\n\r\n";
    handle.send_request(request);
    match handle.delivered.recv().await.unwrap() {
        Delivery::Forward { direction, message } => {
            assert_eq!(direction, Direction::Request);
            assert_eq!(&message.serialize()[..], request.as_bytes());
        }
        other => panic!("expected forward, got {:?}", other),
    }
    assert_eq!(pipeline.sessions().pending_count(), 1);

    let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    handle.send_response(response);
    match handle.delivered.recv().await.unwrap() {
        Delivery::Forward { direction, message } => {
            assert_eq!(direction, Direction::Response);
            assert_eq!(&message.serialize()[..], response.as_bytes());
        }
        other => panic!("expected forward, got {:?}", other),
    }
    assert_eq!(pipeline.sessions().pending_count(), 0);

    drop(handle.inbound);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hold_timeout_forwards_unchanged() {
    let pipeline = common::pipeline(HOLD_ALL);
    let mut observer = pipeline.dispatcher().subscribe();
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();
    let _task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };

    let request = "GET /slow HTTP/1.1\r\nHost: origin\r\n\r\n";
    let started = Instant::now();
    handle.send_request(request);
    let held = next_held(&mut observer).await;
    assert_eq!(held.direction, Direction::Request);
    assert_eq!(held.raw, request);

    match handle.delivered.recv().await.unwrap() {
        Delivery::Forward { message, .. } => assert_eq!(&message.serialize()[..], request.as_bytes()),
        other => panic!("expected forward after timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(pipeline.dispatcher().pending_count(), 0);

    match observer.recv().await {
        Some(DispatchEvent::Resolved { hold_id, outcome }) => {
            assert_eq!(hold_id, held.hold_id);
            assert_eq!(outcome, "timed_out");
        }
        other => panic!("expected resolution, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_hold_timeout_with_drop_policy() {
    let pipeline = common::pipeline(&format!("{}\n", HOLD_ALL).replace(
        "timeout_ms = 1000",
        "timeout_ms = 1000\ndefault_policy = \"drop\"",
    ));
    let mut observer = pipeline.dispatcher().subscribe();
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();
    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };

    handle.send_request("GET /slow HTTP/1.1\r\nHost: origin\r\n\r\n");
    next_held(&mut observer).await;
    match handle.delivered.recv().await.unwrap() {
        Delivery::Reply(reply) => assert_eq!(reply.status(), Some(403)),
        other => panic!("expected rejection after timeout, got {:?}", other),
    }
    task.await.unwrap();
    assert_eq!(pipeline.sessions().pending_count(), 0);
}

#[tokio::test]
async fn test_holds_on_separate_connections_are_independent() {
    let pipeline = common::pipeline(&HOLD_ALL.replace("timeout_ms = 1000", "timeout_ms = 60000"));
    let mut observer = pipeline.dispatcher().subscribe();

    let (transport_a, mut handle_a) = common::fake_transport();
    let (transport_b, mut handle_b) = common::fake_transport();
    for (transport, conn) in [(transport_a, common::connection()), (transport_b, common::connection())] {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await });
    }

    handle_a.send_request("GET /first HTTP/1.1\r\nHost: origin\r\n\r\n");
    handle_b.send_request("GET /second HTTP/1.1\r\nHost: origin\r\n\r\n");
    let one = next_held(&mut observer).await;
    let two = next_held(&mut observer).await;
    let (first, second) = if one.raw.contains("/first") { (one, two) } else { (two, one) };

    // Releasing the later hold must not wait for the earlier one.
    pipeline.dispatcher().decide(second.hold_id, ObserverDecision::Forward);
    assert!(matches!(handle_b.delivered.recv().await, Some(Delivery::Forward { .. })));
    assert!(handle_a.delivered.try_recv().is_err(), "first connection is still held");
    assert_eq!(pipeline.dispatcher().pending_count(), 1);

    pipeline.dispatcher().decide(first.hold_id, ObserverDecision::Drop);
    assert!(matches!(handle_a.delivered.recv().await, Some(Delivery::Reply(_))));
}

#[tokio::test]
async fn test_peer_hangup_cancels_hold() {
    let pipeline = common::pipeline(&HOLD_ALL.replace("timeout_ms = 1000", "timeout_ms = 60000"));
    let mut observer = pipeline.dispatcher().subscribe();
    let (transport, mut handle) = common::fake_transport();
    let conn = common::connection();
    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { serve_connection(transport, &pipeline, conn).await })
    };

    handle.send_request("GET /x HTTP/1.1\r\nHost: origin\r\n\r\n");
    let held = next_held(&mut observer).await;
    handle.peer_gone.cancel();

    assert!(matches!(handle.delivered.recv().await, Some(Delivery::Close)));
    task.await.unwrap();
    assert_eq!(pipeline.dispatcher().pending_count(), 0);
    assert_eq!(pipeline.sessions().pending_count(), 0);

    let ack = pipeline.dispatcher().decide(held.hold_id, ObserverDecision::Forward);
    assert_eq!(ack, http_interceptor::dispatch::DecisionAck::AlreadyResolved);
}

#[tokio::test]
async fn test_dropped_request_yields_no_response_events() {
    let pipeline = common::pipeline(&format!(
        "{}\n{}",
        BLOCK_A,
        r#"
        [[rules]]
        name = "hold-responses"
        target = "response"
        match = { type = "any" }
        action = { type = "hold" }
        "#
    ));
    let mut observer = pipeline.dispatcher().subscribe();
    let conn = common::connection();

    let decision = pipeline
        .process(b"GET /a HTTP/1.1\r\nHost: origin\r\n\r\n", Direction::Request, &conn)
        .await;
    assert!(matches!(decision, Decision::Drop { .. }));

    // A stray response on the same connection has nothing to pair with.
    let decision = pipeline
        .process(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", Direction::Response, &conn)
        .await;
    assert_eq!(decision, Decision::Drop { reply: None });
    assert!(observer.try_recv().is_none());
    assert_eq!(pipeline.dispatcher().pending_count(), 0);
}

#[tokio::test]
async fn test_pipelined_responses_pair_in_order() {
    let pipeline = common::pipeline("");
    let conn = common::connection();

    let mut ids = Vec::new();
    for path in ["/one", "/two"] {
        let raw = format!("GET {} HTTP/1.1\r\nHost: origin\r\n\r\n", path);
        match pipeline.process(raw.as_bytes(), Direction::Request, &conn).await {
            Decision::Forward { message, .. } => ids.push(message.correlation_id().unwrap()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    for expected in ids {
        match pipeline
            .process(b"HTTP/1.1 204 No Content\r\n\r\n", Direction::Response, &conn)
            .await
        {
            Decision::Forward { message, .. } => assert_eq!(message.correlation_id(), Some(expected)),
            other => panic!("expected forward, got {:?}", other),
        }
    }
    assert_eq!(pipeline.sessions().pending_count(), 0);
}
