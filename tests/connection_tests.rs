use std::time::Duration;

use apiflow::context::Context;
use apiflow::error::{ContextError, Error};
use apiflow::connection::ConnectionManager;
use apiflow::testkit::{self, ScriptedResponse, ScriptedServer};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn two_failures_then_success_takes_three_attempts() {
    let server = ScriptedServer::start(vec![
        ScriptedResponse::status(500),
        ScriptedResponse::status(503),
        ScriptedResponse::ok("{\"id\":1}"),
    ])
    .await
    .unwrap();
    let manager = ConnectionManager::new(testkit::config::connection(3)).unwrap();

    let response = assert_ok!(manager.get(&Context::background(), &server.url("/items/1")).await);
    assert_eq!(response.status(), 200);
    assert_eq!(server.requests(), 3);

    let stats = manager.stats();
    assert_eq!(stats.retry_attempts, 2);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 0);
}

#[tokio::test]
async fn put_with_body_is_replayed() {
    let server = ScriptedServer::start(vec![ScriptedResponse::status(502), ScriptedResponse::ok("")])
        .await
        .unwrap();
    let manager = ConnectionManager::new(testkit::config::connection(2)).unwrap();
    let request = manager
        .client()
        .put(server.url("/items/1"))
        .body("{\"name\":\"x\"}")
        .build()
        .unwrap();

    let response = assert_ok!(manager.do_with_retry(&Context::background(), request).await);
    assert_eq!(response.status(), 200);
    assert_eq!(server.request_lines(), vec!["PUT /items/1 HTTP/1.1"; 2]);
}

#[tokio::test]
async fn expired_context_sends_nothing() {
    let server = ScriptedServer::start(vec![ScriptedResponse::ok("unused")])
        .await
        .unwrap();
    let manager = ConnectionManager::new(testkit::config::connection(3)).unwrap();
    let ctx = Context::background();
    ctx.cancel();

    let err = assert_err!(manager.get(&ctx, &server.url("/")).await);
    assert!(matches!(err, Error::Context(ContextError::Canceled)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let server = ScriptedServer::start(vec![ScriptedResponse::status(503)])
        .await
        .unwrap();
    let mut policy = testkit::config::connection(5);
    policy.retry.base_delay_ms = 10_000;
    policy.retry.max_delay_ms = 10_000;
    let manager = ConnectionManager::new(policy).unwrap();
    let ctx = Context::background().with_timeout(Duration::from_millis(100));

    let started = std::time::Instant::now();
    let err = assert_err!(manager.get(&ctx, &server.url("/")).await);
    assert!(err.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(server.requests(), 1);
}
