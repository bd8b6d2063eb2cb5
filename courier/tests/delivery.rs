//! Message router retry, expiry and backpressure behaviour.

mod common;

use common::{FlakyStub, SingleStubTransport, in_process, init_tracing};
use courier::{
    AddressResolver, DeliveryError, FailureAction, Message, MessageBuilder, MessageRouter,
    MessageType, MessagingConfig, MessagingStub, MessagingStubFactory, RouteError, RoutingTable,
    SuccessAction, TransmitError, Ttl,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn router_with(stub: Arc<dyn MessagingStub>, config: MessagingConfig) -> MessageRouter {
    let table = Arc::new(RoutingTable::new());
    table.put("provider".into(), in_process("provider"), false);
    let resolver = Arc::new(AddressResolver::new(table));
    let stubs = Arc::new(MessagingStubFactory::new().with_transport(Arc::new(SingleStubTransport(stub))));
    MessageRouter::new(config, resolver, stubs)
}

fn one_way(ttl: Duration) -> Message {
    MessageBuilder::new(MessageType::OneWay, "proxy", "provider")
        .ttl(Ttl::Relative(ttl))
        .build()
}

fn fast_retries() -> MessagingConfig {
    MessagingConfig::local().with_retry_interval(Duration::from_millis(20))
}

#[tokio::test]
async fn test_constant_failure_expires_at_ttl() {
    init_tracing();
    let stub = FlakyStub::always_failing();
    let router = router_with(stub.clone(), fast_retries());

    let ttl = Duration::from_millis(300);
    let started = Instant::now();
    let result = router.route(one_way(ttl)).unwrap().await;
    let elapsed = started.elapsed();

    let err = result.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(elapsed >= Duration::from_millis(250), "expired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "expired late: {elapsed:?}");
    assert!(stub.attempts() > 1);

    // No transmission after the deadline, and none once the outcome is reported.
    let attempted_at = stub.attempted_at();
    let last = attempted_at.last().copied().unwrap();
    // Expiry is carried in epoch milliseconds, so allow for that granularity.
    let deadline = started + ttl + Duration::from_millis(2);
    assert!(
        last < deadline,
        "attempted {:?} after the deadline",
        last.saturating_duration_since(deadline)
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stub.attempted_at().len(), attempted_at.len());
}

#[tokio::test]
async fn test_delivered_after_transient_failures() {
    init_tracing();
    let stub = FlakyStub::new(3);
    let router = router_with(stub.clone(), fast_retries());

    router
        .route(one_way(Duration::from_secs(5)))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(stub.attempts(), 4);
}

#[tokio::test]
async fn test_full_queue_rejects_new_messages() {
    let stub = FlakyStub::always_failing();
    let config = MessagingConfig::local()
        .with_queue_capacity(1)
        .with_retry_interval(Duration::from_secs(10));
    let router = router_with(stub.clone(), config);

    let _pending = router.route(one_way(Duration::from_secs(30))).unwrap();
    // Wait for the first attempt to fail and park the retry.
    while stub.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        router.route(one_way(Duration::from_secs(30))),
        Err(RouteError::BufferFull { capacity: 1 })
    ));
}

struct RejectingStub;

impl MessagingStub for RejectingStub {
    fn transmit(&self, _message: Arc<Message>, _on_success: SuccessAction, on_failure: FailureAction) {
        on_failure(TransmitError::NotSent("payload too large".into()));
    }
}

#[tokio::test]
async fn test_not_sent_is_terminal() {
    let router = router_with(Arc::new(RejectingStub), fast_retries());
    let result = router.route(one_way(Duration::from_secs(5))).unwrap().await;
    assert!(matches!(result, Err(DeliveryError::NotSent { reason, .. }) if reason == "payload too large"));
}

#[tokio::test]
async fn test_drain_before_shutdown() {
    let stub = FlakyStub::new(0);
    let router = router_with(stub, fast_retries());
    let ticket = router.route(one_way(Duration::from_secs(5))).unwrap();

    assert!(router.prepare_for_shutdown().await);
    ticket.await.unwrap();
    router.shutdown().await;
    assert!(matches!(
        router.route(one_way(Duration::from_secs(5))),
        Err(RouteError::Shutdown)
    ));
}
