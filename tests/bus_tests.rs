use std::sync::Arc;
use std::time::Duration;

use apiflow::bus::{handler_fn, Event, EventBus, ANY, REQUEST_COMPLETED, TASK_COMPLETED};
use apiflow::config::{EventBusConfig, OverflowPolicy};
use apiflow::context::Context;
use apiflow::error::{ContextError, Error};
use apiflow::testkit;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;

fn recorder(sink: Arc<Mutex<Vec<u64>>>) -> Arc<dyn apiflow::bus::EventHandler> {
    handler_fn(move |_ctx, event: Event| {
        let sink = sink.clone();
        async move {
            sink.lock().push(event.data.as_u64().unwrap_or_default());
            Ok::<_, anyhow::Error>(())
        }
    })
}

#[tokio::test]
async fn slow_subscriber_does_not_hold_back_fast_one() {
    let bus = EventBus::new(testkit::config::event_bus()).unwrap();
    let fast = Arc::new(Mutex::new(Vec::new()));
    let slow = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_async(REQUEST_COMPLETED, recorder(fast.clone()))
        .unwrap();

    let slow_sink = slow.clone();
    bus.subscribe_async(
        REQUEST_COMPLETED,
        handler_fn(move |_ctx, event: Event| {
            let sink = slow_sink.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.lock().push(event.data.as_u64().unwrap_or_default());
                Ok::<_, anyhow::Error>(())
            }
        }),
    )
    .unwrap();

    for i in 0..10u64 {
        bus.publish_async(Event::new(REQUEST_COMPLETED, "client", json!(i)))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fast.lock().len(), 10, "fast subscriber finished first");
    assert!(slow.lock().len() < 10);

    assert!(bus.close().await);
    assert_eq!(*fast.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(*slow.lock(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn drop_oldest_keeps_latest_event() {
    let bus = EventBus::new(EventBusConfig {
        subscriber_buffer_size: 1,
        overflow_policy: OverflowPolicy::DropOldest,
        ..testkit::config::event_bus()
    })
    .unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let blocked = gate.clone();
    let sink = seen.clone();
    bus.subscribe_async(
        TASK_COMPLETED,
        handler_fn(move |_ctx, event: Event| {
            let blocked = blocked.clone();
            let sink = sink.clone();
            async move {
                let _permit = blocked.acquire().await?;
                sink.lock().push(event.data.as_u64().unwrap_or_default());
                Ok::<_, anyhow::Error>(())
            }
        }),
    )
    .unwrap();

    let ctx = Context::background();
    for i in 0..5u64 {
        bus.publish(&ctx, Event::new(TASK_COMPLETED, "queue", json!(i)))
            .await
            .unwrap();
    }
    gate.add_permits(5);
    assert!(bus.close().await);

    let seen = seen.lock().clone();
    assert_eq!(seen.last(), Some(&4));
    assert!(seen.len() <= 2);
    assert!(bus.stats().dropped_events >= 3);
}

#[tokio::test]
async fn wildcard_sees_every_type_and_cancelled_publish_is_rejected() {
    let bus = EventBus::new(testkit::config::event_bus()).unwrap();
    let all = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(ANY, recorder(all.clone())).unwrap();

    let ctx = Context::background();
    bus.publish(&ctx, Event::new(TASK_COMPLETED, "a", json!(1)))
        .await
        .unwrap();
    bus.publish(&ctx, Event::new("custom.thing", "b", json!(2)))
        .await
        .unwrap();
    assert_eq!(*all.lock(), vec![1, 2]);

    let cancelled = Context::background();
    cancelled.cancel();
    let err = bus
        .publish(&cancelled, Event::new(TASK_COMPLETED, "c", json!(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Context(ContextError::Canceled)));
    assert_eq!(all.lock().len(), 2);
    assert!(bus.close().await);
}
