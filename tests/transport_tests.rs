#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowhost::messaging::{
    publish, BusMessage, BusRegistry, ExchangeType, FileBus, Listener, MemoryBus, MessageBus, MmapBus, TopicMatchMode,
    TypeRoutes,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order: u32,
}

impl BusMessage for OrderPlaced {
    const TYPE_TAG: &'static str = "test.order-placed";
}

/// Every transport, each over its own scratch space.
fn transports(dir: &std::path::Path) -> Vec<(&'static str, Arc<dyn MessageBus>)> {
    vec![
        ("memory", Arc::new(MemoryBus::new(BusRegistry::new())) as Arc<dyn MessageBus>),
        (
            "file",
            Arc::new(FileBus::new(dir.join("file")).with_poll_interval(Duration::from_millis(20))),
        ),
        ("mmap", Arc::new(MmapBus::new(dir.join("mmap")))),
    ]
}

#[tokio::test]
async fn direct_exchange_routes_by_binding_on_every_transport() {
    let td = tempfile::tempdir().unwrap();
    for (name, bus) in transports(td.path()) {
        let exchange = bus.declare_exchange("orders", ExchangeType::Direct).await.unwrap();
        exchange.declare_queue("A", &["x"]).await.unwrap();
        exchange.declare_queue("B", &["y"]).await.unwrap();

        let delivered = publish(exchange.as_ref(), &OrderPlaced { order: 1 }, "x").await.unwrap();
        assert_eq!(delivered, vec!["A".to_string()], "{name}");
        let dropped = publish(exchange.as_ref(), &OrderPlaced { order: 2 }, "z").await.unwrap();
        assert!(dropped.is_empty(), "{name}");

        let a = exchange.open_inbox("A").await.unwrap();
        let got = a.wait_for_messages(Duration::from_millis(200)).await.unwrap();
        assert_eq!(got.len(), 1, "{name}");
        let order: OrderPlaced = got[0].envelope.open().unwrap();
        assert_eq!(order.order, 1, "{name}");
        for delivery in got {
            delivery.ack.acknowledged().await.unwrap();
        }

        let b = exchange.open_inbox("B").await.unwrap();
        assert!(b.wait_for_messages(Duration::from_millis(50)).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn fanout_reaches_every_queue_on_every_transport() {
    let td = tempfile::tempdir().unwrap();
    for (name, bus) in transports(td.path()) {
        let exchange = bus.declare_exchange("news", ExchangeType::Fanout).await.unwrap();
        for queue in ["n1", "n2", "n3"] {
            exchange.declare_queue(queue, &[queue]).await.unwrap();
        }
        let mut delivered = publish(exchange.as_ref(), &OrderPlaced { order: 7 }, "ignored")
            .await
            .unwrap();
        delivered.sort();
        assert_eq!(delivered, vec!["n1", "n2", "n3"], "{name}");
    }
}

#[tokio::test]
async fn topic_exchange_honours_match_mode() {
    let segmented = MemoryBus::new(BusRegistry::new());
    let exchange = segmented.declare_exchange("events", ExchangeType::Topic).await.unwrap();
    exchange.declare_queue("all", &["#"]).await.unwrap();
    exchange.declare_queue("orders", &["orders.*"]).await.unwrap();
    let mut delivered = exchange
        .send(flowhost::messaging::Envelope::new("t", Vec::new()), "orders.created")
        .await
        .unwrap();
    delivered.sort();
    assert_eq!(delivered, vec!["all", "orders"]);
    let delivered = exchange
        .send(flowhost::messaging::Envelope::new("t", Vec::new()), "billing.created")
        .await
        .unwrap();
    assert_eq!(delivered, vec!["all"]);

    let legacy = MemoryBus::new(BusRegistry::new()).with_topic_match(TopicMatchMode::LegacyKeySplit);
    let exchange = legacy.declare_exchange("events", ExchangeType::Topic).await.unwrap();
    exchange.declare_queue("orders", &["orders.*"]).await.unwrap();
    let delivered = exchange
        .send(flowhost::messaging::Envelope::new("t", Vec::new()), "billing.created")
        .await
        .unwrap();
    assert_eq!(delivered, vec!["orders"]);
}

#[tokio::test]
async fn listener_dispatches_typed_messages_over_file_and_mmap() {
    let td = tempfile::tempdir().unwrap();
    for (name, bus) in transports(td.path()).into_iter().skip(1) {
        let exchange = bus.declare_exchange("work", ExchangeType::Direct).await.unwrap();
        exchange.declare_queue("worker", &[]).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut listener = Listener::new(exchange.open_inbox("worker").await.unwrap(), Duration::from_millis(20));
        listener
            .listen(TypeRoutes::new().route::<OrderPlaced, _, _>(move |msg, _cancel, ack| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(msg.order);
                    ack.acknowledged().await.unwrap();
                }
            }))
            .await;

        for order in 1..=3 {
            publish(exchange.as_ref(), &OrderPlaced { order }, "any").await.unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while seen.lock().unwrap().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        listener.dispose().await;

        let mut orders = seen.lock().unwrap().clone();
        orders.sort();
        assert_eq!(orders, vec![1, 2, 3], "{name}");
    }
}

#[tokio::test]
async fn deleted_exchange_is_forgotten() {
    let td = tempfile::tempdir().unwrap();
    for (name, bus) in transports(td.path()) {
        let exchange = bus.declare_exchange("gone", ExchangeType::Fanout).await.unwrap();
        exchange.declare_queue("q", &[]).await.unwrap();
        bus.delete_exchange("gone").await.unwrap();
        assert!(bus.specify_exchange("gone").await.unwrap().is_none(), "{name}");
    }
}
