mod common;

use common::{body, next_delivery, stays_idle, TestBroker, RECV_TIMEOUT};
use std::time::Duration;
use tokio::time::timeout;
use warren_client::*;

#[tokio::test]
async fn test_fanout_reaches_every_bound_queue() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    channel
        .exchange_declare("logs", "fanout", ExchangeDeclareOptions::default())
        .await
        .unwrap();
    let mut consumers = Vec::new();
    for queue in ["audit", "archive", "alerts"] {
        channel
            .queue_declare(queue, QueueDeclareOptions::default())
            .await
            .unwrap();
        channel.queue_bind(queue, "logs", "").await.unwrap();
        consumers.push(
            channel
                .consume(queue, "", ConsumeOptions { no_ack: true, ..Default::default() })
                .await
                .unwrap(),
        );
    }

    channel
        .publish("logs", "ignored", PublishOptions::default(), BasicProperties::default(), "boot")
        .await
        .unwrap();

    for consumer in &mut consumers {
        let delivery = next_delivery(consumer).await;
        assert_eq!(body(&delivery), "boot");
        assert_eq!(delivery.exchange, "logs");
        assert_eq!(delivery.routing_key, "ignored");
    }

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_direct_routes_by_key() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    for (queue, key) in [("reds", "red"), ("greens", "green")] {
        channel
            .queue_declare(queue, QueueDeclareOptions::default())
            .await
            .unwrap();
        channel.queue_bind(queue, "amq.direct", key).await.unwrap();
    }
    let mut reds = channel.consume("reds", "", ConsumeOptions::default()).await.unwrap();
    let mut greens = channel
        .consume("greens", "", ConsumeOptions::default())
        .await
        .unwrap();

    let props = BasicProperties::default().with_content_type("text/plain");
    channel
        .publish("amq.direct", "red", PublishOptions::default(), props.clone(), "apple")
        .await
        .unwrap();
    channel
        .publish("amq.direct", "green", PublishOptions::default(), props, "lime")
        .await
        .unwrap();

    let red = next_delivery(&mut reds).await;
    assert_eq!(body(&red), "apple");
    assert_eq!(red.properties.content_type.as_deref(), Some("text/plain"));
    assert!(!red.redelivered);
    assert_eq!(body(&next_delivery(&mut greens).await), "lime");
    reds.ack(&red).await.unwrap();

    // Nothing crosses over
    assert!(stays_idle(&mut reds, Duration::from_millis(200)).await);

    // After unbinding, "red" has no route
    channel.queue_unbind("reds", "amq.direct", "red").await.unwrap();
    channel
        .publish("amq.direct", "red", PublishOptions::default(), BasicProperties::default(), "cherry")
        .await
        .unwrap();
    assert!(stays_idle(&mut reds, Duration::from_millis(200)).await);

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    let declared = channel
        .queue_declare("", QueueDeclareOptions::default())
        .await
        .unwrap();
    assert!(declared.queue.starts_with("amq.gen-"));
    assert_eq!(declared.message_count, 0);

    channel
        .publish("", &declared.queue, PublishOptions::default(), BasicProperties::default(), "direct")
        .await
        .unwrap();
    let ok = channel
        .queue_declare(&declared.queue, QueueDeclareOptions { passive: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(ok.message_count, 1);

    let mut consumer = channel
        .consume(&declared.queue, "", ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(body(&next_delivery(&mut consumer).await), "direct");

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_unroutable_mandatory_publish_is_returned() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    let mut returns = channel.returns().unwrap();

    channel
        .publish(
            "amq.direct",
            "nowhere",
            PublishOptions { mandatory: true, ..Default::default() },
            BasicProperties::default(),
            "lost",
        )
        .await
        .unwrap();

    let returned = timeout(RECV_TIMEOUT, returns.recv())
        .await
        .expect("timed out waiting for basic.return")
        .expect("returns ended");
    assert_eq!(returned.reply_code, 313);
    assert_eq!(returned.exchange, "amq.direct");
    assert_eq!(returned.routing_key, "nowhere");
    assert_eq!(&returned.body[..], b"lost");

    // Without mandatory the message is dropped silently
    channel
        .publish("amq.direct", "nowhere", PublishOptions::default(), BasicProperties::default(), "gone")
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), returns.recv()).await.is_err());

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_large_body_spans_frames() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    channel
        .queue_declare("blobs", QueueDeclareOptions::default())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
    channel
        .publish("", "blobs", PublishOptions::default(), BasicProperties::default(), payload.clone())
        .await
        .unwrap();

    let mut consumer = channel.consume("blobs", "", ConsumeOptions::default()).await.unwrap();
    let delivery = next_delivery(&mut consumer).await;
    assert_eq!(delivery.body.len(), payload.len());
    assert_eq!(&delivery.body[..], &payload[..]);

    connection.close().await.unwrap();
    broker.stop().await;
}
