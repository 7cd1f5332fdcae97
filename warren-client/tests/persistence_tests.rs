mod common;

use common::{body, next_delivery, stays_idle, TestBroker};
use std::time::Duration;
use warren::BrokerConfig;
use warren_client::*;

fn durable_config(dir: &tempfile::TempDir) -> BrokerConfig {
    BrokerConfig::default().with_data_dir(dir.path().to_string_lossy().into_owned())
}

#[tokio::test]
async fn test_queue_contents_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let broker = TestBroker::start_with(durable_config(&dir)).await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    channel
        .queue_declare("orders", QueueDeclareOptions { durable: true, ..Default::default() })
        .await
        .unwrap();
    for i in 1..=3 {
        channel
            .publish(
                "",
                "orders",
                PublishOptions::default(),
                BasicProperties::default().with_delivery_mode(2),
                format!("order-{i}"),
            )
            .await
            .unwrap();
    }

    // Take all three, acknowledge only the first
    let mut consumer = channel.consume("orders", "", ConsumeOptions::default()).await.unwrap();
    let first = next_delivery(&mut consumer).await;
    assert_eq!(body(&first), "order-1");
    next_delivery(&mut consumer).await;
    next_delivery(&mut consumer).await;
    channel.ack(first.delivery_tag, false).await.unwrap();
    // Round trip on the same channel so the ack is applied before closing
    channel.flow(true).await.unwrap();

    connection.close().await.unwrap();
    broker.stop().await;

    let broker = TestBroker::start_with(durable_config(&dir)).await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    let ok = channel
        .queue_declare("orders", QueueDeclareOptions { passive: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(ok.message_count, 2);

    let mut consumer = channel.consume("orders", "", ConsumeOptions::default()).await.unwrap();
    let second = next_delivery(&mut consumer).await;
    let third = next_delivery(&mut consumer).await;
    assert_eq!(body(&second), "order-2");
    assert_eq!(body(&third), "order-3");
    assert!(second.redelivered && third.redelivered);
    assert_eq!(second.properties.delivery_mode, Some(2));
    assert!(stays_idle(&mut consumer, Duration::from_millis(200)).await);

    channel.ack(0, true).await.unwrap();
    channel.flow(true).await.unwrap();
    connection.close().await.unwrap();
    broker.stop().await;

    // Everything acknowledged: the queue comes back empty
    let broker = TestBroker::start_with(durable_config(&dir)).await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    let ok = channel
        .queue_declare("orders", QueueDeclareOptions { passive: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(ok.message_count, 0);
    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_fanout_copies_are_recovered_per_queue() {
    let dir = tempfile::tempdir().unwrap();

    let broker = TestBroker::start_with(durable_config(&dir)).await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    for queue in ["left", "right"] {
        channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() })
            .await
            .unwrap();
        channel.queue_bind(queue, "amq.fanout", "").await.unwrap();
    }
    channel
        .publish("amq.fanout", "", PublishOptions::default(), BasicProperties::default(), "shared")
        .await
        .unwrap();

    // Consume and acknowledge the copy in "left" only
    let mut left = channel.consume("left", "", ConsumeOptions::default()).await.unwrap();
    let delivery = next_delivery(&mut left).await;
    left.ack(&delivery).await.unwrap();
    channel.flow(true).await.unwrap();

    connection.close().await.unwrap();
    broker.stop().await;

    let broker = TestBroker::start_with(durable_config(&dir)).await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    let passive = QueueDeclareOptions {
        passive: true,
        ..Default::default()
    };
    assert_eq!(channel.queue_declare("left", passive).await.unwrap().message_count, 0);
    assert_eq!(channel.queue_declare("right", passive).await.unwrap().message_count, 1);

    let mut right = channel.consume("right", "", ConsumeOptions::default()).await.unwrap();
    assert_eq!(body(&next_delivery(&mut right).await), "shared");

    connection.close().await.unwrap();
    broker.stop().await;
}
