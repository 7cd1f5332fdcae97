mod common;

use common::{next_delivery, TestBroker};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warren_client::*;

const PASSIVE: QueueDeclareOptions = QueueDeclareOptions {
    passive: true,
    durable: false,
    exclusive: false,
    auto_delete: false,
};

#[tokio::test]
async fn test_channel_exhaustion() {
    let broker = TestBroker::start().await;
    let config = ClientConfig::default().with_max_channels(2);
    let connection = Connection::dial_with_config(broker.addr, config).await.unwrap();

    let first = connection.channel().await.unwrap();
    let second = connection.channel().await.unwrap();
    assert_eq!((first.id(), second.id()), (1, 2));

    let err = connection.channel().await.unwrap_err();
    assert!(matches!(err, ClientError::MaxChannels { max: 2 }));

    // Closed ids are not handed out again
    first.close().await.unwrap();
    assert!(matches!(
        connection.channel().await,
        Err(ClientError::MaxChannels { .. })
    ));
    second
        .queue_declare("still-usable", QueueDeclareOptions::default())
        .await
        .unwrap();

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_soft_error_closes_only_the_channel() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let broken = connection.channel().await.unwrap();
    let healthy = connection.channel().await.unwrap();

    let err = broken.queue_declare("missing", PASSIVE).await.unwrap_err();
    assert!(err.is_channel_closed());
    assert_eq!(err.reply_code(), Some(404));
    assert!(broken.is_closed());

    // Later calls fail the same way without touching the wire
    let err = broken
        .queue_declare("other", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(404));

    assert!(connection.is_open());
    healthy
        .queue_declare("present", QueueDeclareOptions::default())
        .await
        .unwrap();
    healthy.queue_bind("present", "amq.fanout", "").await.unwrap();

    // Binding to a missing exchange is soft as well
    let err = healthy
        .queue_bind("present", "no-such-exchange", "")
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(404));
    assert!(connection.is_open());

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_hard_error_closes_the_connection() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    let bystander = connection.channel().await.unwrap();

    // Headers exchanges are not implemented
    let err = channel
        .exchange_declare("by-header", "headers", ExchangeDeclareOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_connection_closed());
    assert_eq!(err.reply_code(), Some(540));

    let err = bystander
        .queue_declare("anything", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(540));
    assert!(!connection.is_open());
    assert!(matches!(
        connection.channel().await,
        Err(ClientError::ConnectionClosed { code: 540, .. })
    ));

    // The broker keeps serving other connections
    let other = Connection::dial(broker.addr).await.unwrap();
    other.channel().await.unwrap();
    other.close().await.unwrap();

    broker.stop().await;
}

#[tokio::test]
async fn test_exchange_lifecycle() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    channel
        .exchange_declare("events", "direct", ExchangeDeclareOptions::default())
        .await
        .unwrap();
    channel
        .exchange_declare("events", "direct", ExchangeDeclareOptions { passive: true, ..Default::default() })
        .await
        .unwrap();
    channel
        .queue_declare("sink", QueueDeclareOptions::default())
        .await
        .unwrap();
    channel.queue_bind("sink", "events", "k").await.unwrap();

    let err = channel.exchange_delete("events", true).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(406));

    let channel = connection.channel().await.unwrap();
    channel.exchange_delete("events", false).await.unwrap();
    let err = channel
        .exchange_declare("events", "direct", ExchangeDeclareOptions { passive: true, ..Default::default() })
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(404));

    let channel = connection.channel().await.unwrap();
    let err = channel.exchange_delete("", false).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(403));

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_queue_delete_cancels_consumers() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    let admin = connection.channel().await.unwrap();

    channel
        .queue_declare("doomed", QueueDeclareOptions::default())
        .await
        .unwrap();
    let mut consumer = channel.consume("doomed", "", ConsumeOptions::default()).await.unwrap();

    let err = admin
        .queue_delete("doomed", QueueDeleteOptions { if_unused: true, ..Default::default() })
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(406));

    let admin = connection.channel().await.unwrap();
    assert_eq!(
        admin
            .queue_delete("doomed", QueueDeleteOptions::default())
            .await
            .unwrap(),
        0
    );

    let ended = tokio::time::timeout(common::RECV_TIMEOUT, consumer.recv())
        .await
        .expect("consumer was not cancelled");
    assert!(ended.is_none());

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_auto_delete_queue_goes_with_last_consumer() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();

    channel
        .queue_declare("ephemeral", QueueDeclareOptions { auto_delete: true, ..Default::default() })
        .await
        .unwrap();
    let consumer = channel.consume("ephemeral", "", ConsumeOptions::default()).await.unwrap();
    consumer.cancel().await.unwrap();

    let err = channel.queue_declare("ephemeral", PASSIVE).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(404));

    connection.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_exclusive_queue_is_locked_to_its_owner() {
    let broker = TestBroker::start().await;
    let owner = Connection::dial(broker.addr).await.unwrap();
    let intruder = Connection::dial(broker.addr).await.unwrap();

    let channel = owner.channel().await.unwrap();
    channel
        .queue_declare("private", QueueDeclareOptions { exclusive: true, ..Default::default() })
        .await
        .unwrap();
    channel
        .publish("", "private", PublishOptions::default(), BasicProperties::default(), "mine")
        .await
        .unwrap();
    let mut consumer = channel.consume("private", "", ConsumeOptions::default()).await.unwrap();
    next_delivery(&mut consumer).await;

    let other = intruder.channel().await.unwrap();
    let err = other
        .consume("private", "", ConsumeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(405));

    // The queue disappears with its owner
    owner.close().await.unwrap();
    let mut gone = false;
    for _ in 0..50 {
        let probe = intruder.channel().await.unwrap();
        match probe.queue_declare("private", PASSIVE).await {
            Err(err) if err.reply_code() == Some(404) => {
                gone = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(gone);

    intruder.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_duplicate_consumer_tag_is_hard_error() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    channel
        .queue_declare("tagged", QueueDeclareOptions::default())
        .await
        .unwrap();

    let _first = channel.consume("tagged", "same", ConsumeOptions::default()).await.unwrap();
    let err = channel
        .consume("tagged", "same", ConsumeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(530));
    assert!(err.is_connection_closed());

    broker.stop().await;
}

#[tokio::test]
async fn test_broker_shutdown_force_closes_clients() {
    let broker = TestBroker::start().await;
    let connection = Connection::dial(broker.addr).await.unwrap();
    let channel = connection.channel().await.unwrap();
    assert_eq!(broker.server.connection_count(), 1);

    broker.stop().await;

    let err = channel
        .queue_declare("late", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(320));
    assert!(!connection.is_open());
}

#[tokio::test]
async fn test_wrong_protocol_header_is_answered_with_ours() {
    let broker = TestBroker::start().await;
    let mut stream = TcpStream::connect(broker.addr).await.unwrap();
    stream.write_all(b"AMQP\x00").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"AMQP\x01");

    broker.stop().await;
}
