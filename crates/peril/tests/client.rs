//! Integration tests for the connected client.
//!
//! The client is wired to the in-process broker, so a whole server/client
//! exchange runs without RabbitMQ.

use std::time::Duration;

use peril::prelude::*;
use peril::protocol::routing;
use peril::pubsub::PubSubError;
use tokio::sync::mpsc;

fn client() -> PerilClient<MemoryBroker> {
    PerilClientBuilder::new().with_broker(MemoryBroker::new())
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}

#[tokio::test]
async fn test_server_pause_reaches_every_client() {
    let server = client();
    server.provision().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Each player gets a private pause queue on the same direct key.
    let mut subs = Vec::new();
    for username in ["alice", "bob"] {
        let binding = Binding::new(
            EXCHANGE_PERIL_DIRECT,
            routing::pause_queue(username),
            PAUSE_KEY,
            QueueDurability::Transient,
        )
        .unwrap();
        let tx = tx.clone();
        let name = username.to_string();
        subs.push(
            server
                .subscribe(&binding, move |state: PlayingState| {
                    tx.send((name.clone(), state.is_paused)).unwrap();
                    AckType::Ack
                })
                .await
                .unwrap(),
        );
    }

    let publisher = server.publisher().await.unwrap();
    publisher
        .publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &PlayingState { is_paused: true })
        .await
        .unwrap();

    let mut got = vec![recv(&mut rx).await, recv(&mut rx).await];
    got.sort();
    assert_eq!(
        got,
        vec![("alice".to_string(), true), ("bob".to_string(), true)]
    );
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_clones_share_one_connection() {
    let first = client();
    let second = first.clone();
    assert_eq!(first.broker().id(), second.broker().id());

    second.close().await.unwrap();
    assert!(!first.broker().is_open());
    assert!(first.publisher().await.is_err());
}

#[tokio::test]
async fn test_close_ends_subscriptions() {
    let client = client();
    client.provision().await.unwrap();

    let binding = Binding::new(
        EXCHANGE_PERIL_TOPIC,
        routing::WAR_QUEUE,
        routing::wildcard(routing::WAR_RECOGNITIONS_PREFIX),
        QueueDurability::Durable,
    )
    .unwrap();
    let sub = client
        .subscribe(&binding, |_: RecognitionOfWar| AckType::Ack)
        .await
        .unwrap();
    assert_eq!(sub.state(), SubscriptionState::Consuming);

    client.close().await.unwrap();
    sub.wait().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_errors_convert_to_peril_error() {
    // Nothing provisioned: the bind has no exchange to attach to.
    let client = client();
    let binding = Binding::new(
        EXCHANGE_PERIL_TOPIC,
        routing::GAME_LOG_QUEUE,
        routing::wildcard(routing::GAME_LOG_SLUG),
        QueueDurability::Durable,
    )
    .unwrap();

    let err = client
        .subscribe(&binding, |_: GameLog| AckType::Ack)
        .await
        .unwrap_err();
    assert!(matches!(err, PerilError::PubSub(PubSubError::Binding { .. })));
    assert!(!err.is_fail_fast());
}

#[tokio::test]
async fn test_client_config_is_validated() {
    let config = PubSubConfig {
        dead_letter_exchange: String::new(),
        ..PubSubConfig::default()
    };
    let client = PerilClientBuilder::new()
        .pubsub_config(config)
        .with_broker(MemoryBroker::new());
    assert_eq!(client.config().dead_letter_exchange, EXCHANGE_PERIL_DLX);
}

#[tokio::test]
async fn test_builder_from_loaded_config() {
    let config = PerilConfig {
        prefetch_count: 5,
        handler_timeout_ms: 0,
        ..PerilConfig::default()
    };
    let client = PerilClientBuilder::from_config(&config).with_broker(MemoryBroker::new());
    assert_eq!(client.config().prefetch_count, 5);
    assert_eq!(client.config().handler_timeout, None);
}
