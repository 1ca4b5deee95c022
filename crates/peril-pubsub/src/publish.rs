//! Typed publishing.

use peril_protocol::{Codec, JsonCodec};
use peril_transport::BrokerChannel;
use serde::Serialize;

use crate::{PubSubConfig, PubSubError, bounded};

/// Encodes `value` as JSON and publishes it to `exchange` under
/// `routing_key`.
///
/// Resolves once the broker has accepted the message. The message is
/// tagged `application/json`.
///
/// # Errors
/// - [`PubSubError::Encoding`] if `value` cannot be serialized; nothing is
///   sent in that case;
/// - [`PubSubError::Publish`] if the broker rejects the message;
/// - [`PubSubError::Timeout`] if the broker does not answer within
///   `config.operation_timeout`.
pub async fn publish_json<C, T>(
    channel: &C,
    config: &PubSubConfig,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    C: BrokerChannel,
    T: Serialize + Sync + ?Sized,
{
    publish_with(&JsonCodec, channel, config, exchange, routing_key, value).await
}

/// Like [`publish_json`], with a caller-chosen [`Codec`].
pub async fn publish_with<K, C, T>(
    codec: &K,
    channel: &C,
    config: &PubSubConfig,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    K: Codec,
    C: BrokerChannel,
    T: Serialize + Sync + ?Sized,
{
    let body = codec.encode(value).map_err(PubSubError::Encoding)?;

    bounded(config.operation_timeout, "publish", async {
        channel
            .publish(exchange, routing_key, &body, codec.content_type())
            .await
            .map_err(|source| PubSubError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                source,
            })
    })
    .await?;

    tracing::trace!(exchange, routing_key, bytes = body.len(), "published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use peril_protocol::PlayingState;
    use peril_protocol::routing::{EXCHANGE_PERIL_DIRECT, PAUSE_KEY};
    use peril_transport::{
        Broker, Delivery, DeliveryStream, MemoryBroker, QueueOptions, TransportError,
    };

    use super::*;

    async fn pause_queue(broker: &MemoryBroker) -> <MemoryBroker as Broker>::Channel {
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange(EXCHANGE_PERIL_DIRECT, peril_transport::ExchangeKind::Direct, true)
            .await
            .unwrap();
        channel
            .declare_queue("pause", &QueueOptions::default())
            .await
            .unwrap();
        channel
            .bind_queue("pause", EXCHANGE_PERIL_DIRECT, PAUSE_KEY)
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_json_sends_exact_body() {
        let broker = MemoryBroker::new();
        let channel = pause_queue(&broker).await;
        let config = PubSubConfig::default();

        publish_json(
            &channel,
            &config,
            EXCHANGE_PERIL_DIRECT,
            PAUSE_KEY,
            &PlayingState { is_paused: true },
        )
        .await
        .unwrap();

        let mut deliveries = channel.consume("pause", "reader").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), br#"{"IsPaused":true}"#);
        assert_eq!(delivery.routing_key(), PAUSE_KEY);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_unsized_values() {
        let broker = MemoryBroker::new();
        let channel = pause_queue(&broker).await;
        let config = PubSubConfig::default();

        let scores: &[u32] = &[3, 1, 4];
        publish_json(&channel, &config, EXCHANGE_PERIL_DIRECT, PAUSE_KEY, scores)
            .await
            .unwrap();
        publish_json(&channel, &config, EXCHANGE_PERIL_DIRECT, PAUSE_KEY, "paused")
            .await
            .unwrap();

        let mut deliveries = channel.consume("pause", "reader").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body(), b"[3,1,4]");
        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body(), br#""paused""#);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_unencodable_value_sends_nothing() {
        let broker = MemoryBroker::new();
        let channel = pause_queue(&broker).await;

        // JSON object keys must be strings.
        let mut value = HashMap::new();
        value.insert((1, 2), "tuple key");

        let err = publish_json(
            &channel,
            &PubSubConfig::default(),
            EXCHANGE_PERIL_DIRECT,
            PAUSE_KEY,
            &value,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PubSubError::Encoding(_)));
        assert_eq!(broker.queue_depth("pause"), Some(0));
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped_silently() {
        let broker = MemoryBroker::new();
        let channel = pause_queue(&broker).await;

        publish_json(
            &channel,
            &PubSubConfig::default(),
            EXCHANGE_PERIL_DIRECT,
            "nobody_listens",
            &PlayingState { is_paused: false },
        )
        .await
        .unwrap();
        assert_eq!(broker.queue_depth("pause"), Some(0));
    }

    #[tokio::test]
    async fn test_missing_exchange_is_publish_error() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        let err = publish_json(
            &channel,
            &PubSubConfig::default(),
            "no_such_exchange",
            PAUSE_KEY,
            &PlayingState { is_paused: true },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PubSubError::Publish {
                source: TransportError::NotFound(_),
                ..
            }
        ));
    }
}
