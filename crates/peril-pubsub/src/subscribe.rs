//! Subscription engine: turns a declared queue into a live consumer.
//!
//! Each subscription runs its consume loop in its own Tokio task on its own
//! channel. The loop is strictly sequential: decode, call the handler,
//! settle, then look at the next delivery. Nothing is shared between
//! subscriptions except the broker connection.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use peril_protocol::{Codec, JsonCodec};
use peril_transport::{Broker, BrokerChannel, Delivery, DeliveryStream, TransportError};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::topology::{close_quietly, declare_and_bind};
use crate::{
    AckType, Binding, DecodeFailurePolicy, Handler, PubSubConfig, PubSubError, bounded,
};

/// Lifecycle of a subscription.
///
/// Moves forward only: `Initializing -> Declaring -> Consuming ->
/// Terminated`. A subscription whose declaration fails goes straight from
/// `Declaring` to `Terminated`, and the subscribe call returns the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Initializing,
    Declaring,
    Consuming,
    Terminated,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Declaring => "declaring",
            Self::Consuming => "consuming",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Handle to a running subscription.
///
/// There is no way to stop a subscription from here: it runs until its
/// channel or connection is closed, or until it hits a fail-fast error.
/// Dropping the handle detaches the loop; it keeps running.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<Result<(), PubSubError>>,
}

impl Subscription {
    /// The name of the consumed queue (server-generated names included).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The consumer tag registered with the broker.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Whether the consume loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the consume loop to end and returns how it ended.
    ///
    /// `Ok(())` means the delivery stream closed (the channel or
    /// connection went away). An error is one of the fail-fast
    /// terminations, see [`PubSubError::is_fail_fast`]; the queue has no
    /// consumer from this subscription afterwards.
    pub async fn wait(self) -> Result<(), PubSubError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PubSubError::TaskFailed {
                queue: self.queue,
                reason: e.to_string(),
            }),
        }
    }
}

/// Declares and binds `binding`'s queue, then consumes it as JSON.
///
/// Every delivery is decoded into a `T` and passed to `handler`; the
/// returned [`AckType`] decides whether it is acknowledged, requeued or
/// dead-lettered. See [`subscribe_with`] for the full contract.
///
/// # Errors
/// Returns the declaration, binding or consume error if the subscription
/// could not be established. No consumer exists in that case.
pub async fn subscribe_json<B, T, H>(
    broker: &B,
    config: &PubSubConfig,
    binding: &Binding,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    B: Broker,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    subscribe_with(JsonCodec, broker, config, binding, handler).await
}

/// Like [`subscribe_json`], with a caller-chosen [`Codec`].
///
/// Per delivery, in order:
/// 1. decode the body. On failure the delivery is disposed of per
///    `config.decode_failure`, the handler is not called, and the
///    subscription ends with [`PubSubError::Decoding`];
/// 2. call the handler, bounded by `config.handler_timeout`. On expiry the
///    delivery is requeued and the subscription ends with
///    [`PubSubError::HandlerTimeout`];
/// 3. settle the delivery: `Ack` acknowledges, `NackRequeue` rejects with
///    requeue, `NackDiscard` rejects without requeue so the message is
///    dead-lettered. A failed settle ends the subscription with
///    [`PubSubError::Acknowledge`].
pub async fn subscribe_with<K, B, T, H>(
    codec: K,
    broker: &B,
    config: &PubSubConfig,
    binding: &Binding,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    K: Codec,
    B: Broker,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Initializing);
    let state = StateGuard(state_tx);

    state.set(SubscriptionState::Declaring);
    let (channel, queue) = declare_and_bind(broker, config, binding).await?;

    let consumer_tag = consumer_tag(&config.consumer_tag_prefix, &queue.name);
    let deliveries = match start_consumer(&channel, config, &queue.name, &consumer_tag).await
    {
        Ok(deliveries) => deliveries,
        Err(e) => {
            close_quietly(&channel).await;
            return Err(e);
        }
    };

    state.set(SubscriptionState::Consuming);
    tracing::info!(
        queue = %queue.name,
        consumer_tag = %consumer_tag,
        backlog = queue.message_count,
        "subscription consuming"
    );

    let actor = SubscriptionActor {
        channel,
        deliveries,
        dispatch: Dispatch {
            queue: queue.name.clone(),
            codec,
            handler: Arc::new(handler),
            handler_timeout: config.handler_timeout,
            decode_failure: config.decode_failure,
            _message: PhantomData,
        },
        state,
    };
    let task = tokio::spawn(actor.run());

    Ok(Subscription {
        queue: queue.name,
        consumer_tag,
        state: state_rx,
        task,
    })
}

async fn start_consumer<C: BrokerChannel>(
    channel: &C,
    config: &PubSubConfig,
    queue: &str,
    consumer_tag: &str,
) -> Result<C::Deliveries, PubSubError> {
    let consume_error = |source| PubSubError::Consume {
        queue: queue.to_string(),
        source,
    };
    if config.prefetch_count > 0 {
        bounded(config.operation_timeout, "prefetch", async {
            channel
                .set_prefetch(config.prefetch_count)
                .await
                .map_err(consume_error)
        })
        .await?;
    }
    bounded(config.operation_timeout, "consume", async {
        channel
            .consume(queue, consumer_tag)
            .await
            .map_err(consume_error)
    })
    .await
}

/// `<prefix>-<queue>-<8 hex digits>`.
fn consumer_tag(prefix: &str, queue: &str) -> String {
    let suffix: u32 = rand::rng().random();
    format!("{prefix}-{queue}-{suffix:08x}")
}

/// Publishes `Terminated` when dropped, so observers see the end of the
/// loop however it ends (including a panic in the handler).
struct StateGuard(watch::Sender<SubscriptionState>);

impl StateGuard {
    fn set(&self, state: SubscriptionState) {
        self.0.send_replace(state);
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.0.send_replace(SubscriptionState::Terminated);
    }
}

// ---------------------------------------------------------------------------
// Consume loop
// ---------------------------------------------------------------------------

struct SubscriptionActor<C: BrokerChannel, K, H, T> {
    channel: C,
    deliveries: C::Deliveries,
    dispatch: Dispatch<K, H, T>,
    state: StateGuard,
}

impl<C, K, H, T> SubscriptionActor<C, K, H, T>
where
    C: BrokerChannel,
    K: Codec,
    H: Handler<T>,
    T: DeserializeOwned + Send + 'static,
{
    async fn run(mut self) -> Result<(), PubSubError> {
        let result = self.consume().await;
        let queue = &self.dispatch.queue;

        match &result {
            Ok(()) => tracing::info!(queue = %queue, "subscription stream closed"),
            Err(e) => tracing::warn!(
                queue = %queue,
                error = %e,
                "subscription terminated"
            ),
        }

        // Cancel the consumer before closing its channel.
        let Self {
            channel,
            deliveries,
            state,
            ..
        } = self;
        drop(deliveries);
        close_quietly(&channel).await;
        drop(state);
        result
    }

    async fn consume(&mut self) -> Result<(), PubSubError> {
        while let Some(next) = self.deliveries.next().await {
            let delivery = next.map_err(|source| PubSubError::Delivery {
                queue: self.dispatch.queue.clone(),
                source,
            })?;
            self.dispatch.process(delivery).await?;
        }
        Ok(())
    }
}

/// Everything needed to turn one delivery into one disposition.
struct Dispatch<K, H, T> {
    queue: String,
    codec: K,
    handler: Arc<H>,
    handler_timeout: Option<Duration>,
    decode_failure: DecodeFailurePolicy,
    _message: PhantomData<fn() -> T>,
}

impl<K, H, T> Dispatch<K, H, T>
where
    K: Codec,
    H: Handler<T>,
    T: DeserializeOwned + Send + 'static,
{
    async fn process<D: Delivery>(&self, delivery: D) -> Result<(), PubSubError> {
        let message: T = match self.codec.decode(delivery.body()) {
            Ok(message) => message,
            Err(source) => {
                let routing_key = delivery.routing_key().to_string();
                let requeue = self.decode_failure.requeues();
                tracing::warn!(
                    queue = %self.queue,
                    routing_key = %routing_key,
                    requeue,
                    error = %source,
                    "malformed message"
                );
                delivery
                    .reject(requeue)
                    .await
                    .map_err(|e| self.settle_error(e))?;
                return Err(PubSubError::Decoding {
                    queue: self.queue.clone(),
                    routing_key,
                    source,
                });
            }
        };

        let redelivered = delivery.redelivered();
        let decision = match self.handler_timeout {
            None => Arc::clone(&self.handler).handle(message).await,
            Some(limit) => {
                let handling = Arc::clone(&self.handler).handle(message);
                match tokio::time::timeout(limit, handling).await {
                    Ok(decision) => decision,
                    Err(_) => {
                        delivery
                            .reject(true)
                            .await
                            .map_err(|e| self.settle_error(e))?;
                        return Err(PubSubError::HandlerTimeout {
                            queue: self.queue.clone(),
                            timeout: limit,
                        });
                    }
                }
            }
        };

        let routing_key = delivery.routing_key().to_string();
        let settled = match decision {
            AckType::Ack => delivery.ack().await,
            AckType::NackRequeue | AckType::NackDiscard => {
                delivery.reject(decision.requeues()).await
            }
        };
        settled.map_err(|e| self.settle_error(e))?;

        tracing::debug!(
            queue = %self.queue,
            routing_key = %routing_key,
            redelivered,
            ack = ?decision,
            "settled delivery"
        );
        Ok(())
    }

    fn settle_error(&self, source: TransportError) -> PubSubError {
        PubSubError::Acknowledge {
            queue: self.queue.clone(),
            source,
        }
    }
}
