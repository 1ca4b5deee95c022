//! In-process broker with AMQP routing and acknowledgment semantics.
//!
//! [`MemoryBroker`] keeps exchanges, queues and bindings in a single
//! mutex-guarded table shared by every connection created from it. It
//! models the parts of AMQP 0-9-1 that the pub/sub layer relies on:
//!
//! - default, direct, topic and fanout exchanges
//! - queue property checks on redeclaration (durable / exclusive /
//!   auto-delete / dead-letter exchange)
//! - exclusive queues, owned by one connection and deleted with it
//! - auto-delete queues, deleted when their last consumer is cancelled
//! - manual acknowledgment, requeue with `redelivered = true`, and
//!   dead-lettering on reject without requeue
//!
//! A consumer is cancelled when its [`MemoryDeliveries`] stream is dropped
//! or its channel closes. Anything it had not settled goes back to the
//! front of the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::{
    Broker, BrokerChannel, ConnectionId, Delivery, DeliveryStream, ExchangeKind,
    QueueInfo, QueueOptions, TransportError,
};

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingEntry {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<BindingEntry>,
}

#[derive(Debug)]
struct Unsettled {
    message: Message,
    consumer: u64,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: ConnectionId,
    ready: VecDeque<Message>,
    unsettled: HashMap<u64, Unsettled>,
    /// consumer id -> channel id
    consumers: HashMap<u64, u64>,
}

impl Queue {
    fn check_access(
        &self,
        name: &str,
        connection: ConnectionId,
    ) -> Result<(), TransportError> {
        if self.options.exclusive && self.owner != connection {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{name}' is exclusive to {}",
                self.owner
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    /// channel id -> owning connection
    channels: HashMap<u64, ConnectionId>,
    open_connections: HashMap<ConnectionId, bool>,
    next_delivery_tag: u64,
    next_generated_queue: u64,
}

impl BrokerState {
    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|conn| {
            self.open_connections.get(conn).copied().unwrap_or(false)
        })
    }

    fn ensure_open(&self, channel: u64) -> Result<(), TransportError> {
        if self.channel_open(channel) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed(format!(
                "channel {channel} is closed"
            )))
        }
    }

    /// Routes a message through `exchange`. Returns how many queues got it.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<usize, TransportError> {
        let targets: Vec<String> = if exchange.is_empty() {
            // The default exchange routes straight to the queue named by
            // the routing key.
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let ex = self.exchanges.get(exchange).ok_or_else(|| {
                TransportError::NotFound(format!("no exchange '{exchange}'"))
            })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &ex.bindings {
                let hit = match ex.kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => {
                        topic_matches(&binding.routing_key, routing_key)
                    }
                    ExchangeKind::Fanout => true,
                };
                if hit && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        Ok(targets.len())
    }

    /// Returns a consumer's unsettled messages to the front of the queue,
    /// oldest first.
    fn requeue_unsettled(&mut self, queue: &str, consumer: u64) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        let mut tags: Vec<u64> = q
            .unsettled
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(mut u) = q.unsettled.remove(&tag) {
                u.message.redelivered = true;
                q.ready.push_front(u.message);
            }
        }
    }

    fn cancel_consumer(&mut self, queue: &str, consumer: u64) {
        self.requeue_unsettled(queue, consumer);
        let delete = match self.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.remove(&consumer).is_some()
                    && q.options.auto_delete
                    && q.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            tracing::debug!(queue, "auto-deleting queue after last consumer");
            self.delete_queue(queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue);
        }
    }

    /// Cancels every consumer attached to `channel`.
    fn close_channel(&mut self, channel: u64) {
        let consumers: Vec<(String, u64)> = self
            .queues
            .iter()
            .flat_map(|(name, q)| {
                q.consumers
                    .iter()
                    .filter(|(_, ch)| **ch == channel)
                    .map(|(consumer, _)| (name.clone(), *consumer))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (queue, consumer) in consumers {
            self.cancel_consumer(&queue, consumer);
        }
        self.channels.remove(&channel);
    }
}

/// Matches an AMQP topic pattern against a dotted routing key.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => {
            (0..=words.len()).any(|skip| match_words(rest, &words[skip..]))
        }
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && match_words(rest, &words[1..])
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on every change that could unblock a waiting consumer.
    changed: Notify,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// A connection to an in-process broker.
///
/// [`MemoryBroker::new`] creates a broker and a first connection to it;
/// [`MemoryBroker::connect`] opens further connections to the same broker,
/// the way separate game clients would each dial RabbitMQ.
///
/// ```rust
/// # async fn demo() -> Result<(), peril_transport::TransportError> {
/// use peril_transport::{Broker, BrokerChannel, ExchangeKind, MemoryBroker};
///
/// let server = MemoryBroker::new();
/// let client = server.connect();
///
/// let channel = client.open_channel().await?;
/// channel.declare_exchange("peril_topic", ExchangeKind::Topic, true).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryBroker {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates an empty broker and returns the first connection to it.
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        Self::attach(shared)
    }

    /// Opens another connection to the same broker.
    pub fn connect(&self) -> Self {
        Self::attach(Arc::clone(&self.shared))
    }

    fn attach(shared: Arc<Shared>) -> Self {
        let id = ConnectionId::new(shared.next_id());
        shared.lock().open_connections.insert(id, true);
        Self { id, shared }
    }

    /// Number of messages ready for delivery in `queue`, or `None` if the
    /// queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered-but-unsettled messages in `queue`.
    pub fn unsettled_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.unsettled.len())
    }

    /// Number of active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    /// Returns `true` while this connection is open.
    pub fn is_open(&self) -> bool {
        self.shared
            .lock()
            .open_connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportError> {
        let id = self.shared.next_id();
        {
            let mut state = self.shared.lock();
            if !state.open_connections.get(&self.id).copied().unwrap_or(false)
            {
                return Err(TransportError::Closed(format!(
                    "{} is closed",
                    self.id
                )));
            }
            state.channels.insert(id, self.id);
        }
        tracing::trace!(conn = %self.id, channel = id, "opened memory channel");
        Ok(MemoryChannel {
            id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            state.open_connections.insert(self.id, false);

            let channels: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, conn)| **conn == self.id)
                .map(|(ch, _)| *ch)
                .collect();
            for channel in channels {
                state.close_channel(channel);
            }

            let exclusive: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.options.exclusive && q.owner == self.id)
                .map(|(name, _)| name.clone())
                .collect();
            for queue in exclusive {
                state.delete_queue(&queue);
            }
        }
        self.shared.changed.notify_waiters();
        tracing::debug!(conn = %self.id, "memory connection closed");
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// A channel on a [`MemoryBroker`] connection.
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: ConnectionId,
    shared: Arc<Shared>,
}

impl BrokerChannel for MemoryChannel {
    type Deliveries = MemoryDeliveries;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;
        if name.is_empty() {
            return Err(TransportError::Protocol(
                "the default exchange cannot be declared".into(),
            ));
        }
        match state.exchanges.get(name) {
            Some(ex) if ex.kind != kind || ex.durable != durable => {
                Err(TransportError::PreconditionFailed(format!(
                    "exchange '{name}' exists as {} (durable: {})",
                    ex.kind, ex.durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        let name = if name.is_empty() {
            state.next_generated_queue += 1;
            format!("amq.gen-{}", state.next_generated_queue)
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            existing.check_access(&name, self.connection)?;
            if existing.options != *options {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue '{name}' exists with {:?}",
                    existing.options
                )));
            }
            return Ok(QueueInfo {
                message_count: existing.ready.len() as u32,
                consumer_count: existing.consumers.len() as u32,
                name,
            });
        }

        state.queues.insert(
            name.clone(),
            Queue {
                options: options.clone(),
                owner: self.connection,
                ready: VecDeque::new(),
                unsettled: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(QueueInfo {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;

        match state.queues.get(queue) {
            Some(q) => q.check_access(queue, self.connection)?,
            None => {
                return Err(TransportError::NotFound(format!(
                    "no queue '{queue}'"
                )));
            }
        }
        if exchange.is_empty() {
            return Err(TransportError::Protocol(
                "queues cannot be bound to the default exchange".into(),
            ));
        }
        let ex = state.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::NotFound(format!("no exchange '{exchange}'"))
        })?;

        let entry = BindingEntry {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !ex.bindings.contains(&entry) {
            ex.bindings.push(entry);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<(), TransportError> {
        let routed = {
            let mut state = self.shared.lock();
            state.ensure_open(self.id)?;
            state.route(exchange, routing_key, body)?
        };
        tracing::trace!(exchange, routing_key, routed, "memory publish");
        if routed > 0 {
            self.shared.changed.notify_waiters();
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<(), TransportError> {
        // Deliveries are pulled one at a time, so every consumer already
        // behaves as if prefetch were 1.
        self.shared.lock().ensure_open(self.id)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Self::Deliveries, TransportError> {
        let consumer = self.shared.next_id();
        let mut state = self.shared.lock();
        state.ensure_open(self.id)?;
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            TransportError::NotFound(format!("no queue '{queue}'"))
        })?;
        q.check_access(queue, self.connection)?;
        q.consumers.insert(consumer, self.id);

        Ok(MemoryDeliveries {
            queue: queue.to_string(),
            consumer,
            channel: self.id,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.lock().close_channel(self.id);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDeliveries / MemoryDelivery
// ---------------------------------------------------------------------------

/// A consumer on a [`MemoryBroker`] queue.
///
/// Dropping the stream cancels the consumer.
#[derive(Debug)]
pub struct MemoryDeliveries {
    queue: String,
    consumer: u64,
    channel: u64,
    shared: Arc<Shared>,
}

impl MemoryDeliveries {
    /// Takes the next ready message, or reports that the consumer is gone.
    fn poll_queue(&self) -> Option<Option<MemoryDelivery>> {
        let mut state = self.shared.lock();
        if !state.channel_open(self.channel) {
            return None;
        }
        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;

        let queue = state.queues.get_mut(&self.queue)?;
        if !queue.consumers.contains_key(&self.consumer) {
            return None;
        }
        let Some(message) = queue.ready.pop_front() else {
            return Some(None);
        };
        queue.unsettled.insert(
            tag,
            Unsettled {
                message: message.clone(),
                consumer: self.consumer,
            },
        );
        Some(Some(MemoryDelivery {
            tag,
            queue: self.queue.clone(),
            channel: self.channel,
            routing_key: message.routing_key,
            body: message.body,
            redelivered: message.redelivered,
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl DeliveryStream for MemoryDeliveries {
    type Delivery = MemoryDelivery;

    async fn next(&mut self) -> Option<Result<MemoryDelivery, TransportError>> {
        loop {
            // Register interest before looking, so a publish landing between
            // the check and the await still wakes us.
            let changed = self.shared.changed.notified();
            match self.poll_queue() {
                None => return None,
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => changed.await,
            }
        }
    }
}

impl Drop for MemoryDeliveries {
    fn drop(&mut self) {
        self.shared.lock().cancel_consumer(&self.queue, self.consumer);
        self.shared.changed.notify_waiters();
    }
}

/// A message delivered by a [`MemoryBroker`] consumer.
#[derive(Debug)]
pub struct MemoryDelivery {
    tag: u64,
    queue: String,
    channel: u64,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    shared: Arc<Shared>,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<(Message, Option<String>), TransportError> {
        let mut state = self.shared.lock();
        state.ensure_open(self.channel)?;
        let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
            TransportError::NotFound(format!("no queue '{}'", self.queue))
        })?;
        let unsettled = queue.unsettled.remove(&self.tag).ok_or_else(|| {
            TransportError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                self.tag
            ))
        })?;
        Ok((unsettled.message, queue.options.dead_letter_exchange.clone()))
    }
}

impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self) -> Result<(), TransportError> {
        self.settle().map(|_| ())
    }

    async fn reject(self, requeue: bool) -> Result<(), TransportError> {
        let (mut message, dead_letter_exchange) = self.settle()?;
        {
            let mut state = self.shared.lock();
            if requeue {
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&self.queue) {
                    queue.ready.push_front(message);
                }
            } else if let Some(dlx) = dead_letter_exchange {
                // A missing dead-letter exchange drops the message, as
                // RabbitMQ does.
                let routed = state
                    .route(&dlx, &message.routing_key, &message.body)
                    .unwrap_or(0);
                tracing::trace!(
                    queue = %self.queue,
                    dlx = %dlx,
                    routed,
                    "dead-lettered message"
                );
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}
