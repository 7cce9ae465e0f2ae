//! # In-Memory Broker
//!
//! A direct-exchange broker living inside the process. Used by tests and the
//! sample host in place of a real AMQP server.
//!
//! ## Behaviour
//!
//! - Exchanges route on exact routing-key match to bound queues
//! - Queues hand messages to their consumers round-robin
//! - Deliveries stay unacknowledged per channel until ack/nack; closing a
//!   channel returns them to the front of their queue, marked redelivered
//! - `restart()` drops every connection (with a shutdown signal) together
//!   with exchanges, bindings and non-durable queues; durable queues keep
//!   their messages
//!
//! Fault injection (`fail_next_connects`, `fail_next_publishes`, ...) lets
//! tests drive the reconnect and retry paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;
use crate::ports::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, ChannelSignal, ConnectionSignal, Delivery,
    ExchangeKind, MessageProperties, QueueOptions,
};

const SIGNAL_CAPACITY: usize = 16;

/// A message accepted by an exchange.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Topology and delivery operations in the order the broker received them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    ExchangeDeclare(String),
    QueueDeclare(String),
    QueueBind { queue: String, routing_key: String },
    QueueUnbind { queue: String, routing_key: String },
    Consume { queue: String },
}

/// Counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_attempts: u64,
    pub publishes: u64,
    pub acks: u64,
    pub nacks: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct ConsumerEntry {
    channel_id: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ConnectionSignal>,
    channels: HashSet<u64>,
}

struct ChannelEntry {
    connection_id: u64,
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ChannelSignal>,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct Faults {
    fail_connects: u32,
    unreachable: bool,
    access_denied: bool,
    fail_publishes: u32,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    /// exchange -> (routing key, queue), in bind order
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    faults: Faults,
    published: Vec<PublishedMessage>,
    journal: Vec<BrokerOp>,
    stats: BrokerStats,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    ids: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Fail the next `count` connection attempts as unreachable.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.state.lock().faults.fail_connects = count;
    }

    /// Fail every connection attempt as unreachable while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.state.lock().faults.unreachable = unreachable;
    }

    /// Refuse credentials while set. Not a transient failure.
    pub fn set_access_denied(&self, denied: bool) {
        self.shared.state.lock().faults.access_denied = denied;
    }

    /// Fail the next `count` publishes with an I/O error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.state.lock().faults.fail_publishes = count;
    }

    /// Simulate a broker restart.
    pub fn restart(&self) {
        let mut state = self.shared.state.lock();
        Self::drop_all_connections(&mut state, "broker restarted");

        state.exchanges.clear();
        state.bindings.clear();
        state.queues.retain(|_, queue| queue.options.durable);
        tracing::debug!(
            queues = state.queues.len(),
            "In-memory broker restarted"
        );
    }

    /// Reset every connection without touching topology.
    pub fn drop_connections(&self) {
        let mut state = self.shared.state.lock();
        Self::drop_all_connections(&mut state, "connection reset by peer");
    }

    /// Raise a blocked signal on every open connection.
    pub fn block_connections(&self, reason: &str) {
        let state = self.shared.state.lock();
        for entry in state.connections.values() {
            let _ = entry
                .signals
                .send(ConnectionSignal::Blocked(reason.to_string()));
        }
    }

    /// Fail every channel that has a consumer with a callback error, then
    /// close it.
    pub fn break_consumer_channels(&self) {
        let mut state = self.shared.state.lock();
        let consuming: HashSet<u64> = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter().map(|c| c.channel_id))
            .collect();

        for channel_id in consuming {
            if let Some(entry) = state.channels.get(&channel_id) {
                let _ = entry.signals.send(ChannelSignal::CallbackError(
                    "consumer callback failed".to_string(),
                ));
            }
            Self::close_channel_locked(&mut state, channel_id);
        }
    }

    /// Put a message straight onto a queue, bypassing exchanges.
    pub fn enqueue(&self, queue: &str, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        target.messages.push_back(StoredMessage {
            exchange: String::new(),
            routing_key: routing_key.to_string(),
            properties: MessageProperties::default(),
            body,
            redelivered: false,
        });
        pump(&mut state, queue);
        Ok(())
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Messages accepted by an exchange, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.clone()
    }

    /// Topology operations, oldest first.
    pub fn journal(&self) -> Vec<BrokerOp> {
        self.shared.state.lock().journal.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats
    }

    /// Messages ready for delivery on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn unacked_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Routing keys binding `queue` to `exchange`, in bind order.
    pub fn bound_routing_keys(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .bindings
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(_, q)| q == queue)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn drop_all_connections(state: &mut BrokerState, reason: &str) {
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(entry) = state.connections.get(&id) {
                let _ = entry
                    .signals
                    .send(ConnectionSignal::Shutdown(reason.to_string()));
            }
            Self::close_connection_locked(state, id);
        }
    }

    fn close_connection_locked(state: &mut BrokerState, connection_id: u64) {
        let Some(entry) = state.connections.remove(&connection_id) else {
            return;
        };
        entry.open.store(false, Ordering::SeqCst);
        for channel_id in entry.channels {
            Self::close_channel_locked(state, channel_id);
        }
    }

    fn close_channel_locked(state: &mut BrokerState, channel_id: u64) {
        let Some(entry) = state.channels.remove(&channel_id) else {
            return;
        };
        entry.open.store(false, Ordering::SeqCst);
        if let Some(connection) = state.connections.get_mut(&entry.connection_id) {
            connection.channels.remove(&channel_id);
        }

        let mut touched = HashSet::new();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        // Highest tag first so the oldest delivery ends up at the front.
        for (_, unacked) in entry.unacked.into_iter().rev() {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                state.stats.requeued += 1;
                touched.insert(unacked.queue);
            }
        }

        for queue in touched {
            pump(state, &queue);
        }
    }

    fn with_channel<T>(
        &self,
        channel_id: u64,
        f: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut state = self.shared.state.lock();
        if !state.channels.contains_key(&channel_id) {
            return Err(BrokerError::ChannelClosed(format!("channel {channel_id}")));
        }
        f(&mut state)
    }
}

/// Hand ready messages to consumers until one side runs out.
fn pump(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues, channels, ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.messages.is_empty() && !queue.consumers.is_empty() {
        let idx = queue.next_consumer % queue.consumers.len();
        queue.next_consumer = queue.next_consumer.wrapping_add(1);

        let Some(channel) = channels.get_mut(&queue.consumers[idx].channel_id) else {
            queue.consumers.remove(idx);
            continue;
        };
        let Some(message) = queue.messages.pop_front() else {
            break;
        };

        channel.next_tag += 1;
        let tag = channel.next_tag;
        if queue.consumers[idx]
            .sender
            .send(message.to_delivery(tag))
            .is_err()
        {
            // Receiver dropped; stop feeding this consumer.
            queue.messages.push_front(message);
            queue.consumers.remove(idx);
            continue;
        }
        channel.unacked.insert(
            tag,
            Unacked {
                queue: queue_name.to_string(),
                message,
            },
        );
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.shared.state.lock();
        state.stats.connect_attempts += 1;

        if state.faults.access_denied {
            return Err(BrokerError::Protocol(
                "ACCESS_REFUSED - login was refused".to_string(),
            ));
        }
        if state.faults.unreachable {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        if state.faults.fail_connects > 0 {
            state.faults.fail_connects -= 1;
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }

        let id = self.shared.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        state.connections.insert(
            id,
            ConnectionEntry {
                open: Arc::clone(&open),
                signals: signals.clone(),
                channels: HashSet::new(),
            },
        );

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            open,
            signals,
        }))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.shared.state.lock();
        let Some(connection) = state.connections.get_mut(&self.id) else {
            return Err(BrokerError::ConnectionClosed(format!(
                "connection {}",
                self.id
            )));
        };

        let id = self.broker.shared.next_id();
        connection.channels.insert(id);

        let open = Arc::new(AtomicBool::new(true));
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                open: Arc::clone(&open),
                signals: signals.clone(),
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            open,
            signals,
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        InMemoryBroker::close_connection_locked(&mut state, self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ChannelSignal>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            state.exchanges.entry(exchange.to_string()).or_insert(kind);
            state
                .journal
                .push(BrokerOp::ExchangeDeclare(exchange.to_string()));
            Ok(())
        })
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            state.queues.entry(queue.to_string()).or_insert(Queue {
                options,
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            });
            state.journal.push(BrokerOp::QueueDeclare(queue.to_string()));
            Ok(())
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::NotFound(format!("queue '{queue}'")));
            }
            let bindings = state.bindings.entry(exchange.to_string()).or_default();
            let binding = (routing_key.to_string(), queue.to_string());
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
            state.journal.push(BrokerOp::QueueBind {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
            Ok(())
        })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            if let Some(bindings) = state.bindings.get_mut(exchange) {
                bindings.retain(|(key, q)| !(key == routing_key && q == queue));
            }
            state.journal.push(BrokerOp::QueueUnbind {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            if state.faults.fail_publishes > 0 {
                state.faults.fail_publishes -= 1;
                return Err(BrokerError::Io("connection reset during publish".to_string()));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
            }

            let targets: Vec<String> = state
                .bindings
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(key, _)| key == routing_key)
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default();

            if targets.is_empty() && mandatory {
                return Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }

            state.stats.publishes += 1;
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory,
                properties: properties.clone(),
                body: body.clone(),
            });

            for queue in targets {
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.messages.push_back(StoredMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        properties: properties.clone(),
                        body: body.clone(),
                        redelivered: false,
                    });
                }
                pump(state, &queue);
            }
            Ok(())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        self.broker.with_channel(self.id, |state| {
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;

            if target.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(BrokerError::Protocol(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                )));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            target.consumers.push(ConsumerEntry {
                channel_id: self.id,
                tag: consumer_tag.to_string(),
                sender,
            });
            state.journal.push(BrokerOp::Consume {
                queue: queue.to_string(),
            });
            pump(state, queue);
            Ok(receiver)
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            let channel = state
                .channels
                .get_mut(&self.id)
                .ok_or_else(|| BrokerError::ChannelClosed(format!("channel {}", self.id)))?;
            channel.unacked.remove(&delivery_tag).ok_or_else(|| {
                BrokerError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })?;
            state.stats.acks += 1;
            Ok(())
        })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.broker.with_channel(self.id, |state| {
            let channel = state
                .channels
                .get_mut(&self.id)
                .ok_or_else(|| BrokerError::ChannelClosed(format!("channel {}", self.id)))?;
            let unacked = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
                BrokerError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })?;
            state.stats.nacks += 1;

            if requeue {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.messages.push_back(message);
                    state.stats.requeued += 1;
                }
                pump(state, &unacked.queue);
            }
            Ok(())
        })
    }

    fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        InMemoryBroker::close_channel_locked(&mut state, self.id);
        Ok(())
    }
}
