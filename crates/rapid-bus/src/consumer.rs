//! # Event Consumer
//!
//! Owns the long-lived consumer channel on the service queue.
//!
//! ## Channel Lifecycle
//!
//! ```text
//! start ──▶ declare exchange ──▶ declare durable queue ──▶ bind every
//!           event name ──▶ consume
//!               ▲
//!               ├── channel callback error
//!               ├── connection recovered
//!               └── first subscription after the queue went idle
//! ```
//!
//! ## Delivery Outcomes
//!
//! | Situation | Action |
//! |-----------|--------|
//! | all handlers succeed | ack |
//! | no subscription for the routing key | ack and drop |
//! | body does not decode | ack and drop |
//! | any handler fails | wait `requeue_delay`, then nack with requeue |

use bus_telemetry::{
    log_bus_event, DELIVERIES_ACKED, DELIVERIES_DROPPED, DELIVERIES_RECEIVED, DELIVERIES_REQUEUED,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, BusError};
use crate::ports::broker::{BrokerChannel, ChannelSignal, Delivery, ExchangeKind, QueueOptions};
use crate::registry::SubscriptionRegistry;

#[derive(Default)]
struct ChannelSlot {
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Cancels the consume loop and signal watcher of `channel`.
    token: Option<CancellationToken>,
    /// Bumped per created channel; stale signal watchers compare against it.
    generation: u64,
}

impl ChannelSlot {
    fn take(&mut self) -> Option<Arc<dyn BrokerChannel>> {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.channel.take()
    }
}

struct ConsumerInner {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    exchange_name: String,
    queue_name: String,
    consumer_tag: String,
    requeue_delay: Duration,
    slot: Mutex<ChannelSlot>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Consumes the service queue and hands deliveries to the dispatcher.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn new(
        connection: ConnectionManager,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: &BusConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                connection,
                registry,
                dispatcher,
                exchange_name: config.exchange_name.clone(),
                queue_name: config.queue_name.clone(),
                consumer_tag: config.consumer_tag.clone(),
                requeue_delay: config.requeue_delay(),
                slot: Mutex::new(ChannelSlot::default()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect, declare topology and begin consuming.
    ///
    /// # Errors
    ///
    /// - `Configuration` when already started
    /// - `NotConnected` when the broker refuses the connection permanently
    /// - `Broker` when the topology cannot be declared
    pub async fn start(&self) -> Result<(), BusError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::Configuration("consumer already started".into()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Configuration("consumer was stopped".into()));
        }

        if !self.inner.connection.try_connect().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(BusError::NotConnected);
        }

        // Listeners first so a recovery during the initial declare is not lost.
        self.inner.spawn_recovery_listener();
        self.inner.spawn_removal_listener();

        self.inner.recreate_channel(None).await?;
        info!(
            queue = %self.inner.queue_name,
            exchange = %self.inner.exchange_name,
            "Consumer started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Whether a consumer channel is currently open.
    pub async fn is_consuming(&self) -> bool {
        self.inner
            .slot
            .lock()
            .await
            .channel
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Bind `event_name` to the queue after start.
    ///
    /// Before start this is a no-op; `start` binds every registered name.
    /// Serialized with unbinding on the channel slot, so a removal handled
    /// late never undoes a newer subscription.
    pub async fn add_binding(&self, event_name: &str) -> Result<(), BusError> {
        if !self.is_started() || self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.ensure_connected().await;

        let mut slot = self.inner.slot.lock().await;
        if self.inner.shutdown.is_cancelled() || !self.inner.registry.has_subscriptions(event_name) {
            return Ok(());
        }
        if !slot.channel.as_ref().is_some_and(|c| c.is_open()) {
            // The queue went idle when the last subscription left.
            return self.inner.rebuild_channel(&mut slot).await;
        }

        self.inner
            .with_temp_channel(|channel, queue, exchange| {
                let event_name = event_name.to_string();
                Box::pin(async move { channel.queue_bind(&queue, &exchange, &event_name).await })
                    as TempChannelOp
            })
            .await?;
        debug!(event_name = %event_name, queue = %self.inner.queue_name, "Bound event to queue");
        Ok(())
    }

    /// Stop consuming and close the consumer channel. Idempotent.
    ///
    /// Unacked deliveries go back to the queue when the channel closes.
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let channel = self.inner.slot.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Closing consumer channel");
            }
        }
        info!(queue = %self.inner.queue_name, "Consumer stopped");
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.queue_name)
            .field("exchange", &self.inner.exchange_name)
            .field("started", &self.is_started())
            .finish()
    }
}

type TempChannelOp = BoxFuture<'static, Result<(), BrokerError>>;

impl ConsumerInner {
    /// Replace the consumer channel.
    ///
    /// With `expected = Some(generation)` the channel is only replaced while
    /// it is still that generation. Boxed because the signal watcher it
    /// spawns calls back into it.
    fn recreate_channel(
        self: &Arc<Self>,
        expected: Option<u64>,
    ) -> BoxFuture<'static, Result<(), BusError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let mut slot = this.slot.lock().await;
            if this.shutdown.is_cancelled() {
                return Ok(());
            }
            if let Some(expected) = expected {
                if slot.generation != expected {
                    debug!(expected, current = slot.generation, "Consumer channel already replaced");
                    return Ok(());
                }
            }

            this.rebuild_channel(&mut slot).await
        })
    }

    /// Close the current channel and open a declared, bound, consuming one.
    /// The caller holds the slot lock.
    async fn rebuild_channel(self: &Arc<Self>, slot: &mut ChannelSlot) -> Result<(), BusError> {
        if let Some(old) = slot.take() {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Closing replaced consumer channel");
            }
        }

        let channel = self.connection.open_channel().await?;
        let deliveries = match self.declare_and_consume(&channel).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Closing half-declared consumer channel");
                }
                return Err(e);
            }
        };

        slot.generation += 1;
        let generation = slot.generation;
        let token = self.shutdown.child_token();
        slot.channel = Some(Arc::clone(&channel));
        slot.token = Some(token.clone());

        self.spawn_channel_watcher(&channel, generation, token.clone());
        self.spawn_consume_loop(channel, deliveries, token);

        info!(
            queue = %self.queue_name,
            generation,
            "Consumer channel ready"
        );
        Ok(())
    }

    async fn declare_and_consume(
        &self,
        channel: &Arc<dyn BrokerChannel>,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        channel
            .exchange_declare(&self.exchange_name, ExchangeKind::Direct)
            .await?;
        channel
            .queue_declare(&self.queue_name, QueueOptions::durable())
            .await?;
        for event_name in self.registry.event_names() {
            channel
                .queue_bind(&self.queue_name, &self.exchange_name, &event_name)
                .await?;
        }
        Ok(channel
            .basic_consume(&self.queue_name, &self.consumer_tag)
            .await?)
    }

    fn spawn_consume_loop(
        self: &Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        token: CancellationToken,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = token.cancelled() => break,
                    delivery = deliveries.recv() => delivery,
                };
                let Some(delivery) = delivery else {
                    debug!(queue = %this.queue_name, "Delivery stream ended");
                    break;
                };
                let (this, channel) = (Arc::clone(&this), Arc::clone(&channel));
                tokio::spawn(async move { this.handle_delivery(channel, delivery).await });
            }
        });
    }

    fn spawn_channel_watcher(
        self: &Arc<Self>,
        channel: &Arc<dyn BrokerChannel>,
        generation: u64,
        token: CancellationToken,
    ) {
        let mut signals = channel.signals();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let signal = tokio::select! {
                _ = token.cancelled() => return,
                signal = signals.recv() => signal,
            };
            let reason = match signal {
                Ok(ChannelSignal::CallbackError(reason)) | Ok(ChannelSignal::Closed(reason)) => reason,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    format!("{missed} channel signal(s) missed")
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            warn!(reason = %reason, generation, "Consumer channel failed, recreating");
            if let Err(e) = this.recreate_channel(Some(generation)).await {
                error!(error = %e, "Could not recreate consumer channel");
            }
        });
    }

    /// Rebuild the channel after every connection recovery.
    fn spawn_recovery_listener(self: &Arc<Self>) {
        let mut recovered = self.connection.recovered();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event = recovered.recv() => event,
                };
                match event {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if this.registry.is_empty() && !this.has_channel().await {
                    // Idle queue; the next subscription reopens it.
                    continue;
                }
                info!(queue = %this.queue_name, "Connection recovered, recreating consumer channel");
                if let Err(e) = this.recreate_channel(None).await {
                    error!(error = %e, "Could not recreate consumer channel after recovery");
                }
            }
        });
    }

    /// Unbind names whose last subscription was removed.
    fn spawn_removal_listener(self: &Arc<Self>) {
        let mut removed = self.registry.event_removed();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event_name = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event_name = removed.recv() => event_name,
                };
                match event_name {
                    Ok(event_name) => this.on_event_removed(&event_name).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed subscription removals; bindings may be stale");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_event_removed(&self, event_name: &str) {
        self.ensure_connected().await;

        let mut slot = self.slot.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        if self.registry.has_subscriptions(event_name) {
            debug!(event_name = %event_name, "Event subscribed again, keeping binding");
        } else {
            let unbind = self
                .with_temp_channel(|channel, queue, exchange| {
                    let event_name = event_name.to_string();
                    Box::pin(async move { channel.queue_unbind(&queue, &exchange, &event_name).await })
                        as TempChannelOp
                })
                .await;
            match unbind {
                Ok(()) => debug!(event_name = %event_name, queue = %self.queue_name, "Unbound event"),
                Err(e) => warn!(event_name = %event_name, error = %e, "Could not unbind event"),
            }
        }

        if self.registry.is_empty() {
            if let Some(channel) = slot.take() {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Closing idle consumer channel");
                }
                info!(queue = %self.queue_name, "No subscriptions left, consumer channel closed");
            }
        }
    }

    /// Connect first when the connection is down. Kept outside the slot lock
    /// since reconnecting may take several intervals.
    async fn ensure_connected(&self) {
        if !self.connection.is_connected() {
            self.connection.try_connect().await;
        }
    }

    async fn has_channel(&self) -> bool {
        self.slot.lock().await.channel.is_some()
    }

    /// Run one topology operation on a short-lived channel.
    async fn with_temp_channel<F>(&self, op: F) -> Result<(), BusError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>, String, String) -> TempChannelOp,
    {
        let channel = self.connection.open_channel().await?;
        let result = op(
            Arc::clone(&channel),
            self.queue_name.clone(),
            self.exchange_name.clone(),
        )
        .await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Closing temporary channel");
        }
        Ok(result?)
    }

    async fn handle_delivery(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        DELIVERIES_RECEIVED.inc();
        let event_name = delivery.routing_key.as_str();
        let tag = delivery.delivery_tag;

        let Some(route) = self.registry.route(event_name) else {
            log_bus_event!(debug, event_name, "No subscription for event, dropping", tag);
            DELIVERIES_DROPPED.with_label_values(&["unsubscribed"]).inc();
            self.ack(&channel, event_name, tag).await;
            return;
        };

        let event = match route.decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    event_name = %event_name,
                    event_type = route.event_type.name(),
                    error = %e,
                    "Could not decode event body, dropping"
                );
                DELIVERIES_DROPPED.with_label_values(&["undecodable"]).inc();
                self.ack(&channel, event_name, tag).await;
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        match self
            .dispatcher
            .dispatch(event_name, event, route.subscriptions, &cancel)
            .await
        {
            Ok(()) => {
                if self.ack(&channel, event_name, tag).await {
                    DELIVERIES_ACKED.inc();
                }
            }
            Err(e) => {
                warn!(
                    event_name = %event_name,
                    redelivered = delivery.redelivered,
                    requeue_in_ms = self.requeue_delay.as_millis() as u64,
                    error = %e,
                    "Event handling failed, requeueing"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.requeue_delay) => {}
                }
                match channel.basic_nack(tag, true).await {
                    Ok(()) => DELIVERIES_REQUEUED.inc(),
                    Err(e) => error!(
                        event_name = %event_name,
                        tag,
                        error = %e,
                        "Could not requeue delivery"
                    ),
                }
            }
        }
    }

    async fn ack(&self, channel: &Arc<dyn BrokerChannel>, event_name: &str, tag: u64) -> bool {
        match channel.basic_ack(tag).await {
            Ok(()) => true,
            Err(e) => {
                // The broker redelivers once the channel is gone.
                warn!(event_name = %event_name, tag, error = %e, "Could not ack delivery");
                false
            }
        }
    }
}
