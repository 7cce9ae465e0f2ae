//! # Event Publisher
//!
//! Serializes an event to JSON and publishes it to the bus exchange with
//! the event name as routing key.
//!
//! ## Delivery
//!
//! - Persistent, mandatory, `content_type = application/json`
//! - Fresh UUID v4 `message_id`, kept across retries of the same publish
//! - Transient broker failures are retried `retry_count` times with the
//!   delay doubling from `retry_base_delay`; anything else fails at once
//! - One channel per call, always closed before returning

use bus_telemetry::{EVENTS_PUBLISHED, PUBLISH_FAILURES, PUBLISH_RETRIES};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BusError};
use crate::event::IntegrationEvent;
use crate::ports::broker::{BrokerChannel, DeliveryMode, ExchangeKind, MessageProperties};
use crate::registry::SubscriptionRegistry;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Publishes integration events.
pub struct Publisher {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    exchange_name: String,
    app_id: String,
    retry_count: u32,
    retry_base_delay: Duration,
}

impl Publisher {
    pub fn new(
        connection: ConnectionManager,
        registry: Arc<SubscriptionRegistry>,
        config: &BusConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            exchange_name: config.exchange_name.clone(),
            app_id: config.app_id.clone(),
            retry_count: config.publish_retry_count,
            retry_base_delay: config.publish_retry_base_delay(),
        }
    }

    /// Publish `event` under its canonical name.
    ///
    /// # Errors
    ///
    /// - `Serialization` if the event cannot be encoded
    /// - `NotConnected` / `Broker` if no channel can be opened
    /// - `Unroutable` if no queue is bound for the event name
    /// - `PublishFailed` once retries are exhausted or on a permanent error
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), BusError> {
        let event_name = self.registry.event_name::<E>();
        let body = serde_json::to_vec(event)?;
        let result = self.publish_bytes(&event_name, body).await;

        match &result {
            Ok(()) => EVENTS_PUBLISHED.with_label_values(&[event_name.as_str()]).inc(),
            Err(e) => {
                PUBLISH_FAILURES.inc();
                warn!(event_name = %event_name, error = %e, "Could not publish event");
            }
        }
        result
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn publish_bytes(&self, event_name: &str, body: Vec<u8>) -> Result<(), BusError> {
        let mut channel = self.open_publish_channel().await?;
        let message_id = Uuid::new_v4().to_string();
        let mut attempt: u32 = 0;

        let result = loop {
            let properties = MessageProperties {
                delivery_mode: DeliveryMode::Persistent,
                app_id: Some(self.app_id.clone()),
                message_id: Some(message_id.clone()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                timestamp: Some(SystemTime::now()),
            };

            match channel
                .basic_publish(&self.exchange_name, event_name, true, properties, body.clone())
                .await
            {
                Ok(()) => {
                    debug!(
                        event_name = %event_name,
                        message_id = %message_id,
                        attempts = attempt + 1,
                        "Published event"
                    );
                    break Ok(());
                }
                Err(BrokerError::Unroutable { .. }) => {
                    break Err(BusError::Unroutable {
                        event_name: event_name.to_string(),
                        exchange: self.exchange_name.clone(),
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retry_count => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    PUBLISH_RETRIES.inc();
                    warn!(
                        event_name = %event_name,
                        message_id = %message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Could not publish event, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    if !channel.is_open() {
                        match self.open_publish_channel().await {
                            Ok(fresh) => {
                                if let Err(e) = channel.close().await {
                                    debug!(error = %e, "Closing dead publish channel");
                                }
                                channel = fresh;
                            }
                            Err(e) => break Err(e),
                        }
                    }
                }
                Err(e) => {
                    break Err(BusError::PublishFailed {
                        event_name: event_name.to_string(),
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        };

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Closing publish channel");
        }
        result
    }

    async fn open_publish_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        if !self.connection.is_connected() {
            self.connection.try_connect().await;
        }

        let channel = self.connection.open_channel().await?;
        if let Err(e) = channel
            .exchange_declare(&self.exchange_name, ExchangeKind::Direct)
            .await
        {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Closing publish channel");
            }
            return Err(e.into());
        }
        Ok(channel)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange_name", &self.exchange_name)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryBroker;
    use crate::ports::broker::{BrokerConnector, QueueOptions};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: String,
    }
    impl IntegrationEvent for Sample {}

    fn config() -> BusConfig {
        BusConfig {
            exchange_name: "bus".into(),
            queue_name: "svc".into(),
            publish_retry_count: 3,
            publish_retry_base_delay_ms: 100,
            app_id: "orders".into(),
            ..BusConfig::default()
        }
    }

    async fn bind(broker: &InMemoryBroker, routing_key: &str) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .exchange_declare("bus", ExchangeKind::Direct)
            .await
            .unwrap();
        channel
            .queue_declare("svc", QueueOptions::durable())
            .await
            .unwrap();
        channel.queue_bind("svc", "bus", routing_key).await.unwrap();
        connection.close().await.unwrap();
    }

    fn publisher(broker: &InMemoryBroker) -> Publisher {
        let connection = ConnectionManager::new(Arc::new(broker.clone()), Duration::from_millis(10));
        Publisher::new(connection, Arc::new(SubscriptionRegistry::new()), &config())
    }

    #[tokio::test]
    async fn test_publish_connects_and_sets_properties() {
        let broker = InMemoryBroker::new();
        bind(&broker, "Sample").await;
        let publisher = publisher(&broker);

        publisher.publish(&Sample { id: "e1".into() }).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.exchange, "bus");
        assert_eq!(message.routing_key, "Sample");
        assert!(message.mandatory);
        assert_eq!(message.properties.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(message.properties.app_id.as_deref(), Some("orders"));
        assert_eq!(
            message.properties.content_type.as_deref(),
            Some(CONTENT_TYPE_JSON)
        );
        let id = message.properties.message_id.as_deref().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let decoded: Sample = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(decoded, Sample { id: "e1".into() });

        // Publish channel closed, connection kept.
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_publish() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        let err = publisher
            .publish(&Sample { id: "e1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Unroutable { .. }));
        assert!(broker.published().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_backoff() {
        let broker = InMemoryBroker::new();
        bind(&broker, "Sample").await;
        broker.fail_next_publishes(3);
        let publisher = publisher(&broker);

        let started = tokio::time::Instant::now();
        publisher.publish(&Sample { id: "e1".into() }).await.unwrap();

        // 100 + 200 + 400 ms
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let broker = InMemoryBroker::new();
        bind(&broker, "Sample").await;
        broker.fail_next_publishes(10);
        let publisher = publisher(&broker);

        let err = publisher
            .publish(&Sample { id: "e1".into() })
            .await
            .unwrap_err();
        match err {
            BusError::PublishFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 4);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.open_channels(), 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let publisher = publisher(&InMemoryBroker::new());
        assert_eq!(publisher.backoff(0), Duration::from_millis(100));
        assert_eq!(publisher.backoff(1), Duration::from_millis(200));
        assert_eq!(publisher.backoff(2), Duration::from_millis(400));
    }
}
