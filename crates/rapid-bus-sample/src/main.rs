//! # RapidBus Sample Host
//!
//! Shows the pieces an application provides:
//!
//! - an integration event (`OrderPlaced`)
//! - handlers resolved per dispatch from the handler scope
//! - a middleware built once with constructor injection (`FromScope`)
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry from `RAPID_BUS_*` variables
//! 2. Load `BusConfig` from the environment
//! 3. Build and start the bus
//! 4. Publish a few orders and wait until every one was handled
//! 5. Shut down

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use bus_telemetry::{init_telemetry, TelemetryConfig};
use rapid_bus::{
    BusConfig, CancellationToken, EventBus, EventContext, EventDelegate, FromScope, HandlerResult,
    HandlerScope, HandlerSet, IntegrationEvent, IntegrationEventHandler, Middleware,
};

const ORDERS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    customer: String,
    total_cents: u64,
}

impl IntegrationEvent for OrderPlaced {
    const NAME: Option<&'static str> = Some("order.placed");
}

/// Completion feed back to `main`.
struct Processed(mpsc::UnboundedSender<u64>);

struct ReserveStock;

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for ReserveStock {
    async fn handle(&self, event: &OrderPlaced, _cancel: &CancellationToken) -> HandlerResult {
        info!(order_id = event.order_id, "Reserving stock");
        Ok(())
    }
}

struct ConfirmOrder {
    processed: Arc<Processed>,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for ConfirmOrder {
    async fn handle(&self, event: &OrderPlaced, cancel: &CancellationToken) -> HandlerResult {
        if cancel.is_cancelled() {
            anyhow::bail!("shutting down");
        }
        info!(
            order_id = event.order_id,
            customer = %event.customer,
            total_cents = event.total_cents,
            "Order confirmed"
        );
        self.processed
            .0
            .send(event.order_id)
            .context("completion feed closed")?;
        Ok(())
    }
}

/// Threshold above which a handler run is reported as slow.
struct SlowHandlerThreshold(Duration);

struct TimingMiddleware {
    threshold: Duration,
}

impl FromScope for TimingMiddleware {
    fn from_scope(scope: &HandlerScope) -> rapid_bus::Result<Self> {
        let threshold = scope.require::<SlowHandlerThreshold>()?;
        Ok(Self {
            threshold: threshold.0,
        })
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    async fn invoke(&self, ctx: EventContext, next: EventDelegate) -> HandlerResult {
        let event_name = ctx.event_name().to_string();
        let started = Instant::now();
        let result = next(ctx).await;

        let elapsed = started.elapsed();
        if elapsed > self.threshold {
            warn!(event_name = %event_name, elapsed_ms = elapsed.as_millis() as u64, "Slow handler");
        }
        result
    }
}

fn handlers() -> HandlerSet {
    HandlerSet::new()
        .with::<OrderPlaced, _, _>(|_| ReserveStock)
        .with::<OrderPlaced, _, _>(|scope| ConfirmOrder {
            processed: scope
                .resolve::<Processed>()
                .unwrap_or_else(|| Arc::new(Processed(mpsc::unbounded_channel().0))),
        })
}

#[cfg(feature = "amqp")]
fn configure(builder: rapid_bus::EventBusBuilder, config: &BusConfig) -> rapid_bus::EventBusBuilder {
    builder.connector(rapid_bus::AmqpConnector::new(config.connection_uri.clone()))
}

#[cfg(not(feature = "amqp"))]
fn configure(builder: rapid_bus::EventBusBuilder, _config: &BusConfig) -> rapid_bus::EventBusBuilder {
    builder.connector(rapid_bus::InMemoryBroker::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env()).context("telemetry")?;

    let config = BusConfig::from_env().context("bus configuration")?;
    let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();

    let bus = configure(EventBus::builder(), &config)
        .config(config.clone())
        .add_singleton(Processed(processed_tx))
        .add_singleton(SlowHandlerThreshold(Duration::from_millis(250)))
        .use_middleware::<TimingMiddleware>()
        .register_handlers(handlers())
        .build()
        .context("building the event bus")?;

    bus.start().await.context("starting the event bus")?;
    info!(broker = %bus.connection().describe(), "Event bus running");

    for order_id in 1..=ORDERS {
        let event = OrderPlaced {
            order_id,
            customer: format!("customer-{order_id}"),
            total_cents: order_id * 1_250,
        };
        bus.publish(&event)
            .await
            .with_context(|| format!("publishing order {order_id}"))?;
    }

    let mut confirmed = 0;
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    while confirmed < ORDERS {
        tokio::select! {
            _ = &mut deadline => {
                warn!(confirmed, expected = ORDERS, "Timed out waiting for orders");
                break;
            }
            order_id = processed_rx.recv() => match order_id {
                Some(order_id) => {
                    confirmed += 1;
                    info!(order_id, confirmed, "Order processed");
                }
                None => break,
            },
        }
    }

    match bus_telemetry::gather() {
        Ok(metrics) => tracing::debug!(%metrics, "Bus metrics"),
        Err(e) => warn!(error = %e, "Could not gather metrics"),
    }

    bus.shutdown().await;
    info!(confirmed, "Sample finished");
    Ok(())
}
