//! # Dispatcher
//!
//! Runs the pipeline once per subscription of a delivered event.
//!
//! Every subscription becomes its own task. Tasks pass through a shared
//! admission gate (a semaphore) so at most `capacity` handler executions
//! run at once across the whole bus. The permit is owned by the task and
//! released when it finishes, including on error or panic.
//!
//! `dispatch` waits for all units of the event and fails if any did.

use bus_telemetry::{HANDLERS_IN_FLIGHT, HANDLER_DURATION, HANDLER_EXECUTIONS};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::context::EventContext;
use crate::error::{BusError, HandlerResult};
use crate::pipeline::{delegate, Pipeline};
use crate::registry::{DecodedEvent, Subscription};
use crate::scope::Services;

/// Keeps the in-flight gauge honest on every exit path.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        HANDLERS_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        HANDLERS_IN_FLIGHT.dec();
    }
}

/// Bounded-concurrency executor for handler pipelines.
pub struct Dispatcher {
    pipeline: Pipeline,
    services: Services,
    gate: Arc<Semaphore>,
    capacity: usize,
}

impl Dispatcher {
    /// `capacity` is clamped to at least one.
    pub fn new(pipeline: Pipeline, services: Services, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pipeline,
            services,
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admission slots not currently held.
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run every subscription's pipeline for `event` and wait for all of them.
    ///
    /// # Errors
    ///
    /// `HandlerFailed` when at least one unit returned an error or panicked.
    pub async fn dispatch(
        &self,
        event_name: &str,
        event: DecodedEvent,
        subscriptions: Vec<Subscription>,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        let mut units = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let handler = subscription.handler_type().short_name();
            let unit = self.spawn_unit(event_name, Arc::clone(&event), subscription, cancel);
            units.push((handler, unit));
        }

        let mut failures = Vec::new();
        for (handler, unit) in units {
            let outcome = match unit.await {
                Ok(Ok(())) => "success",
                Ok(Err(e)) => {
                    error!(event_name = %event_name, handler, error = %e, "Handler failed");
                    failures.push(format!("{handler}: {e}"));
                    "failure"
                }
                Err(join) if join.is_panic() => {
                    error!(event_name = %event_name, handler, "Handler panicked");
                    failures.push(format!("{handler}: panicked"));
                    "panic"
                }
                Err(join) => {
                    error!(event_name = %event_name, handler, error = %join, "Handler task aborted");
                    failures.push(format!("{handler}: {join}"));
                    "failure"
                }
            };
            HANDLER_EXECUTIONS.with_label_values(&[outcome]).inc();
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::HandlerFailed {
                event_name: event_name.to_string(),
                failed: failures.len(),
                reason: failures.join("; "),
            })
        }
    }

    fn spawn_unit(
        &self,
        event_name: &str,
        event: DecodedEvent,
        subscription: Subscription,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<HandlerResult> {
        let gate = Arc::clone(&self.gate);
        let pipeline = self.pipeline.clone();
        let scope = self.services.create_scope();
        let cancel = cancel.child_token();
        let event_name = event_name.to_string();

        tokio::spawn(async move {
            let _permit = gate
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("dispatcher gate closed"))?;
            let _in_flight = InFlight::enter();
            let started = Instant::now();

            debug!(
                event_name = %event_name,
                handler = subscription.handler_type().short_name(),
                "Dispatching"
            );

            let ctx = EventContext::new(event_name, event, scope, cancel);
            let subscription = Arc::new(subscription);
            let terminal = delegate(move |ctx: EventContext| {
                let subscription = Arc::clone(&subscription);
                async move { subscription.invoke(&ctx).await }
            });

            let result = pipeline.wrap(terminal)(ctx).await;
            HANDLER_DURATION.observe(started.elapsed().as_secs_f64());
            result
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("available", &self.gate.available_permits())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
