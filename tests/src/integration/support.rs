//! Shared fixtures for the integration scenarios.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use rapid_bus::{
    BusConfig, CancellationToken, EventBus, EventBusBuilder, HandlerResult, InMemoryBroker,
    IntegrationEvent, IntegrationEventHandler,
};

pub const EXCHANGE: &str = "it_bus";
pub const QUEUE: &str = "it_queue";
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: String,
}

impl IntegrationEvent for Sample {}

impl Sample {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Other {
    pub n: u32,
}

impl IntegrationEvent for Other {}

// =============================================================================
// SHARED STATE
// =============================================================================

/// Ordered record of what ran. Clones share the log.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }
}

/// How `RecordingHandler` behaves per event id.
#[derive(Default)]
pub struct Script {
    fail_once: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl Script {
    pub fn fail_once(&self, id: &str) {
        self.fail_once.lock().insert(id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

pub struct RecordingHandler {
    pub journal: Journal,
    pub script: Arc<Script>,
}

#[async_trait]
impl IntegrationEventHandler<Sample> for RecordingHandler {
    async fn handle(&self, event: &Sample, _cancel: &CancellationToken) -> HandlerResult {
        let now = self.script.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = *self.script.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.script.current.fetch_sub(1, Ordering::SeqCst);
        self.journal.push(format!("recording:{}", event.id));

        if self.script.fail_once.lock().remove(&event.id) {
            anyhow::bail!("scripted failure for {}", event.id);
        }
        Ok(())
    }
}

pub struct AuditHandler {
    pub journal: Journal,
}

#[async_trait]
impl IntegrationEventHandler<Sample> for AuditHandler {
    async fn handle(&self, event: &Sample, _cancel: &CancellationToken) -> HandlerResult {
        self.journal.push(format!("audit:{}", event.id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<Other> for AuditHandler {
    async fn handle(&self, event: &Other, _cancel: &CancellationToken) -> HandlerResult {
        self.journal.push(format!("audit-other:{}", event.n));
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub fn config() -> BusConfig {
    BusConfig {
        exchange_name: EXCHANGE.into(),
        queue_name: QUEUE.into(),
        reconnect_interval_secs: 1,
        publish_retry_count: 2,
        publish_retry_base_delay_ms: 10,
        requeue_delay_ms: 50,
        max_concurrent_handlers: 2,
        ..BusConfig::default()
    }
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub journal: Journal,
    pub script: Arc<Script>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: InMemoryBroker::new(),
            journal: Journal::default(),
            script: Arc::new(Script::default()),
        }
    }

    /// Builder with the broker, config and handler services wired in but no
    /// subscriptions.
    pub fn builder(&self) -> EventBusBuilder {
        let (journal, script) = (self.journal.clone(), Arc::clone(&self.script));
        let audit_journal = self.journal.clone();
        EventBus::builder()
            .config(config())
            .connector(self.broker.clone())
            .add_singleton(self.journal.clone())
            .add_scoped(move |_| RecordingHandler {
                journal: journal.clone(),
                script: Arc::clone(&script),
            })
            .add_scoped(move |_| AuditHandler {
                journal: audit_journal.clone(),
            })
    }

    /// Started bus with `RecordingHandler` subscribed to `Sample`.
    pub async fn start_recording(&self) -> EventBus {
        let bus = self.builder().build().expect("bus builds");
        bus.subscribe::<Sample, RecordingHandler>()
            .await
            .expect("subscribe");
        bus.start().await.expect("bus starts");
        bus
    }
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}
