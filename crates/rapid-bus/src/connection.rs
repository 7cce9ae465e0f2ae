//! # Persistent Connection
//!
//! Keeps one broker connection alive for the whole bus.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──signal──▶ Failed
//!                              ▲                    │
//!                              └──────reconnect─────┘  (fires Recovered)
//! ```
//!
//! - Transient connect errors are retried forever at a fixed interval
//! - Any shutdown, blocked or callback-error signal marks the connection
//!   failed and reconnects immediately
//! - Signals from a connection that was already replaced are ignored
//! - `Recovered` fires once per failure-to-success transition, never on the
//!   first connect

use bus_telemetry::CONNECTION_RECOVERIES;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::ports::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal};

const RECOVERED_CHANNEL_CAPACITY: usize = 16;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Failed,
}

struct State {
    connection: Option<Arc<dyn BrokerConnection>>,
    /// A connection was lost or refused since the last success.
    failed: bool,
    ever_connected: bool,
    disposed: bool,
    /// Bumped on every successful connect; lets watchers detect staleness.
    generation: u64,
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    reconnect_interval: Duration,
    state: Mutex<State>,
    /// Serializes connect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    recovered_tx: broadcast::Sender<()>,
    shutdown: CancellationToken,
}

/// Owner of the physical broker connection. Clones share it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, reconnect_interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (recovered_tx, _) = broadcast::channel(RECOVERED_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect_interval,
                state: Mutex::new(State {
                    connection: None,
                    failed: false,
                    ever_connected: false,
                    disposed: false,
                    generation: 0,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                state_tx,
                recovered_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Whether an open, non-disposed connection exists.
    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        !state.disposed && state.connection.as_ref().is_some_and(|c| c.is_open())
    }

    /// Connect unless already connected.
    ///
    /// Waits through transient failures; returns `false` on a permanent
    /// failure or when the manager is disposed.
    pub async fn try_connect(&self) -> bool {
        let _guard = self.inner.connect_lock.lock().await;

        if self.is_connected() {
            return true;
        }

        loop {
            if self.inner.state.lock().disposed {
                return false;
            }

            match self.inner.connector.connect().await {
                Ok(connection) => return self.on_connected(connection),
                Err(e) if e.is_transient() => {
                    warn!(
                        broker = %self.inner.connector.describe(),
                        error = %e,
                        retry_in_secs = self.inner.reconnect_interval.as_secs_f64(),
                        "Broker unreachable, waiting to try again"
                    );
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.inner.reconnect_interval) => {}
                    }
                }
                Err(e) => {
                    error!(
                        broker = %self.inner.connector.describe(),
                        error = %e,
                        "Could not connect to broker"
                    );
                    self.inner.state.lock().failed = true;
                    self.inner.state_tx.send_replace(ConnectionState::Failed);
                    return false;
                }
            }
        }
    }

    fn on_connected(&self, connection: Arc<dyn BrokerConnection>) -> bool {
        let (generation, recovered) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                drop(state);
                tokio::spawn(async move {
                    if let Err(e) = connection.close().await {
                        debug!(error = %e, "Closing connection opened after dispose");
                    }
                });
                return false;
            }
            state.generation += 1;
            state.connection = Some(Arc::clone(&connection));
            let recovered = state.failed || state.ever_connected;
            state.failed = false;
            state.ever_connected = true;
            (state.generation, recovered)
        };

        self.inner.state_tx.send_replace(ConnectionState::Connected);
        info!(
            broker = %self.inner.connector.describe(),
            generation,
            "Acquired a persistent broker connection"
        );

        self.spawn_signal_watcher(&connection, generation);

        if recovered {
            CONNECTION_RECOVERIES.inc();
            info!(generation, "Broker connection recovered after a failure");
            let _ = self.inner.recovered_tx.send(());
        }
        true
    }

    fn spawn_signal_watcher(&self, connection: &Arc<dyn BrokerConnection>, generation: u64) {
        let mut signals = connection.signals();
        let shutdown = self.inner.shutdown.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => return,
                signal = signals.recv() => signal,
            };
            let signal = match signal {
                Ok(signal) => signal,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    ConnectionSignal::CallbackError(format!("{missed} connection signal(s) missed"))
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            ConnectionManager { inner }
                .handle_signal(generation, signal)
                .await;
        });
    }

    async fn handle_signal(&self, generation: u64, signal: ConnectionSignal) {
        let old = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                info!(?signal, "Connection manager is disposed, not reconnecting");
                return;
            }
            if state.generation != generation {
                debug!(generation, current = state.generation, "Ignoring signal from a replaced connection");
                return;
            }
            state.failed = true;
            state.connection.take()
        };

        warn!(?signal, "Broker connection failed, trying to reconnect");
        self.inner.state_tx.send_replace(ConnectionState::Failed);

        if let Some(old) = old {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Closing the failed connection");
            }
        }

        self.try_connect().await;
    }

    /// Open a channel on the current connection.
    ///
    /// # Errors
    ///
    /// `NotConnected` without an open connection; `Broker` if the broker
    /// refuses the channel.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let connection = {
            let state = self.inner.state.lock();
            if state.disposed {
                None
            } else {
                state.connection.clone().filter(|c| c.is_open())
            }
        }
        .ok_or(BusError::NotConnected)?;

        Ok(connection.create_channel().await?)
    }

    /// Fires once per recovery after a failure.
    pub fn recovered(&self) -> broadcast::Receiver<()> {
        self.inner.recovered_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Broker target without credentials.
    pub fn describe(&self) -> String {
        self.inner.connector.describe()
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn dispose(&self) {
        let connection = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.connection.take()
        };

        self.inner.shutdown.cancel();
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                error!(error = %e, "Failed to close broker connection");
            }
        }
        info!(broker = %self.inner.connector.describe(), "Broker connection disposed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.inner.connector.describe())
            .field("state", &self.state())
            .finish()
    }
}
