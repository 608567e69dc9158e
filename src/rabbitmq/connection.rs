// src/rabbitmq/connection.rs
// Owns the single broker connection and its shared channel

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{BrokerChannel, BrokerConnection, ChannelConfig, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// A connection and the channel opened on it, published together
struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.connection.is_connected() && self.channel.is_open()
    }

    /// Channel first, then connection. Failures are logged and skipped.
    async fn close(&self) {
        if self.channel.is_open() {
            match self.channel.close().await {
                Ok(()) => info!(generation = self.generation, "Channel closed successfully"),
                Err(e) => error!(generation = self.generation, error = %e, "Failed to close channel"),
            }
        }

        if self.connection.is_connected() {
            match self.connection.close().await {
                Ok(()) => info!(generation = self.generation, "Connection closed successfully"),
                Err(e) => error!(generation = self.generation, error = %e, "Failed to close connection"),
            }
        }
    }
}

struct Inner {
    state: ConnectionState,
    session: Option<Arc<Session>>,
}

/// Borrowed handle on the shared channel. It stops working as soon as the
/// supervisor replaces or drops the session it was issued from.
#[derive(Clone)]
pub struct ChannelLease {
    generation: u64,
    current: Arc<AtomicU64>,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The channel, if the lease is still current and the channel open
    pub fn channel(&self) -> Result<&Arc<dyn BrokerChannel>> {
        if self.current.load(Ordering::SeqCst) != self.generation || !self.channel.is_open() {
            return Err(RabbitMQError::NotConnected);
        }
        Ok(&self.channel)
    }
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    channel_config: ChannelConfig,
    inner: RwLock<Inner>,
    generation: Arc<AtomicU64>,
    dial_lock: AsyncMutex<()>,
    shutdown_lock: AsyncMutex<()>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, channel_config: ChannelConfig) -> Self {
        Self {
            connector,
            channel_config,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            dial_lock: AsyncMutex::new(()),
            shutdown_lock: AsyncMutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn state(&self) -> ConnectionState {
        self.read().state
    }

    /// Generation of the live session, if any
    pub fn generation(&self) -> Option<u64> {
        self.read().session.as_ref().map(|s| s.generation)
    }

    /// Dial the broker and open the shared channel. A healthy supervisor
    /// returns immediately; concurrent callers are serialised.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        let _dial = self.dial_lock.lock().await;

        // shutdown bumps the generation; a dial that finishes after it is discarded
        let (stale, expected) = {
            let mut inner = self.write();
            match inner.state {
                ConnectionState::Closing => return Err(RabbitMQError::ShuttingDown),
                ConnectionState::Connected
                    if inner.session.as_ref().is_some_and(|s| s.is_alive()) =>
                {
                    debug!("Connection already established");
                    return Ok(());
                }
                _ => {}
            }
            inner.state = ConnectionState::Connecting;
            let stale = inner.session.take();
            if stale.is_some() {
                self.invalidate();
            }
            (stale, self.generation.load(Ordering::SeqCst))
        };

        if let Some(stale) = stale {
            debug!(generation = stale.generation, "Releasing stale session");
            stale.close().await;
        }

        let uri_for_logs = redact_uri(uri);
        info!(uri = %uri_for_logs, "Connecting to RabbitMQ");

        let dialed = self.dial(uri).await;

        let discarded = {
            let mut inner = self.write();
            match dialed {
                Ok((connection, channel))
                    if self.generation.load(Ordering::SeqCst) != expected
                        || inner.state != ConnectionState::Connecting =>
                {
                    Session {
                        generation: 0,
                        connection,
                        channel,
                    }
                }
                Ok((connection, channel)) => {
                    let generation = self.invalidate();
                    inner.session = Some(Arc::new(Session {
                        generation,
                        connection,
                        channel,
                    }));
                    inner.state = ConnectionState::Connected;
                    info!(uri = %uri_for_logs, generation, "Connected to RabbitMQ");
                    return Ok(());
                }
                Err(e) => {
                    if inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Disconnected;
                    }
                    error!(uri = %uri_for_logs, error = %e, "Failed to connect to RabbitMQ");
                    return Err(e);
                }
            }
        };

        warn!("Shutdown started while dialing, discarding new connection");
        discarded.close().await;
        Err(RabbitMQError::ShuttingDown)
    }

    async fn dial(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let connection = self.connector.connect(uri).await?;

        match connection.create_channel(&self.channel_config).await {
            Ok(channel) => {
                info!(channel_id = channel.id(), "Channel opened successfully");
                Ok((connection, channel))
            }
            Err(e) => {
                error!(error = %e, "Failed to open a channel");
                if let Err(close_error) = connection.close().await {
                    debug!(error = %close_error, "Failed to close half-open connection");
                }
                Err(match e {
                    RabbitMQError::Connection(_) => e,
                    other => RabbitMQError::Connection(other.to_string()),
                })
            }
        }
    }

    /// Non-blocking liveness check
    pub fn is_healthy(&self) -> bool {
        self.read().session.as_ref().is_some_and(|s| s.is_alive())
    }

    /// Forget the current session after a detected failure. Outstanding
    /// leases fail from here on.
    pub async fn mark_failed(&self) {
        let stale = {
            let mut inner = self.write();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            let stale = inner.session.take();
            self.invalidate();
            stale
        };

        if let Some(stale) = stale {
            warn!(generation = stale.generation, "Connection marked as failed");
            stale.close().await;
        }
    }

    /// Borrow the shared channel
    pub fn lease(&self) -> Result<ChannelLease> {
        let inner = self.read();
        match inner.session.as_ref() {
            Some(session) if inner.state == ConnectionState::Connected && session.is_alive() => {
                Ok(ChannelLease {
                    generation: session.generation,
                    current: self.generation.clone(),
                    channel: session.channel.clone(),
                })
            }
            _ => Err(RabbitMQError::NotConnected),
        }
    }

    /// Open a channel for a single operation. The caller closes it.
    pub async fn open_dedicated_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = {
            let inner = self.read();
            match inner.session.as_ref() {
                Some(session)
                    if inner.state == ConnectionState::Connected
                        && session.connection.is_connected() =>
                {
                    session.connection.clone()
                }
                _ => return Err(RabbitMQError::NotConnected),
            }
        };

        connection.create_channel(&ChannelConfig::one_shot()).await
    }

    /// Close channel then connection. Ends Disconnected. A concurrent
    /// caller waits until the first one has released the session.
    pub async fn shutdown(&self) {
        let _closing = self.shutdown_lock.lock().await;
        let session = {
            let mut inner = self.write();
            inner.state = ConnectionState::Closing;
            self.invalidate();
            inner.session.take()
        };

        info!("Closing RabbitMQ connection");
        if let Some(session) = session {
            session.close().await;
        }

        self.write().state = ConnectionState::Disconnected;
        info!("RabbitMQ connection shut down");
    }
}

/// Hide the password component of an AMQP URI
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &uri[authority_start..];
    let authority_end = rest.find('/').unwrap_or(rest.len());

    let Some(at) = rest[..authority_end].rfind('@') else {
        return uri.to_string();
    };
    match rest[..at].find(':') {
        Some(colon) => format!(
            "{}{}:***{}",
            &uri[..authority_start],
            &rest[..colon],
            &rest[at..]
        ),
        None => uri.to_string(),
    }
}
