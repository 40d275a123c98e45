//! Keyed, expiring connection pools and the registry that owns them.
//!
//! A [`ConnectionRegistry`] caches one [`ConnectionPool`] per address and
//! security configuration. Each registry runs a single background reaper
//! thread that evicts idle connections whose lifetime has passed. The thread
//! only holds a weak reference and exits once the registry is dropped.

use crate::config::{DriverConfig, MIN_REAPER_INTERVAL};
use crate::error::{ConnectionError, XccError};
use crate::transport::channel::{ByteChannel, ChannelHealth, ServerConnection};
use crate::transport::protocol::{ConnectionProvider, ErrorDisposition};
use crate::transport::tls::SecurityOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;

/// Identity of a pool: address plus security configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    /// `None` for plain pools
    pub security: Option<SecurityOptions>,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, security: Option<SecurityOptions>) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.security.is_some()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_secure() { "xccs" } else { "xcc" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Idle connections for one [`PoolKey`].
pub struct ConnectionPool {
    key: PoolKey,
    idle: Mutex<Vec<ServerConnection>>,
    tls: Option<Arc<ClientConfig>>,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool. Secure keys build their TLS configuration here.
    pub fn new(key: PoolKey, config: &DriverConfig) -> Result<Self, ConnectionError> {
        let tls = match &key.security {
            Some(options) => Some(options.build_client_config()?),
            None => None,
        };
        Ok(Self {
            key,
            idle: Mutex::new(Vec::new()),
            tls,
            idle_timeout: config.pool_idle_timeout,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Close every idle connection.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        let count = drained.len();
        drained.into_iter().for_each(retire);
        count
    }

    fn take_idle(&self, now: Instant) -> Option<ServerConnection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop() {
            if conn.is_expired(now) {
                tracing::trace!(connection = conn.id(), "discarding expired idle connection");
                retire(conn);
                continue;
            }
            if self.tls.is_some() != conn.is_secure() {
                retire(conn);
                continue;
            }
            match conn.health() {
                ChannelHealth::Idle => return Some(conn),
                health => {
                    tracing::debug!(connection = conn.id(), ?health, "discarding unusable idle connection");
                    retire(conn);
                }
            }
        }
        None
    }

    async fn connect(&self) -> Result<ServerConnection, XccError> {
        let address = format!("{}:{}", self.key.host, self.key.port);
        let timeout_ms = self.connect_timeout.as_millis() as u64;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ConnectionError::Timeout { timeout_ms })?
            .map_err(|e| ConnectionError::ConnectionFailed {
                host: self.key.host.clone(),
                port: self.key.port,
                message: e.to_string(),
            })?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::trace!(error = %e, "failed to set TCP_NODELAY");
        }

        let channel = match &self.tls {
            None => ByteChannel::Plain(tcp),
            Some(config) => {
                let server_name = ServerName::try_from(self.key.host.clone()).map_err(|e| {
                    ConnectionError::TlsError(format!("invalid server name '{}': {}", self.key.host, e))
                })?;
                let connector = TlsConnector::from(config.clone());
                let tls = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| ConnectionError::Timeout { timeout_ms })?
                    .map_err(|e| ConnectionError::TlsError(e.to_string()))?;
                ByteChannel::Secure(Box::new(tls))
            }
        };

        tracing::debug!(key = %self.key, "established new connection");
        Ok(ServerConnection::new(
            self.key.clone(),
            channel,
            Instant::now() + self.idle_timeout,
        ))
    }

    fn lifetime(&self, conn: &ServerConnection) -> Duration {
        match conn.keep_alive_hint() {
            Some(hint) => hint.min(self.idle_timeout),
            None => self.idle_timeout,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("idle", &self.idle_count())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[async_trait]
impl ConnectionProvider for ConnectionPool {
    fn address(&self) -> String {
        format!("{}:{}", self.key.host, self.key.port)
    }

    fn is_secure(&self) -> bool {
        self.key.is_secure()
    }

    async fn obtain_connection(&self) -> Result<ServerConnection, XccError> {
        match self.take_idle(Instant::now()) {
            Some(conn) => {
                tracing::trace!(connection = conn.id(), "reusing pooled connection");
                Ok(conn)
            }
            None => self.connect().await,
        }
    }

    fn return_connection(&self, mut conn: ServerConnection) {
        if conn.close_requested() {
            tracing::trace!(connection = conn.id(), "closing connection on server request");
            retire(conn);
            return;
        }
        let health = conn.health();
        if health != ChannelHealth::Idle {
            tracing::debug!(connection = conn.id(), ?health, "not pooling unhealthy connection");
            retire(conn);
            return;
        }
        let lifetime = self.lifetime(&conn);
        if lifetime.is_zero() {
            retire(conn);
            return;
        }
        conn.set_timeout_at(Instant::now() + lifetime);
        self.idle.lock().push(conn);
    }

    fn return_error_connection(&self, conn: ServerConnection, cause: &XccError) -> ErrorDisposition {
        let disposition = match conn.health() {
            ChannelHealth::PeerClosed => ErrorDisposition::Retry,
            _ => ErrorDisposition::Fail,
        };
        tracing::debug!(
            connection = conn.id(),
            error = %cause,
            ?disposition,
            "discarding connection after error"
        );
        retire(conn);
        disposition
    }

    fn close_expired(&self, now: Instant) -> usize {
        let expired: Vec<ServerConnection> = {
            let mut idle = self.idle.lock();
            let (expired, live) = idle.drain(..).partition(|conn| conn.is_expired(now));
            *idle = live;
            expired
        };
        let count = expired.len();
        expired.into_iter().for_each(retire);
        count
    }
}

/// Close a connection leaving the pool. Inside a runtime the channel is shut
/// down in a background task so TLS peers receive close_notify; elsewhere it
/// is dropped.
fn retire(conn: ServerConnection) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(conn.shutdown());
        }
        Err(_) => drop(conn),
    }
}

/// Process-wide (or injected) cache of connection pools.
pub struct ConnectionRegistry {
    pools: Mutex<HashMap<PoolKey, Arc<ConnectionPool>>>,
    config: DriverConfig,
    reaper: Once,
}

impl ConnectionRegistry {
    /// Create an independent registry.
    pub fn new(config: DriverConfig) -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
            config,
            reaper: Once::new(),
        })
    }

    /// The shared registry, configured from the environment on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| ConnectionRegistry::new(DriverConfig::from_env()))
            .clone()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Get or create the pool for `key`, starting the reaper on first use.
    pub fn pool(self: &Arc<Self>, key: PoolKey) -> Result<Arc<ConnectionPool>, ConnectionError> {
        let config = self.config.clone();
        self.pool_with_config(key, &config)
    }

    /// Like [`pool`](Self::pool), but a newly created pool takes its timeouts
    /// from `config`. An existing pool keeps the timeouts it was created with.
    pub fn pool_with_config(
        self: &Arc<Self>,
        key: PoolKey,
        config: &DriverConfig,
    ) -> Result<Arc<ConnectionPool>, ConnectionError> {
        self.start_reaper();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ConnectionPool::new(key.clone(), config)?);
        tracing::debug!(key = %key, "created connection pool");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Number of pools.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Evict expired idle connections from every pool.
    pub fn sweep(&self, now: Instant) -> usize {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        let evicted: usize = pools.iter().map(|pool| pool.close_expired(now)).sum();
        if evicted > 0 {
            tracing::debug!(evicted, "reaper closed expired connections");
        }
        evicted
    }

    /// Close every idle connection in every pool.
    pub fn close_all(&self) -> usize {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        pools.iter().map(|pool| pool.clear()).sum()
    }

    fn start_reaper(self: &Arc<Self>) {
        self.reaper.call_once(|| {
            let registry: Weak<Self> = Arc::downgrade(self);
            let interval = self.config.reaper_interval.max(MIN_REAPER_INTERVAL);
            let runtime = Handle::try_current().ok();
            let spawned = std::thread::Builder::new()
                .name("xcc-connection-reaper".to_string())
                .spawn(move || reap(registry, interval, runtime));
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "failed to start connection reaper");
            }
        });
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("pools", &self.pool_count())
            .field("config", &self.config)
            .finish()
    }
}

fn reap(registry: Weak<ConnectionRegistry>, interval: Duration, runtime: Option<Handle>) {
    tracing::trace!(?interval, "connection reaper started");
    loop {
        std::thread::sleep(interval);
        match registry.upgrade() {
            Some(registry) => {
                let _entered = runtime.as_ref().map(Handle::enter);
                registry.sweep(Instant::now());
            }
            None => break,
        }
    }
    tracing::trace!("connection reaper stopped");
}
