//! Connection pool
//!
//! Connections are shared: a lease pins a connection for one operation, but
//! several leases may target the same connection since requests are
//! multiplexed by request id. The pool prefers an idle matching connection,
//! grows while below `max_connections`, and otherwise shares the
//! least-leased match. Dead connections evict themselves through their
//! close callback.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mongowire_common::{
    metrics, ClientConfig, ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Credentials, Host, Result,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::connection::{Connection, ConnectionId};
use crate::transport::Connector;

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Connections being opened outside the lock
    connecting: usize,
}

struct PoolInner {
    hosts: Vec<Host>,
    max_connections: usize,
    slave_ok: bool,
    app_name: Option<String>,
    credentials: Option<Credentials>,
    auth_database: String,
    connect_timeout: Duration,
    connector: Arc<dyn Connector>,
    authenticator: Arc<dyn Authenticator>,
    state: Mutex<PoolState>,
    /// Signalled whenever an in-flight open finishes
    opened: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    fn evict(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state.connections.retain(|connection| connection.id() != id);
        if state.connections.len() != before {
            debug!("Evicted connection {} from pool", id);
            metrics::set_pool_size(state.connections.len());
        }
    }

    fn matches(&self, connection: &Connection, writable: bool, authenticated_for: Option<&str>) -> bool {
        if !connection.is_alive() {
            return false;
        }

        let role_ok = if writable {
            connection.is_writable()
        } else {
            connection.is_readable(self.slave_ok)
        };

        // Without credentials there is nothing to authenticate
        let auth_ok = match (authenticated_for, &self.credentials) {
            (Some(database), Some(_)) => connection.is_authenticated_for(database),
            _ => true,
        };

        role_ok && auth_ok
    }
}

/// Releases a `connecting` slot, also when the reserving future is dropped
struct ConnectingGuard<'a>(&'a PoolInner);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().connecting -= 1;
        self.0.opened.notify_waiters();
    }
}

/// A connection checked out of the pool. Dropping it returns the connection.
#[derive(Debug)]
pub struct ConnectionLease {
    connection: Arc<Connection>,
}

impl ConnectionLease {
    fn new(connection: Arc<Connection>) -> Self {
        connection.acquire_lease();
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection.release_lease();
    }
}

/// Shared pool of server connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                hosts: config.hosts.clone(),
                max_connections: config.max_connections.max(1),
                slave_ok: config.slave_ok,
                app_name: config.app_name.clone(),
                credentials: config.credentials.clone(),
                auth_database: config.auth_database().to_string(),
                connect_timeout: config.connect_timeout(),
                connector,
                authenticator,
                state: Mutex::new(PoolState::default()),
                opened: Notify::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Check out a connection that is writable (or readable) and, when
    /// `authenticated_for` is set, authenticated against that database.
    pub async fn reserve(&self, writable: bool, authenticated_for: Option<&str>) -> Result<ConnectionLease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(pool_closed());
        }
        if self.inner.hosts.is_empty() {
            return Err(ConnectionError::new(
                ConnectionErrorKind::CannotConnect,
                Some(ConnectionErrorReason::NoHostSpecified),
            )
            .into());
        }

        let stale = loop {
            // Registered before inspecting the table so a finishing open is never missed
            let opened = self.inner.opened.notified();

            {
                let mut state = self.inner.state.lock();
                state.connections.retain(|connection| connection.is_alive());

                let best = state
                    .connections
                    .iter()
                    .filter(|connection| self.inner.matches(connection, writable, authenticated_for))
                    .min_by_key(|connection| connection.lease_count())
                    .cloned();
                let at_capacity = state.connections.len() + state.connecting >= self.inner.max_connections;

                match best {
                    Some(connection) if connection.lease_count() == 0 || at_capacity => {
                        // Lease while still holding the lock so concurrent callers see it
                        return Ok(ConnectionLease::new(connection));
                    }
                    None if at_capacity && state.connecting == 0 => {
                        // Make room by retiring an idle connection of the wrong kind
                        let Some(index) = state.connections.iter().position(|c| c.lease_count() == 0) else {
                            warn!(
                                "Pool is full ({} connections) and none matches writable={}",
                                state.connections.len(),
                                writable
                            );
                            return Err(no_available_hosts());
                        };
                        let retired = state.connections.remove(index);
                        metrics::set_pool_size(state.connections.len());
                        state.connecting += 1;
                        break Some(retired);
                    }
                    None if at_capacity => {}
                    _ => {
                        state.connecting += 1;
                        break None;
                    }
                }
            }

            debug!("Pool at capacity; waiting for a connection to open");
            opened.await;
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(pool_closed());
            }
        };

        let _connecting = ConnectingGuard(&self.inner);
        if let Some(retired) = stale {
            debug!("Retiring idle connection {} to make room for writable={}", retired.id(), writable);
            retired.close().await;
        }
        self.open_matching(writable, authenticated_for)
            .await
            .map(ConnectionLease::new)
    }

    /// Return a lease early; equivalent to dropping it
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    /// Try each host in order until one yields a matching connection
    async fn open_matching(&self, writable: bool, authenticated_for: Option<&str>) -> Result<Arc<Connection>> {
        let mut reached_any = false;

        for host in &self.inner.hosts {
            let connection = match self.open(host).await {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    warn!("Could not connect to {}: {}", host, e);
                    continue;
                }
            };
            reached_any = true;

            if let Some(credentials) = &self.inner.credentials {
                let database = authenticated_for.unwrap_or(self.inner.auth_database.as_str());
                if let Err(e) = self
                    .inner
                    .authenticator
                    .authenticate(&connection, credentials, database)
                    .await
                {
                    warn!("Authentication on {} against {} failed: {}", host, database, e);
                    connection.close().await;
                    return Err(e);
                }
                connection.mark_authenticated(database);
            }

            let matched = self.inner.matches(&connection, writable, authenticated_for);
            if !self.admit(&connection, matched) {
                connection.close().await;
                if matched {
                    return Err(no_available_hosts());
                }
                continue;
            }

            if matched {
                return Ok(connection);
            }
            debug!("{} does not satisfy writable={}; trying the next host", host, writable);
        }

        if reached_any {
            Err(no_available_hosts())
        } else {
            Err(ConnectionError::new(ConnectionErrorKind::CannotConnect, None).into())
        }
    }

    /// Add a fresh connection to the table unless the pool closed or filled
    /// meanwhile. A connection that does not serve the reservation must leave
    /// room for every open still in flight, this reservation's included.
    fn admit(&self, connection: &Arc<Connection>, matched: bool) -> bool {
        let mut state = self.inner.state.lock();
        let limit = if matched {
            self.inner.max_connections
        } else {
            self.inner.max_connections.saturating_sub(state.connecting)
        };
        if self.inner.closed.load(Ordering::SeqCst) || state.connections.len() >= limit {
            return false;
        }
        state.connections.push(Arc::clone(connection));
        metrics::set_pool_size(state.connections.len());
        true
    }

    async fn open(&self, host: &Host) -> Result<Connection> {
        let stream = tokio::time::timeout(self.inner.connect_timeout, self.inner.connector.connect(host))
            .await
            .map_err(|_| ConnectionError::new(ConnectionErrorKind::CannotConnect, None))??;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let connection = Connection::open(
            id,
            host.clone(),
            stream,
            Some(Box::new(move |id| {
                if let Some(pool) = pool.upgrade() {
                    pool.evict(id);
                }
            })),
        );

        if let Err(e) = connection
            .handshake(self.inner.app_name.as_deref(), Some(self.inner.connect_timeout))
            .await
        {
            connection.close().await;
            return Err(e);
        }

        info!("Connection {} to {} joined the pool", id, host);
        Ok(connection)
    }

    /// Connections currently in the pool
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close every connection; later reservations fail
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.opened.notify_waiters();
        let connections = std::mem::take(&mut self.inner.state.lock().connections);
        metrics::set_pool_size(0);

        info!("Closing pool with {} connections", connections.len());
        for connection in connections {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("hosts", &self.inner.hosts)
            .field("max_connections", &self.inner.max_connections)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

fn pool_closed() -> mongowire_common::Error {
    ConnectionError::new(
        ConnectionErrorKind::CannotConnect,
        Some(ConnectionErrorReason::ConnectionClosed),
    )
    .into()
}

fn no_available_hosts() -> mongowire_common::Error {
    ConnectionError::new(
        ConnectionErrorKind::CannotConnect,
        Some(ConnectionErrorReason::NoAvailableHosts),
    )
    .into()
}
