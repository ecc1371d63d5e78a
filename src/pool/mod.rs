//! Connection Pool
//!
//! Keeps one broker connection per request identity. Connections are created
//! on first use, shared by every later request with the same identity, and
//! evicted when the broker reports them gone or a publish over them fails.
//!
//! The mapping lives behind a `parking_lot::RwLock` that is only held inside
//! short synchronous sections. Creation for a given key is single-flighted:
//! concurrent first requests for a new identity wait on a per-key lock and
//! then reuse whatever the first one stored.


use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{BrokerConnection, ClientError, ConnectOptions, Connector};
use crate::identity::Identity;

/// Where and as whom the pool connects
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Broker URL
    pub url: String,
    /// Client display name presented to the broker
    pub client_name: String,
}

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Establishing the broker session failed
    Connect(ClientError),
    /// `close_all` has run; no new connections are handed out
    ShuttingDown,
}

impl PoolError {
    /// Whether the broker rejected the caller's credentials
    pub fn is_authorization(&self) -> bool {
        matches!(self, PoolError::Connect(e) if e.is_authorization())
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Connect(e) => write!(f, "{}", e),
            PoolError::ShuttingDown => write!(f, "connection pool is shutting down"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<ClientError> for PoolError {
    fn from(e: ClientError) -> Self {
        PoolError::Connect(e)
    }
}

/// A pooled broker session. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct PooledConnection {
    id: u64,
    key: String,
    handle: Arc<dyn BrokerConnection>,
}

impl PooledConnection {
    /// Process-unique instance number
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), ClientError> {
        self.handle.publish(subject, payload).await
    }

    pub async fn close(&self) {
        self.handle.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl fmt::Debug for PooledConnection {
    // The key embeds the password
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Keyed registry of live broker connections
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, PooledConnection>>,
    /// Per-key creation locks
    creating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_id: AtomicU64,
    /// Set by `close_all`, under the `connections` write lock
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            connections: RwLock::new(HashMap::new()),
            creating: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Return the connection for `identity`, connecting if there is none
    pub async fn get_or_create(
        self: &Arc<Self>,
        identity: &Identity,
    ) -> Result<PooledConnection, PoolError> {
        let key = identity.key();
        if let Some(conn) = self.get(key) {
            return Ok(conn);
        }
        if self.is_closed() {
            return Err(PoolError::ShuttingDown);
        }

        let slot = CreationSlot::acquire(&self.creating, key);
        let _guard = slot.lock.lock().await;
        // Someone else may have finished while we waited
        match self.get(key) {
            Some(conn) => Ok(conn),
            None => self.connect(identity).await,
        }
    }

    async fn connect(self: &Arc<Self>, identity: &Identity) -> Result<PooledConnection, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = identity.key().to_string();

        debug!(
            "Connecting to broker at {} as '{}'",
            self.config.url,
            identity.username()
        );
        let options = self.connect_options(id, identity);
        let handle = match self.connector.connect(&self.config.url, options).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "Broker connection for '{}' failed: {}",
                    identity.username(),
                    e
                );
                return Err(PoolError::Connect(e));
            }
        };

        let conn = PooledConnection {
            id,
            key: key.clone(),
            handle,
        };

        let shutting_down = {
            let mut connections = self.connections.write();
            if self.closed.load(Ordering::SeqCst) {
                true
            } else if conn.is_closed() {
                // Its close hook already ran against an empty slot
                return Err(PoolError::Connect(ClientError::Closed));
            } else {
                connections.insert(key, conn.clone());
                false
            }
        };

        if shutting_down {
            conn.close().await;
            return Err(PoolError::ShuttingDown);
        }

        info!(
            "Opened broker connection #{} for '{}'",
            id,
            identity.username()
        );
        Ok(conn)
    }

    fn connect_options(self: &Arc<Self>, id: u64, identity: &Identity) -> ConnectOptions {
        let user = identity.username().to_string();
        let key = identity.key().to_string();
        let pool = Arc::downgrade(self);

        ConnectOptions::new(self.config.client_name.clone())
            .with_credentials(identity.credentials().cloned())
            .on_connect({
                let user = user.clone();
                move || debug!("Broker connection #{} for '{}' is up", id, user)
            })
            .on_disconnect({
                let user = user.clone();
                let key = key.clone();
                let pool = pool.clone();
                move |err| {
                    warn!("Broker connection #{} for '{}' lost: {}", id, user, err);
                    evict(&pool, &key, id);
                }
            })
            .on_close(move || {
                debug!("Broker connection #{} for '{}' closed", id, user);
                evict(&pool, &key, id);
            })
    }

    /// Look up the connection for `key`
    pub fn get(&self, key: &str) -> Option<PooledConnection> {
        self.connections.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.connections.read().contains_key(key)
    }

    /// Forget the connection for `key` without closing it
    pub fn remove(&self, key: &str) -> bool {
        self.connections.write().remove(key).is_some()
    }

    /// Forget `conn` if it is still the pooled instance for its key
    pub fn remove_connection(&self, conn: &PooledConnection) -> bool {
        self.remove_instance(&conn.key, conn.id)
    }

    fn remove_instance(&self, key: &str, id: u64) -> bool {
        let mut connections = self.connections.write();
        match connections.get(key) {
            Some(current) if current.id == id => {
                connections.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drain the pool and close every connection it held.
    ///
    /// Marks the pool closed first, so connections that finish connecting
    /// afterwards are closed by their creator instead of being stored.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<PooledConnection> = {
            let mut connections = self.connections.write();
            self.closed.store(true, Ordering::SeqCst);
            connections.drain().map(|(_, conn)| conn).collect()
        };

        let count = drained.len();
        join_all(drained.iter().map(|conn| conn.close())).await;
        info!("Closed {} broker connections", count);
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// A caller's claim on the creation lock for one key.
///
/// Dropping it removes the map entry once no other caller holds the lock,
/// including when the creating future is cancelled mid-connect.
struct CreationSlot<'a> {
    creating: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> CreationSlot<'a> {
    fn acquire(creating: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>, key: &'a str) -> Self {
        let lock = creating
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Self {
            creating,
            key,
            lock,
        }
    }
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        // The map and this slot account for two references
        self.creating.remove_if(self.key, |_, l| {
            Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) <= 2
        });
    }
}

/// Hook-side eviction; a no-op once the pool is gone
fn evict(pool: &Weak<ConnectionPool>, key: &str, id: u64) {
    if let Some(pool) = pool.upgrade() {
        if pool.remove_instance(key, id) {
            debug!("Evicted broker connection #{}", id);
        }
    }
}
