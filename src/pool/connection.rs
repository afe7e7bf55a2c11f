//! Per-authority connection pooling with borrow/restore tokens
//!
//! This module provides one pool per downstream authority with:
//! - A hard cap on live handles (idle plus borrowed)
//! - Tokens that must be redeemed exactly once, by restore or discard
//! - Lazy eviction of idle handles past their time-to-live
//! - Bounded waiting when the pool is exhausted

use super::authority::Authority;
use crate::tls::{SharedTrustContext, TlsConfigError};
use crate::transport::{ConnectOptions, Connection, TransportError, TransportRegistry};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a pooled connection, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out after {waited:?} waiting for a connection to {authority}")]
    Timeout { authority: String, waited: Duration },

    #[error("Failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: TransportError,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("No pool exists for {0}")]
    NoPool(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections per authority, idle and borrowed together
    pub max_connections: usize,

    /// Maximum idle time before a connection is evicted
    pub max_idle_time: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Enable HTTP/2
    pub http2_enabled: bool,

    /// HTTP/1.1 read buffer limit in bytes
    pub max_buf_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_idle_time: Duration::from_secs(1800),
            connect_timeout: Duration::from_secs(2),
            http2_enabled: true,
            max_buf_size: 24 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn from_request(request: &crate::config::RequestConfig) -> Self {
        Self {
            max_connections: request.connection_pool_size.max(1),
            max_idle_time: request.connection_expire_time(),
            connect_timeout: request.connect_timeout(),
            http2_enabled: request.enable_http2,
            max_buf_size: request.buffer_bytes(),
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            enable_http2: self.http2_enabled,
            max_buf_size: self.max_buf_size,
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created
    pub total_created: u64,

    /// Total connections reused
    pub total_reused: u64,

    /// Total connections discarded, evicted or abandoned
    pub total_discarded: u64,

    /// Failed connection attempts
    pub failed_attempts: u64,

    /// Borrows that gave up waiting
    pub timeouts: u64,

    /// Borrowed connections
    pub active_connections: usize,

    /// Idle connections
    pub idle_connections: usize,
}

/// Idle and borrowed connection ids, read under one lock
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub idle: Vec<ConnectionId>,
    pub borrowed: Vec<ConnectionId>,
}

/// A pooled connection wrapper
pub struct PooledConnection {
    id: ConnectionId,

    /// The transport connection
    conn: Box<dyn Connection>,

    /// Last used timestamp
    last_used: Instant,

    /// Number of times this connection has been used
    use_count: u64,

    /// Connection creation time
    created_at: Instant,

    /// Capacity slot; released when the connection is dropped
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, permit: OwnedSemaphorePermit) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            conn,
            last_used: now,
            use_count: 0,
            created_at: now,
            _permit: permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Mark connection as used
    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    fn close(mut self) {
        if let Err(e) = self.conn.close() {
            debug!(connection = %self.id, error = %e, "Error closing connection");
        }
    }
}

struct IdleEntry {
    conn: PooledConnection,
    expires_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleEntry>,
    borrowed: HashSet<ConnectionId>,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
}

/// Per-authority connection pool
struct AuthorityPool {
    /// Id of the owning [`ConnectionPool`]
    owner: u64,

    authority: Authority,

    state: Mutex<PoolState>,

    /// One permit per live connection
    capacity: Arc<Semaphore>,

    /// Signaled when a connection is restored to idle
    available: Notify,

    max_idle_time: Duration,

    stats: Counters,
}

impl AuthorityPool {
    fn new(owner: u64, authority: Authority, config: &PoolConfig) -> Self {
        Self {
            owner,
            authority,
            state: Mutex::new(PoolState::default()),
            capacity: Arc::new(Semaphore::new(config.max_connections)),
            available: Notify::new(),
            max_idle_time: config.max_idle_time,
            stats: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the most recently restored usable idle connection, evicting
    /// expired or closed ones found on the way.
    fn pop_idle(&self) -> Option<PooledConnection> {
        let mut evicted = Vec::new();
        let found = {
            let mut state = self.lock();
            let now = Instant::now();
            let mut found = None;
            while let Some(entry) = state.idle.pop_back() {
                if entry.expires_at <= now || !entry.conn.is_open() {
                    evicted.push(entry.conn);
                    continue;
                }
                state.borrowed.insert(entry.conn.id);
                found = Some(entry.conn);
                break;
            }
            found
        };

        for conn in evicted {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            warn!(
                authority = %self.authority,
                connection = %conn.id,
                age_secs = conn.created_at.elapsed().as_secs(),
                "Evicting expired idle connection"
            );
            conn.close();
        }
        found
    }

    /// Drop idle connections past their time-to-live
    fn evict_expired(&self) -> usize {
        let expired: Vec<PooledConnection> = {
            let mut state = self.lock();
            let now = Instant::now();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|e| e.expires_at > now && e.conn.is_open());
            state.idle = keep;
            expired.into_iter().map(|e| e.conn).collect()
        };

        let removed = expired.len();
        for conn in expired {
            conn.close();
        }
        if removed > 0 {
            self.stats
                .discarded
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(
                authority = %self.authority,
                removed = removed,
                "Cleaned up idle connections"
            );
        }
        removed
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total_created: self.stats.created.load(Ordering::Relaxed),
            total_reused: self.stats.reused.load(Ordering::Relaxed),
            total_discarded: self.stats.discarded.load(Ordering::Relaxed),
            failed_attempts: self.stats.failed.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            active_connections: state.borrowed.len(),
            idle_connections: state.idle.len(),
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            idle: state.idle.iter().map(|e| e.conn.id).collect(),
            borrowed: state.borrowed.iter().copied().collect(),
        }
    }
}

/// Ties a borrowed connection to the pool that issued it. Dropping a mark
/// whose token was never redeemed releases the borrow and counts the
/// connection as abandoned.
struct BorrowMark {
    owner: u64,
    id: ConnectionId,
    home: Weak<AuthorityPool>,
    redeemed: bool,
}

impl Drop for BorrowMark {
    fn drop(&mut self) {
        if self.redeemed {
            return;
        }
        let Some(home) = self.home.upgrade() else {
            return;
        };
        let removed = home.lock().borrowed.remove(&self.id);
        if removed {
            home.stats.discarded.fetch_add(1, Ordering::Relaxed);
            warn!(
                authority = %home.authority,
                connection = %self.id,
                "Connection token dropped without restore or discard; closing connection"
            );
        }
    }
}

/// Exclusive loan of a pooled connection.
///
/// Hand it back with [`ConnectionPool::restore`] or
/// [`ConnectionPool::discard`]. A token that is simply dropped closes its
/// connection and frees the capacity slot.
pub struct ConnectionToken {
    conn: PooledConnection,
    mark: BorrowMark,
    authority: Authority,
    borrowed_at: Instant,
}

impl ConnectionToken {
    pub fn id(&self) -> ConnectionId {
        self.conn.id
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn borrowed_at(&self) -> Instant {
        self.borrowed_at
    }

    pub fn use_count(&self) -> u64 {
        self.conn.use_count
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// The transport connection, counted as one use
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.mark_used();
        self.conn.conn.as_mut()
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("id", &self.conn.id)
            .field("authority", &self.authority.to_string())
            .finish()
    }
}

/// Connection pool manager for all authorities
pub struct ConnectionPool {
    id: u64,

    /// Per-authority connection pools
    pools: DashMap<Authority, Arc<AuthorityPool>>,

    /// Pool configuration
    config: PoolConfig,

    transports: TransportRegistry,

    trust: Arc<SharedTrustContext>,
}

impl ConnectionPool {
    /// Create a new connection pool manager
    pub fn new(
        config: PoolConfig,
        transports: TransportRegistry,
        trust: Arc<SharedTrustContext>,
    ) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            pools: DashMap::new(),
            config,
            transports,
            trust,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn trust(&self) -> &Arc<SharedTrustContext> {
        &self.trust
    }

    /// The pool for `authority`, created on first use
    fn pool_for(&self, authority: &Authority) -> Arc<AuthorityPool> {
        if let Some(pool) = self.pools.get(authority) {
            return Arc::clone(pool.value());
        }
        let pool = self.pools.entry(authority.clone()).or_insert_with(|| {
            info!(
                authority = %authority,
                max_connections = self.config.max_connections,
                "Creating connection pool"
            );
            Arc::new(AuthorityPool::new(self.id, authority.clone(), &self.config))
        });
        Arc::clone(pool.value())
    }

    /// Borrow a connection, reusing an idle one or opening a new one.
    ///
    /// Waits at most `timeout` when the pool is at capacity. Connection
    /// establishment counts against the same deadline.
    pub async fn borrow(
        &self,
        authority: &Authority,
        timeout: Duration,
    ) -> Result<ConnectionToken, PoolError> {
        let pool = self.pool_for(authority);
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(conn) = pool.pop_idle() {
                return Ok(self.issue_reused(&pool, conn));
            }

            // Register interest before checking capacity so a restore landing
            // in between still wakes this borrower.
            let notified = pool.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = pool.pop_idle() {
                return Ok(self.issue_reused(&pool, conn));
            }

            match Arc::clone(&pool.capacity).try_acquire_owned() {
                Ok(permit) => return self.establish(&pool, permit, deadline).await,
                Err(TryAcquireError::Closed) => {
                    return Err(PoolError::NoPool(authority.to_string()))
                }
                Err(TryAcquireError::NoPermits) => {}
            }

            debug!(authority = %authority, "Pool exhausted, waiting for a connection");
            tokio::select! {
                _ = &mut notified => continue,
                permit = Arc::clone(&pool.capacity).acquire_owned() => {
                    let permit = permit.map_err(|_| PoolError::NoPool(authority.to_string()))?;
                    return self.establish(&pool, permit, deadline).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    pool.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(authority = %authority, "Timed out waiting for a connection");
                    return Err(PoolError::Timeout {
                        authority: authority.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    /// Borrow an idle connection without waiting or connecting.
    ///
    /// Fails with [`PoolError::NoPool`] when the authority was never used.
    pub fn try_reuse(&self, authority: &Authority) -> Result<Option<ConnectionToken>, PoolError> {
        let pool = self
            .pools
            .get(authority)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| PoolError::NoPool(authority.to_string()))?;
        Ok(pool.pop_idle().map(|conn| self.issue_reused(&pool, conn)))
    }

    fn issue_reused(&self, pool: &Arc<AuthorityPool>, conn: PooledConnection) -> ConnectionToken {
        pool.stats.reused.fetch_add(1, Ordering::Relaxed);
        debug!(
            authority = %pool.authority,
            connection = %conn.id,
            use_count = conn.use_count,
            age_secs = conn.created_at.elapsed().as_secs(),
            "Reusing connection"
        );
        self.issue(pool, conn)
    }

    fn issue(&self, pool: &Arc<AuthorityPool>, conn: PooledConnection) -> ConnectionToken {
        ConnectionToken {
            mark: BorrowMark {
                owner: pool.owner,
                id: conn.id,
                home: Arc::downgrade(pool),
                redeemed: false,
            },
            conn,
            authority: pool.authority.clone(),
            borrowed_at: Instant::now(),
        }
    }

    /// Open a new connection under an acquired capacity permit
    async fn establish(
        &self,
        pool: &Arc<AuthorityPool>,
        permit: OwnedSemaphorePermit,
        deadline: tokio::time::Instant,
    ) -> Result<ConnectionToken, PoolError> {
        let authority = &pool.authority;
        let trust = if authority.is_secure() {
            Some(self.trust.get().await?)
        } else {
            None
        };

        let transport = self
            .transports
            .get(authority.scheme())
            .map_err(|source| PoolError::Connect {
                authority: authority.to_string(),
                source,
            })?;

        let options = self.config.connect_options();
        let connect = transport.connect(authority, trust.as_deref(), &options);
        let conn = match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                pool.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(authority = %authority, error = %source, "Failed to create connection");
                return Err(PoolError::Connect {
                    authority: authority.to_string(),
                    source,
                });
            }
            Err(_) => {
                pool.stats.failed.fetch_add(1, Ordering::Relaxed);
                pool.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Timeout {
                    authority: authority.to_string(),
                    waited: options.connect_timeout,
                });
            }
        };

        let conn = PooledConnection::new(conn, permit);
        pool.lock().borrowed.insert(conn.id);
        let total_created = pool.stats.created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            authority = %authority,
            connection = %conn.id,
            total_created = total_created,
            "Created new connection"
        );
        Ok(self.issue(pool, conn))
    }

    /// Return a borrowed connection for reuse.
    ///
    /// A connection that is no longer open is discarded instead. A token from
    /// another pool, or one whose connection is not currently borrowed, is a
    /// protocol violation; its connection is closed.
    pub fn restore(&self, token: ConnectionToken) -> Result<(), PoolError> {
        let ConnectionToken {
            conn,
            mut mark,
            authority,
            ..
        } = token;

        // A foreign token is released in its home pool when the mark drops
        if mark.owner != self.id {
            warn!(authority = %authority, connection = %conn.id, "Restore of a token issued by another pool");
            conn.close();
            return Err(PoolError::ProtocolViolation(format!(
                "{} was not issued by this pool",
                conn_label(&authority, mark.id)
            )));
        }

        mark.redeemed = true;
        let Some(pool) = mark.home.upgrade() else {
            debug!(authority = %authority, "Pool removed while connection was borrowed");
            conn.close();
            return Ok(());
        };

        let mut state = pool.lock();
        if !state.borrowed.remove(&conn.id) {
            drop(state);
            warn!(authority = %authority, connection = %conn.id, "Restore of a connection that is not borrowed");
            conn.close();
            return Err(PoolError::ProtocolViolation(format!(
                "{} is not borrowed",
                conn_label(&authority, mark.id)
            )));
        }

        if !conn.is_open() {
            drop(state);
            pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(authority = %authority, connection = %conn.id, "Discarding closed connection on restore");
            conn.close();
            return Ok(());
        }

        let mut conn = conn;
        conn.last_used = Instant::now();
        state.idle.push_back(IdleEntry {
            expires_at: conn.last_used + pool.max_idle_time,
            conn,
        });
        drop(state);

        pool.available.notify_one();
        Ok(())
    }

    /// Close a borrowed connection and free its capacity slot
    pub fn discard(&self, token: ConnectionToken) -> Result<(), PoolError> {
        let ConnectionToken {
            conn,
            mut mark,
            authority,
            ..
        } = token;

        if mark.owner != self.id {
            warn!(authority = %authority, connection = %conn.id, "Discard of a token issued by another pool");
            conn.close();
            return Err(PoolError::ProtocolViolation(format!(
                "{} was not issued by this pool",
                conn_label(&authority, mark.id)
            )));
        }

        mark.redeemed = true;
        if let Some(pool) = mark.home.upgrade() {
            pool.lock().borrowed.remove(&conn.id);
            pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
        warn!(authority = %authority, connection = %conn.id, "Discarding connection");
        conn.close();
        Ok(())
    }

    /// Get statistics for a specific authority pool
    pub fn stats(&self, authority: &Authority) -> Option<PoolStats> {
        self.pools.get(authority).map(|pool| pool.stats())
    }

    /// Get statistics for all authority pools
    pub fn get_all_stats(&self) -> HashMap<Authority, PoolStats> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Idle and borrowed connection ids of one authority
    pub fn snapshot(&self, authority: &Authority) -> Option<PoolSnapshot> {
        self.pools.get(authority).map(|pool| pool.snapshot())
    }

    /// Evict expired idle connections from every pool
    pub fn evict_expired(&self) -> usize {
        let pools: Vec<Arc<AuthorityPool>> =
            self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        pools.iter().map(|pool| pool.evict_expired()).sum()
    }

    /// Start background cleanup; the task ends once the pool is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let removed = pool.evict_expired();
                if removed > 0 {
                    debug!(removed = removed, "Periodic pool cleanup");
                }
            }
        })
    }

    /// Forget an authority. Borrowed connections are closed when their
    /// tokens are redeemed.
    pub fn remove_authority(&self, authority: &Authority) {
        if let Some((_, pool)) = self.pools.remove(authority) {
            let idle: Vec<_> = pool.lock().idle.drain(..).map(|e| e.conn).collect();
            for conn in idle {
                conn.close();
            }
            info!(authority = %authority, "Removed authority from pool");
        }
    }
}

fn conn_label(authority: &Authority, id: ConnectionId) -> String {
    format!("{} on {}", id, authority)
}
