//! Connection pool.
//!
//! Idle connections are reused ahead of fresh dials; the number of
//! connections handed out at once is bounded by a semaphore, so checkouts
//! beyond the bound queue in arrival order until a release frees capacity.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::connection::{Connectiable, PgConnection};
use crate::error::{Error, Result};
use crate::native::{Dialer, WireDialer};
use crate::provider::{ConnectionInfo, ConnectionProvider};
use crate::reactor::{Completion, Reactor};
use crate::socket::{Socket, SocketAdapter};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection string, `key=value` or URI
    pub conninfo: String,
    /// Connections dialed up front by [`Pool::connect`]
    pub min_connections: u32,
    /// Connections handed out at once
    pub max_connections: u32,
    /// Limit on a single dial
    pub connect_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(conninfo: &str) -> Self {
        Self {
            conninfo: conninfo.to_string(),
            min_connections: 1,
            max_connections: 10,
            connect_timeout: None,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Snapshot of the pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub outstanding: usize,
    pub max: usize,
}

// ============================================================================
// Pool Inner
// ============================================================================

type PoolConn<D, S> = PgConnection<<D as Dialer>::Handle, S>;

struct PoolInner<D: Dialer, S: SocketAdapter> {
    config: PoolConfig,
    source: ConnectionInfo<D, S>,
    state: Mutex<PoolState<D, S>>,
    semaphore: Arc<Semaphore>,
}

struct PoolState<D: Dialer, S: SocketAdapter> {
    idle: Vec<PoolConn<D, S>>,
    outstanding: usize,
    closed: bool,
}

impl<D: Dialer, S: SocketAdapter> PoolInner<D, S> {
    /// Most recently released good connection; bad ones met on the way are
    /// discarded.
    fn take_idle(&self) -> Option<PoolConn<D, S>> {
        loop {
            let conn = self.state.lock().idle.pop()?;
            if conn.is_good() {
                return Some(conn);
            }
            tracing::warn!(
                error = conn.error_message(),
                "discarding bad idle connection"
            );
        }
    }

    async fn dial(&self) -> Result<PoolConn<D, S>> {
        tracing::debug!(conninfo = self.source.redacted(), "pool dialing");
        match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.source.connect())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.source.connect().await,
        }
    }

    /// Return a checked-out connection, keeping it when it is still good.
    fn put_back(&self, conn: PoolConn<D, S>) {
        let rejected = {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.closed || conn.is_bad() {
                Some(conn)
            } else {
                state.idle.push(conn);
                None
            }
        };
        if let Some(conn) = rejected {
            if conn.is_bad() {
                tracing::warn!(
                    error = conn.error_message(),
                    "discarding bad connection on release"
                );
            } else {
                tracing::debug!("pool closed, dropping released connection");
            }
        }
    }

    fn forget(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Dropping it returns the connection to the pool, or discards it when bad.
pub struct PooledConnection<D: Dialer = WireDialer, S: SocketAdapter = Socket> {
    // None only while being returned
    conn: Option<PoolConn<D, S>>,
    pool: Arc<PoolInner<D, S>>,
    _permit: OwnedSemaphorePermit,
}

impl<D: Dialer, S: SocketAdapter> PooledConnection<D, S> {
    /// Discard the connection instead of returning it.
    pub fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.forget();
            tracing::debug!("pooled connection invalidated");
            drop(conn);
        }
    }

    /// Take the connection out of the pool's accounting for good.
    ///
    /// The capacity it held becomes available to other checkouts.
    pub fn detach(mut self) -> PoolConn<D, S> {
        self.pool.forget();
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("pooled connection emptied before drop"),
        }
    }
}

impl<D: Dialer, S: SocketAdapter> Connectiable for PooledConnection<D, S> {
    type Target = PoolConn<D, S>;

    fn connection(&self) -> Option<&Self::Target> {
        self.conn.as_ref()
    }

    fn connection_mut(&mut self) -> Option<&mut Self::Target> {
        self.conn.as_mut()
    }
}

impl<D: Dialer, S: SocketAdapter> Drop for PooledConnection<D, S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

impl<D: Dialer, S: SocketAdapter> std::fmt::Debug for PooledConnection<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("good", &self.is_good())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of PostgreSQL connections.
pub struct Pool<D: Dialer = WireDialer, S: SocketAdapter = Socket> {
    inner: Arc<PoolInner<D, S>>,
}

impl<D: Dialer, S: SocketAdapter> Clone for Pool<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool {
    /// Create a pool on the current reactor and dial `min_connections`.
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        let source = ConnectionInfo::new(config.conninfo.clone(), Reactor::current());
        Self::with_source(source, config).await
    }
}

impl<D: Dialer, S: SocketAdapter> Pool<D, S> {
    /// Create a pool that dials through `source`.
    ///
    /// The source's connection string is used; `config.conninfo` is not.
    pub async fn with_source(source: ConnectionInfo<D, S>, config: PoolConfig) -> Result<Self> {
        let max = config.max_connections.max(1);
        let min = config.min_connections.min(max);
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(max as usize)),
            config,
            source,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                outstanding: 0,
                closed: false,
            }),
        });

        for _ in 0..min {
            let conn = inner.dial().await?;
            inner.state.lock().idle.push(conn);
        }
        tracing::debug!(min, max, "pool ready");

        Ok(Self { inner })
    }

    /// Check out a connection, waiting for capacity when all are in use.
    pub async fn acquire(&self) -> Result<PooledConnection<D, S>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        let conn = match self.inner.take_idle() {
            Some(conn) => conn,
            None => self.inner.dial().await?,
        };

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            state.outstanding += 1;
        }

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Check out a connection and hand it to `completion`.
    pub fn checkout<F>(&self, completion: Completion<F>)
    where
        F: FnOnce(Result<PooledConnection<D, S>>) + Send + 'static,
    {
        let pool = self.clone();
        self.inner.source.reactor().spawn(async move {
            let result = pool.acquire().await;
            completion.complete(result);
        });
    }

    /// Return `conn` now rather than when it is dropped.
    pub fn release(&self, conn: PooledConnection<D, S>) {
        debug_assert!(Arc::ptr_eq(&self.inner, &conn.pool));
        drop(conn);
    }

    /// Reject pending and future checkouts and drop idle connections.
    ///
    /// Connections still checked out are dropped when released.
    pub fn close(&self) {
        self.inner.semaphore.close();
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        tracing::debug!(dropped = idle.len(), "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            outstanding: state.outstanding,
            max: self.inner.config.max_connections.max(1) as usize,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<D: Dialer, S: SocketAdapter> std::fmt::Debug for Pool<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("source", &self.inner.source)
            .field("status", &self.status())
            .finish()
    }
}

impl<D: Dialer, S: SocketAdapter> ConnectionProvider for Pool<D, S> {
    type Connection = PooledConnection<D, S>;

    fn async_get_connection<F>(self, completion: Completion<F>)
    where
        F: FnOnce(Result<Self::Connection>) + Send + 'static,
    {
        self.checkout(completion);
    }
}
