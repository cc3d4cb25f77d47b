//! Bounded pool of long-lived warehouse connections.
//!
//! Connections are created on demand without a hard cap; only the number of
//! idle connections retained between requests is bounded.

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::PoolConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opens, configures and closes warehouse sessions for a [`ConnectionPool`].
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    fn set_statement_timeout(
        &self,
        conn: &mut Self::Connection,
        timeout: Duration,
    ) -> Result<(), Self::Error>;

    fn close(&self, conn: Self::Connection) -> Result<(), Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("open warehouse connection: {0}")]
    Connect(#[source] BoxError),
    #[error("configure warehouse session: {0}")]
    Configure(#[source] BoxError),
}

#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub max_idle: usize,
    pub statement_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(cfg: &PoolConfig) -> Self {
        Self {
            max_idle: cfg.max_idle,
            statement_timeout: cfg.statement_timeout(),
            cleanup_interval: cfg.cleanup_interval(),
        }
    }
}

struct PoolInner<T> {
    idle: Vec<T>,
    last_cleanup: Instant,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    inner: Mutex<PoolInner<C::Connection>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn idle_len(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Borrow a connection; it goes back to the pool when the guard drops.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, PoolError> {
        let (reused, evicted) = {
            let mut inner = self.inner.lock();
            let evicted = if inner.last_cleanup.elapsed() > self.settings.cleanup_interval {
                self.shrink(&mut inner)
            } else {
                Vec::new()
            };
            (inner.idle.pop(), evicted)
        };
        self.close_all_quietly(evicted);

        let mut conn = match reused {
            Some(conn) => conn,
            None => {
                debug!(target: "decode::pool", "opening warehouse connection");
                self.connector
                    .connect()
                    .map_err(|err| PoolError::Connect(Box::new(err)))?
            }
        };
        if let Err(err) = self
            .connector
            .set_statement_timeout(&mut conn, self.settings.statement_timeout)
        {
            self.close_quietly(conn);
            return Err(PoolError::Configure(Box::new(err)));
        }
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Close every idle connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.inner.lock().idle.drain(..).collect();
        self.close_all_quietly(drained);
    }

    fn shrink(&self, inner: &mut PoolInner<C::Connection>) -> Vec<C::Connection> {
        let target = (self.settings.max_idle / 2).max(1);
        let mut evicted = Vec::new();
        while inner.idle.len() > target {
            if let Some(conn) = inner.idle.pop() {
                evicted.push(conn);
            }
        }
        inner.last_cleanup = Instant::now();
        if !evicted.is_empty() {
            debug!(
                target: "decode::pool",
                evicted = evicted.len(),
                retained = inner.idle.len(),
                "evicted idle warehouse connections"
            );
        }
        evicted
    }

    fn release(&self, conn: C::Connection) {
        let overflow = {
            let mut inner = self.inner.lock();
            if inner.idle.len() < self.settings.max_idle {
                inner.idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = overflow {
            self.close_quietly(conn);
        }
    }

    fn close_quietly(&self, conn: C::Connection) {
        if let Err(err) = self.connector.close(conn) {
            warn!(target: "decode::pool", error = %err, "closing warehouse connection failed");
        }
    }

    fn close_all_quietly(&self, conns: Vec<C::Connection>) {
        for conn in conns {
            self.close_quietly(conn);
        }
    }
}

/// Scoped checkout from a [`ConnectionPool`].
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C::Connection>,
}

impl<C: Connector> PooledConnection<'_, C> {
    /// Close instead of returning, for sessions left in an unknown state.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.close_quietly(conn);
        }
    }
}

impl<C: Connector> Deref for PooledConnection<'_, C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume the guard.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection taken"))
    }
}

impl<C: Connector> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled connection taken"))
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
