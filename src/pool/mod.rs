//! PostgreSQL connection pool.
//!
//! A fixed-capacity pool over `tokio_postgres` clients. The idle set is a
//! LIFO stack; waiters queue on a semaphore with a configurable timeout.
//! Leases are guard objects that return the connection on drop, so every
//! exit path releases. Pinning (session and transaction modes) is the
//! handler holding its lease across commands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::{get_config, ConnectionMode, Postgres};
use crate::errors::Error;
use crate::metrics;

mod conn;

pub use conn::PooledConn;
use conn::ConnInner;

/// The pool, globally available once the server has started.
static POOL: Lazy<ArcSwapOption<Pool>> = Lazy::new(|| ArcSwapOption::from(None));

/// Why a lease is being taken; used for log lines and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireReason {
    AutocommitStmt,
    BeginTx,
    InTxStmt,
    SessionPin,
    SchemaFill,
    Health,
}

impl AcquireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireReason::AutocommitStmt => "autocommit-stmt",
            AcquireReason::BeginTx => "begin-tx",
            AcquireReason::InTxStmt => "in-tx-stmt",
            AcquireReason::SessionPin => "session-pin",
            AcquireReason::SchemaFill => "schema-fill",
            AcquireReason::Health => "health",
        }
    }
}

pub async fn init_from_config() -> Result<(), Error> {
    let config = get_config();
    let pool = Pool::new(config.postgres.clone());
    POOL.store(Some(Arc::new(pool)));
    Ok(())
}

/// The pool is installed before the listener accepts anything.
pub fn get_pool() -> Arc<Pool> {
    POOL.load_full().expect("pool is initialized at startup")
}

pub fn try_get_pool() -> Option<Arc<Pool>> {
    POOL.load_full()
}

struct PoolShared {
    config: Postgres,
    /// Idle connections; pushed and popped at the back (LIFO).
    idle: Mutex<Vec<ConnInner>>,
    /// Live connections, idle plus leased.
    size: Mutex<usize>,
    semaphore: Arc<Semaphore>,
}

pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(config: Postgres) -> Pool {
        let max = config.max_pool_size;
        Pool {
            shared: Arc::new(PoolShared {
                config,
                idle: Mutex::new(Vec::with_capacity(max)),
                size: Mutex::new(0),
                semaphore: Arc::new(Semaphore::new(max)),
            }),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.shared.config.connection_mode
    }

    /// Lease a connection. Waits up to the configured acquire timeout when
    /// the pool is saturated, then fails with the pool-exhausted error.
    pub async fn acquire(&self, session_id: u64, reason: AcquireReason) -> Result<PooledConn, Error> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.shared.config.acquire_timeout);

        metrics::POOL_WAITS.inc();
        let permit = match tokio::time::timeout(
            timeout,
            self.shared.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                metrics::POOL_EXHAUSTED.inc();
                warn!(
                    "pool exhausted: session {session_id} waited {}ms ({})",
                    started.elapsed().as_millis(),
                    reason.as_str()
                );
                return Err(Error::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        // Holding a permit guarantees leased < max, so an empty idle stack
        // always leaves room to open a fresh connection.
        let mut first_error = None;
        loop {
            let candidate = self.shared.idle.lock().pop();
            match candidate {
                Some(inner) if inner.is_usable() => {
                    metrics::POOL_LEASES
                        .with_label_values(&[reason.as_str()])
                        .inc();
                    return Ok(PooledConn::new(inner, &self.shared, permit));
                }
                Some(inner) => {
                    debug!("discarding stale backend connection");
                    self.discard(inner);
                    continue;
                }
                None => {
                    match self.connect().await {
                        Ok(inner) => {
                            metrics::POOL_LEASES
                                .with_label_values(&[reason.as_str()])
                                .inc();
                            return Ok(PooledConn::new(inner, &self.shared, permit));
                        }
                        // One retry with a fresh connection, then surface.
                        Err(err) if first_error.is_none() => {
                            warn!("backend connect failed, retrying once: {err}");
                            first_error = Some(err);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<ConnInner, Error> {
        let config = &self.shared.config;
        {
            let mut size = self.shared.size.lock();
            *size += 1;
            info!(
                "creating a new backend connection to {}:{} [#{}]",
                config.host, config.port, *size
            );
        }
        match conn::connect_backend(config).await {
            Ok(inner) => Ok(inner),
            Err(err) => {
                *self.shared.size.lock() -= 1;
                Err(err)
            }
        }
    }

    fn discard(&self, inner: ConnInner) {
        *self.shared.size.lock() -= 1;
        inner.shutdown();
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), Error> {
        let conn = self.acquire(0, AcquireReason::Health).await?;
        match conn.client().simple_query("SELECT 1").await {
            Ok(_) => Ok(()),
            Err(err) => {
                conn.mark_broken();
                Err(Error::from(err))
            }
        }
    }

    /// (total live, idle) for metrics.
    pub fn status(&self) -> (usize, usize) {
        let size = *self.shared.size.lock();
        let idle = self.shared.idle.lock().len();
        (size, idle)
    }

    pub fn close(&self) {
        let mut idle = self.shared.idle.lock();
        let drained = idle.drain(..).collect::<Vec<_>>();
        drop(idle);
        let mut size = self.shared.size.lock();
        *size = size.saturating_sub(drained.len());
        drop(size);
        for inner in drained {
            inner.shutdown();
        }
        self.shared.semaphore.close();
    }
}

impl PoolShared {
    /// Called from the lease guard on drop.
    fn release(&self, inner: ConnInner, broken: bool) {
        if broken || !inner.is_usable() {
            metrics::POOL_DISCARDS.inc();
            *self.size.lock() -= 1;
            inner.shutdown();
        } else {
            metrics::POOL_RELEASES.inc();
            self.idle.lock().push(inner);
        }
        // The caller's permit drops right after, waking one waiter.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reason_labels() {
        assert_eq!(AcquireReason::AutocommitStmt.as_str(), "autocommit-stmt");
        assert_eq!(AcquireReason::BeginTx.as_str(), "begin-tx");
        assert_eq!(AcquireReason::SessionPin.as_str(), "session-pin");
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let mut config = Postgres::default();
        config.max_pool_size = 1;
        config.acquire_timeout = 50;
        let pool = Pool::new(config);

        // Take the only permit directly; acquire must then time out
        // without ever dialing the backend.
        let _permit = pool.shared.semaphore.clone().acquire_owned().await.unwrap();
        let err = pool.acquire(1, AcquireReason::AutocommitStmt).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
    }
}
