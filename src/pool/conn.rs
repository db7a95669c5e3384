//! A pooled backend connection and its lease guard.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::OwnedSemaphorePermit;
use tokio_postgres::NoTls;

use crate::config::Postgres;
use crate::errors::Error;

use super::PoolShared;

/// The connection proper, as stored in the idle stack.
#[derive(Debug)]
pub(super) struct ConnInner {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
    /// Session parameters last applied on this connection, diffed against
    /// the leasing session's desired set (reconciliation prologue).
    pub(super) applied: HashMap<String, String>,
    pub(super) created_at: Instant,
    pub(super) last_used: Instant,
}

impl ConnInner {
    /// Broken connections are detected lazily at lease time.
    pub(super) fn is_usable(&self) -> bool {
        !self.client.is_closed()
    }

    pub(super) fn shutdown(self) {
        // Dropping the client closes the socket; the driver task ends with it.
        self.driver.abort();
    }
}

pub(super) async fn connect_backend(config: &Postgres) -> Result<ConnInner, Error> {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .user(&config.user)
        .password(&config.password)
        .dbname(&config.database)
        .application_name("aproxy")
        .connect_timeout(Duration::from_millis(config.connect_timeout));
    pg_config.ssl_mode(match config.sslmode.as_str() {
        "require" => tokio_postgres::config::SslMode::Require,
        "prefer" => tokio_postgres::config::SslMode::Prefer,
        _ => tokio_postgres::config::SslMode::Disable,
    });

    let (client, connection) = pg_config.connect(NoTls).await?;
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("backend connection ended: {err}");
        }
    });

    let now = Instant::now();
    Ok(ConnInner {
        client,
        driver,
        applied: HashMap::new(),
        created_at: now,
        last_used: now,
    })
}

/// A leased connection. Returns to the pool on drop; discarded instead when
/// marked broken or when the backend closed underneath us.
#[derive(Debug)]
pub struct PooledConn {
    inner: Option<ConnInner>,
    shared: Weak<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
    /// Atomic so an error observed while a row stream still borrows the
    /// client can poison the lease through a shared reference.
    broken: AtomicBool,
}

impl PooledConn {
    pub(super) fn new(
        mut inner: ConnInner,
        shared: &Arc<PoolShared>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConn {
        inner.last_used = Instant::now();
        PooledConn {
            inner: Some(inner),
            shared: Arc::downgrade(shared),
            permit: Some(permit),
            broken: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.inner.as_ref().expect("lease is live").client
    }

    /// A side-channel cancel handle for the in-flight backend operation.
    pub fn cancel_token(&self) -> tokio_postgres::CancelToken {
        self.client().cancel_token()
    }

    /// Fatal backend failure: the connection will be discarded, not pooled.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
            || self.inner.as_ref().is_none_or(|i| !i.is_usable())
    }

    pub fn age(&self) -> Duration {
        self.inner
            .as_ref()
            .map(|i| i.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Last-applied session parameters, for the reconciliation prologue.
    pub fn applied_parameters(&mut self) -> &mut HashMap<String, String> {
        &mut self.inner.as_mut().expect("lease is live").applied
    }
}

impl Deref for PooledConn {
    type Target = tokio_postgres::Client;
    fn deref(&self) -> &Self::Target {
        self.client()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let broken = self.broken.load(Ordering::Relaxed);
        if let Some(mut inner) = self.inner.take() {
            inner.last_used = Instant::now();
            if let Some(shared) = self.shared.upgrade() {
                shared.release(inner, broken);
            } else {
                inner.shutdown();
            }
        }
        // The permit drops after the connection is back on the stack, so a
        // woken waiter always finds either an idle slot or headroom.
        self.permit.take();
    }
}
