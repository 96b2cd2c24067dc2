//! The multiplexed backend: one driver handle owning a fixed set of
//! connections. Plain work round-robins across them; settings-scoped
//! work serializes through a pool-wide queue because settings are
//! transaction-local and must not interleave with foreign queries on the
//! same connection.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::NoTls;

use crate::client::{with_envelope, Conn, PgClient, PgSettings, SettingsScope};
use crate::config::{self, MultiplexedConfig};
use crate::error::Error;
use crate::statements::{self, StatementCache};

enum ConnSlot {
    Unconnected,
    Connected(Vec<Arc<Conn>>),
    Released,
}

pub(crate) struct MultiplexedBackend {
    url: Option<String>,
    connections: usize,
    cache_size: usize,
    conns: Mutex<ConnSlot>,
    /// Pool-wide serialization of settings-scoped work.
    queue: Mutex<()>,
    next: AtomicUsize,
}

impl MultiplexedBackend {
    pub(crate) fn new(config: MultiplexedConfig) -> Self {
        Self {
            url: config.url,
            connections: config
                .connections
                .unwrap_or(config::DEFAULT_MULTIPLEXED_CONNECTIONS)
                .max(1),
            cache_size: config::statement_cache_size(config.statement_cache_size),
            conns: Mutex::new(ConnSlot::Unconnected),
            queue: Mutex::new(()),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.connections
    }

    fn keyed_state_key(url: &str, index: usize) -> String {
        format!("{}#{}", url, index)
    }

    async fn conns(&self) -> Result<Vec<Arc<Conn>>, Error> {
        let mut slot = self.conns.lock().await;
        match &*slot {
            ConnSlot::Connected(conns) => Ok(conns.clone()),
            ConnSlot::Released => Err(Error::PoolReleased),
            ConnSlot::Unconnected => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::Configuration("no connection url configured".to_owned()))?;
                let mut conns = Vec::with_capacity(self.connections);
                for index in 0..self.connections {
                    let (client, connection) =
                        tokio_postgres::connect(url, NoTls).await.map_err(Error::Db)?;
                    drop(tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::warn!(target: "pglink", "connection error: {}", e);
                        }
                    }));
                    let cache = Arc::new(StatementCache::new(self.cache_size));
                    let conn = Conn::new(
                        Arc::new(client),
                        cache.clone(),
                        SettingsScope::Local,
                        false,
                        false,
                        false,
                    );
                    statements::register_keyed(Self::keyed_state_key(url, index), &cache, &conn);
                    conns.push(conn);
                }
                *slot = ConnSlot::Connected(conns.clone());
                Ok(conns)
            }
        }
    }

    pub(crate) async fn with_client<T, E, F, Fut>(
        &self,
        settings: Option<&PgSettings>,
        f: F,
    ) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(PgClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let conns = self.conns().await.map_err(E::from)?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % conns.len();
        let conn = &conns[index];
        let _queue = match settings.filter(|s| !s.is_empty()) {
            Some(_) => Some(self.queue.lock().await),
            None => None,
        };
        with_envelope(conn, settings, f).await
    }

    pub(crate) async fn release(&self) {
        let mut slot = self.conns.lock().await;
        if let ConnSlot::Connected(conns) = std::mem::replace(&mut *slot, ConnSlot::Released) {
            drop(slot);
            // Dropping the connections closes them; the registry entries
            // are removed without deallocation round-trips.
            drop(conns);
            if let Some(url) = self.url.as_deref() {
                for index in 0..self.connections {
                    statements::cleanup_keyed(&Self::keyed_state_key(url, index)).await;
                }
            }
        }
    }
}
