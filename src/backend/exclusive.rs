//! The single-connection backend: one long-lived connection shared by
//! every client scope. Settings-scoped work runs under the
//! connection-wide mutex, applies settings session-level and restores
//! the previous values on exit.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::client::{with_envelope, Conn, PgClient, PgSettings, SettingsScope};
use crate::config::{self, ExclusiveConfig};
use crate::error::Error;
use crate::statements::{self, StatementCache};

enum Slot {
    Unconnected,
    /// An externally supplied client, wrapped lazily on first use.
    Provided { client: Arc<Client>, in_transaction: bool },
    Connected(Arc<Conn>),
    Released,
}

pub(crate) struct ExclusiveBackend {
    url: Option<String>,
    cache_size: usize,
    /// Whether `release` must close the connection. External clients are
    /// left alive.
    owned: bool,
    /// Key of this connection's statement state in the global table.
    state_key: String,
    slot: Mutex<Slot>,
}

impl ExclusiveBackend {
    pub(crate) fn new(config: ExclusiveConfig) -> Self {
        let state_key = config
            .url
            .clone()
            .unwrap_or_else(|| "exclusive".to_owned());
        Self {
            url: config.url,
            cache_size: config::statement_cache_size(config.statement_cache_size),
            owned: true,
            state_key,
            slot: Mutex::new(Slot::Unconnected),
        }
    }

    pub(crate) fn from_client(
        state_key: String,
        client: Arc<Client>,
        in_transaction: bool,
    ) -> Self {
        Self {
            url: None,
            cache_size: config::statement_cache_size(None),
            owned: false,
            state_key,
            slot: Mutex::new(Slot::Provided {
                client,
                in_transaction,
            }),
        }
    }

    pub(crate) fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub(crate) fn pool_size(&self) -> usize {
        1
    }

    fn wrap(&self, client: Arc<Client>, pre_existing: bool) -> Arc<Conn> {
        let cache = Arc::new(StatementCache::new(self.cache_size));
        let conn = Conn::new(
            client,
            cache.clone(),
            SettingsScope::Session,
            true,
            pre_existing,
            true,
        );
        statements::register_keyed(self.state_key.clone(), &cache, &conn);
        conn
    }

    async fn conn(&self) -> Result<Arc<Conn>, Error> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Connected(conn) => Ok(conn.clone()),
            Slot::Released => Err(Error::PoolReleased),
            Slot::Provided {
                client,
                in_transaction,
            } => {
                let conn = self.wrap(client.clone(), *in_transaction);
                *slot = Slot::Connected(conn.clone());
                Ok(conn)
            }
            Slot::Unconnected => {
                let url = self.url.as_deref().ok_or_else(|| {
                    Error::Configuration(
                        "no connection url or external client configured".to_owned(),
                    )
                })?;
                let (client, connection) =
                    tokio_postgres::connect(url, NoTls).await.map_err(Error::Db)?;
                drop(tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::warn!(target: "pglink", "connection error: {}", e);
                    }
                }));
                let conn = self.wrap(Arc::new(client), false);
                *slot = Slot::Connected(conn.clone());
                Ok(conn)
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
        let conn = self.conn().await.map_err(E::from)?;
        with_envelope(&conn, settings, f).await
    }

    pub(crate) async fn release(&self) {
        let mut slot = self.slot.lock().await;
        let previous = std::mem::replace(&mut *slot, Slot::Released);
        drop(slot);
        if let Slot::Connected(conn) = previous {
            if self.owned {
                // Closing the connection discards its statements; no
                // deallocation round-trips needed.
                drop(conn);
                statements::cleanup_keyed(&self.state_key).await;
            } else {
                // The external client stays alive, so its cached
                // statements are deallocated explicitly.
                statements::cleanup_keyed(&self.state_key).await;
                drop(conn);
            }
        }
    }
}
