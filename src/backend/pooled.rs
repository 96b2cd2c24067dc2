//! The pooled backend: a bounded connection pool, one connection per
//! client scope.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::NoTls;

use crate::client::{with_envelope, Conn, PgClient, PgSettings, SettingsScope};
use crate::config::{self, PooledConfig};
use crate::error::Error;
use crate::pool::{Manager, Pool, PoolError, RecycleError};
use crate::statements::{StatementCache, StatementCaches};

pub(crate) struct PooledBackend {
    pool: Pool<ConnManager>,
    url: Option<String>,
    max_size: usize,
}

impl PooledBackend {
    pub(crate) fn new(config: PooledConfig) -> Self {
        let max_size = config.max_size.unwrap_or(config::DEFAULT_POOL_SIZE);
        let manager = ConnManager {
            url: config.url.clone(),
            cache_size: config::statement_cache_size(config.statement_cache_size),
            caches: StatementCaches::default(),
        };
        Self {
            pool: Pool::new(manager, max_size),
            url: config.url,
            max_size,
        }
    }

    pub(crate) fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn statement_caches(&self) -> &StatementCaches {
        &self.pool.manager().caches
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
        let obj = self
            .pool
            .get()
            .await
            .map_err(|e| E::from(flatten_pool_error(e)))?;
        // The checkout is held for the duration of the envelope and
        // returned (not closed) when `obj` drops.
        with_envelope(&obj, settings, f).await
    }

    pub(crate) fn release(&self) {
        self.pool.close();
    }
}

fn flatten_pool_error(e: PoolError<Error>) -> Error {
    match e {
        PoolError::Closed => Error::PoolReleased,
        PoolError::Backend(e) => e,
    }
}

struct ConnManager {
    url: Option<String>,
    cache_size: usize,
    caches: StatementCaches,
}

#[async_trait]
impl Manager for ConnManager {
    type Type = Arc<Conn>;
    type Error = Error;

    async fn create(&self) -> Result<Arc<Conn>, Error> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::Configuration("no connection url configured".to_owned()))?;
        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(Error::Db)?;
        drop(tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: "pglink", "connection error: {}", e);
            }
        }));
        let statements = Arc::new(StatementCache::new(self.cache_size));
        self.caches.attach(&statements);
        Ok(Conn::new(
            Arc::new(client),
            statements,
            SettingsScope::Local,
            false,
            false,
            false,
        ))
    }

    async fn recycle(&self, conn: &mut Arc<Conn>) -> Result<(), RecycleError<Error>> {
        if conn.is_closed() {
            tracing::info!(target: "pglink", "connection could not be recycled: connection closed");
            return Err(RecycleError::Message("connection closed".to_owned()));
        }
        Ok(())
    }

    fn detach(&self, conn: &mut Arc<Conn>) {
        self.caches.detach(conn.statements());
    }
}
