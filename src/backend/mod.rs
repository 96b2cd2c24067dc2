//! The backend adaptors behind one [`Service`] surface.

mod exclusive;
mod multiplexed;
mod pooled;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::client::{with_envelope, Conn, PgClient, PgSettings, SettingsScope};
use crate::config::{self, BackendConfig, ServiceConfig};
use crate::error::Error;
use crate::listen::{self, ErrorCallback, ListenGuard, NotifyCallback};
use crate::statements::{self, StatementCache, StatementCaches};

use self::exclusive::ExclusiveBackend;
use self::multiplexed::MultiplexedBackend;
use self::pooled::PooledBackend;

enum Backend {
    Pooled(PooledBackend),
    Multiplexed(MultiplexedBackend),
    Exclusive(ExclusiveBackend),
}

/// The unified client surface over one configured backend.
///
/// A service hands out scoped [`PgClient`]s, supports `LISTEN` over a
/// dedicated connection, and owns its driver resources unless they were
/// supplied externally.
pub struct Service {
    name: String,
    backend: Backend,
    superuser: SuperuserSlot,
    released: AtomicBool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

impl Service {
    /// Creates a service from a variant-tagged configuration. No I/O
    /// happens here; configuration shortfalls surface on first use.
    pub fn new(config: ServiceConfig) -> Result<Self, Error> {
        let ServiceConfig { name, backend } = config;
        let (backend, superuser_url) = match backend {
            BackendConfig::Pooled(c) => {
                let superuser_url = c.superuser_url.clone();
                (Backend::Pooled(PooledBackend::new(c)), superuser_url)
            }
            BackendConfig::Multiplexed(c) => {
                let superuser_url = c.superuser_url.clone();
                (Backend::Multiplexed(MultiplexedBackend::new(c)), superuser_url)
            }
            BackendConfig::Exclusive(c) => {
                let superuser_url = c.superuser_url.clone();
                (Backend::Exclusive(ExclusiveBackend::new(c)), superuser_url)
            }
        };
        Ok(Self {
            name,
            backend,
            superuser: SuperuserSlot::new(superuser_url),
            released: AtomicBool::new(false),
        })
    }

    /// Wraps an externally established client in a single-connection
    /// service. [`Service::release`] leaves the client alive (only its
    /// cached statements are deallocated). Set `in_transaction` when the
    /// client is already inside a transaction, so scoped transactions use
    /// savepoints from the start.
    pub fn from_client(
        name: impl Into<String>,
        client: Arc<Client>,
        in_transaction: bool,
    ) -> Self {
        let name = name.into();
        let state_key = format!("external:{}", name);
        Self {
            name,
            backend: Backend::Exclusive(ExclusiveBackend::from_client(
                state_key,
                client,
                in_transaction,
            )),
            superuser: SuperuserSlot::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key the outer system binds this service's client under:
    /// `withPgClient` for the service named `main`, otherwise
    /// `{name}_withPgClient`.
    pub fn context_key(&self) -> String {
        if self.name == "main" {
            "withPgClient".to_owned()
        } else {
            format!("{}_withPgClient", self.name)
        }
    }

    /// The configured maximum connection count; 1 for the
    /// single-connection backend.
    pub fn pool_size(&self) -> usize {
        match &self.backend {
            Backend::Pooled(b) => b.pool_size(),
            Backend::Multiplexed(b) => b.pool_size(),
            Backend::Exclusive(b) => b.pool_size(),
        }
    }

    /// The statement-cache registry of the pooled backend.
    pub fn statement_caches(&self) -> Option<&StatementCaches> {
        match &self.backend {
            Backend::Pooled(b) => Some(b.statement_caches()),
            _ => None,
        }
    }

    /// Acquires a connection, optionally installs `settings` inside a
    /// transaction, and invokes the callback with a scoped [`PgClient`].
    /// Callback errors propagate unchanged after rollback.
    pub async fn with_pg_client<T, E, F, Fut>(
        &self,
        settings: Option<&PgSettings>,
        f: F,
    ) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(PgClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.released.load(Ordering::SeqCst) {
            return Err(E::from(Error::PoolReleased));
        }
        match &self.backend {
            Backend::Pooled(b) => b.with_client(settings, f).await,
            Backend::Multiplexed(b) => b.with_client(settings, f).await,
            Backend::Exclusive(b) => b.with_client(settings, f).await,
        }
    }

    /// Like [`Service::with_pg_client`] on a lazily-created dedicated
    /// superuser connection. Requires `superuser_url` in the
    /// configuration.
    pub async fn with_superuser_pg_client<T, E, F, Fut>(
        &self,
        settings: Option<&PgSettings>,
        f: F,
    ) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(PgClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.released.load(Ordering::SeqCst) {
            return Err(E::from(Error::PoolReleased));
        }
        let conn = self.superuser.ensure().await.map_err(E::from)?;
        with_envelope(&conn, settings, f).await
    }

    /// Starts listening on a channel over a dedicated connection.
    ///
    /// The initial connection and `LISTEN` failure surfaces here; later
    /// connection failures invoke `on_error` and reconnect with bounded
    /// backoff.
    pub async fn listen(
        &self,
        channel: &str,
        on_notify: NotifyCallback,
        on_error: ErrorCallback,
    ) -> Result<ListenGuard, Error> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::PoolReleased);
        }
        let url = match &self.backend {
            Backend::Pooled(b) => b.url(),
            Backend::Multiplexed(b) => b.url(),
            Backend::Exclusive(b) => b.url(),
        }
        .ok_or_else(|| Error::Configuration("listen requires a connection url".to_owned()))?;
        listen::spawn_listener(
            url.to_owned(),
            channel.to_owned(),
            on_notify,
            on_error,
        )
        .await
    }

    /// Terminates owned driver resources. Externally supplied clients
    /// are left alive. A second call fails with
    /// [`Error::DoubleRelease`].
    pub async fn release(&self) -> Result<(), Error> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(Error::DoubleRelease);
        }
        match &self.backend {
            Backend::Pooled(b) => b.release(),
            Backend::Multiplexed(b) => b.release().await,
            Backend::Exclusive(b) => b.release().await,
        }
        self.superuser.release().await;
        Ok(())
    }
}

/// Lazily-created dedicated superuser connection. Serialized like a
/// single-connection backend but with transaction-local settings: the
/// connection never sees foreign traffic while an envelope holds its
/// mutex.
struct SuperuserSlot {
    url: Option<String>,
    conn: Mutex<Option<Arc<Conn>>>,
}

impl SuperuserSlot {
    fn new(url: Option<String>) -> Self {
        Self {
            url,
            conn: Mutex::new(None),
        }
    }

    fn state_key(url: &str) -> String {
        format!("{}#superuser", url)
    }

    async fn ensure(&self) -> Result<Arc<Conn>, Error> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::Configuration("no superuser connection url configured".to_owned()))?;
        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(Error::Db)?;
        drop(tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: "pglink", "superuser connection error: {}", e);
            }
        }));
        let cache = Arc::new(StatementCache::new(config::statement_cache_size(None)));
        let conn = Conn::new(
            Arc::new(client),
            cache.clone(),
            SettingsScope::Local,
            true,
            false,
            true,
        );
        statements::register_keyed(Self::state_key(url), &cache, &conn);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn release(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            drop(conn);
            if let Some(url) = self.url.as_deref() {
                statements::cleanup_keyed(&Self::state_key(url)).await;
            }
        }
    }
}
