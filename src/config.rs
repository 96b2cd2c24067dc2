//! Configuration used for [`Service`](crate::Service) creation.

use serde::Deserialize;

/// Environment variable sizing the prepared-statement cache of each
/// connection. `0` disables prepared-statement caching.
pub const PREPARED_STATEMENT_CACHE_SIZE_ENV: &str = "PG_PREPARED_STATEMENT_CACHE_SIZE";

pub(crate) const DEFAULT_STATEMENT_CACHE_SIZE: usize = 100;
pub(crate) const DEFAULT_POOL_SIZE: usize = 10;
pub(crate) const DEFAULT_MULTIPLEXED_CONNECTIONS: usize = 10;

/// Top-level service configuration: a name plus the backend selection.
///
/// With the `serde` derive this can be read from any configuration tree;
/// the backend enum is tagged by a `kind` field:
///
/// ```json
/// { "name": "main", "backend": { "kind": "pooled", "url": "postgres://..." } }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfig {
    /// Service name. The default name is `main`; it determines the
    /// context key the outer system binds the client under.
    #[serde(default = "default_name")]
    pub name: String,
    /// Backend selection and its settings.
    pub backend: BackendConfig,
}

fn default_name() -> String {
    "main".to_owned()
}

impl ServiceConfig {
    /// A pooled backend connecting to `url`, with default settings.
    pub fn pooled(url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            backend: BackendConfig::Pooled(PooledConfig {
                url: Some(url.into()),
                ..Default::default()
            }),
        }
    }

    /// A multiplexed backend connecting to `url`, with default settings.
    pub fn multiplexed(url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            backend: BackendConfig::Multiplexed(MultiplexedConfig {
                url: Some(url.into()),
                ..Default::default()
            }),
        }
    }

    /// A single-connection backend connecting to `url`.
    pub fn exclusive(url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            backend: BackendConfig::Exclusive(ExclusiveConfig {
                url: Some(url.into()),
                ..Default::default()
            }),
        }
    }

    /// Replaces the service name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Variant-tagged backend configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Bounded multi-connection pool; one connection per client scope.
    Pooled(PooledConfig),
    /// One driver handle multiplexing a fixed set of connections.
    Multiplexed(MultiplexedConfig),
    /// One long-lived connection with session-scoped settings.
    Exclusive(ExclusiveConfig),
}

/// Configuration of the pooled backend.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PooledConfig {
    /// Connection URL. Required before the first client is requested.
    pub url: Option<String>,
    /// Connection URL for [`Service::with_superuser_pg_client`](crate::Service::with_superuser_pg_client).
    pub superuser_url: Option<String>,
    /// Maximum number of pooled connections (default 10).
    pub max_size: Option<usize>,
    /// Per-connection prepared-statement cache size. Defaults to the
    /// [`PREPARED_STATEMENT_CACHE_SIZE_ENV`] environment variable, then
    /// to 100.
    pub statement_cache_size: Option<usize>,
}

/// Configuration of the multiplexed backend.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MultiplexedConfig {
    /// Connection URL. Required before the first client is requested.
    pub url: Option<String>,
    /// Connection URL for superuser clients.
    pub superuser_url: Option<String>,
    /// Number of multiplexed connections (default 10).
    pub connections: Option<usize>,
    /// Per-connection prepared-statement cache size; see
    /// [`PooledConfig::statement_cache_size`].
    pub statement_cache_size: Option<usize>,
}

/// Configuration of the single-connection backend.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExclusiveConfig {
    /// Connection URL. Required unless a client is supplied through
    /// [`Service::from_client`](crate::Service::from_client).
    pub url: Option<String>,
    /// Connection URL for superuser clients.
    pub superuser_url: Option<String>,
    /// Prepared-statement cache size; see
    /// [`PooledConfig::statement_cache_size`].
    pub statement_cache_size: Option<usize>,
}

/// Resolves the statement cache size from an explicit setting, the
/// environment, or the default.
pub(crate) fn statement_cache_size(explicit: Option<usize>) -> usize {
    if let Some(size) = explicit {
        return size;
    }
    match std::env::var(PREPARED_STATEMENT_CACHE_SIZE_ENV) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(size) => size,
            Err(_) => {
                tracing::warn!(
                    target: "pglink",
                    "ignoring invalid {}={:?}",
                    PREPARED_STATEMENT_CACHE_SIZE_ENV,
                    raw
                );
                DEFAULT_STATEMENT_CACHE_SIZE
            }
        },
        Err(_) => DEFAULT_STATEMENT_CACHE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_is_variant_tagged() {
        let raw = r#"{
            "name": "geo",
            "backend": { "kind": "pooled", "url": "postgres://localhost/app", "max_size": 4 }
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.name, "geo");
        match config.backend {
            BackendConfig::Pooled(c) => {
                assert_eq!(c.url.as_deref(), Some("postgres://localhost/app"));
                assert_eq!(c.max_size, Some(4));
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn name_defaults_to_main() {
        let raw = r#"{ "backend": { "kind": "exclusive" } }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.name, "main");
    }

    #[test]
    fn explicit_cache_size_wins() {
        assert_eq!(statement_cache_size(Some(0)), 0);
        assert_eq!(statement_cache_size(Some(7)), 7);
    }
}
