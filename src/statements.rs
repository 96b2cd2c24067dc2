//! LRU prepared-statement management.
//!
//! Each connection owns a [`StatementCache`] holding server-side
//! `PREPARE`d statements keyed by a digest of the query text and its
//! parameter count. The cache is bounded; inserting past the bound evicts
//! the least-recently-used statement with a `DEALLOCATE`. A statement the
//! server no longer knows (dropped by `DISCARD ALL`, a connection reset
//! behind a proxy, ...) is re-prepared transparently, once.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::{pin_mut, TryStreamExt};
use lru::LruCache;
use once_cell::sync::Lazy;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, SimpleQueryMessage};

use crate::client::{Conn, QueryResult, RowSet};
use crate::error::Error;
use crate::values::SqlValue;

/// Prefix of server-side statement names minted by this crate.
const STATEMENT_PREFIX: &str = "pglink";

/// Bound of the process-wide string-keyed state table.
const KEYED_STATE_CAP: usize = 100;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Computes the cache key for a query: the first 16 hex characters of
/// `md5(text ":" param_count)`.
fn statement_key(text: &str, param_count: usize) -> String {
    let digest = md5::compute(format!("{}:{}", text, param_count));
    let mut hex = format!("{:x}", digest);
    hex.truncate(16);
    hex
}

struct CacheInner {
    lru: LruCache<String, String>,
    counter: u64,
}

/// A bounded cache of server-side prepared statements, bound to one
/// connection. Statements prepared through it must not be executed on
/// other connections.
pub struct StatementCache {
    id: u64,
    inner: Mutex<Option<CacheInner>>,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

impl StatementCache {
    /// Creates a cache bounded at `cap` statements; `0` disables caching
    /// entirely.
    pub fn new(cap: usize) -> Self {
        let inner = NonZeroUsize::new(cap).map(|cap| CacheInner {
            lru: LruCache::new(cap),
            counter: 0,
        });
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(inner),
        }
    }

    /// Number of statements currently cached.
    pub fn size(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |inner| inner.lru.len())
    }

    /// Looks up the server-side name for `key`, touching the LRU order.
    fn lookup(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|inner| inner.lru.get(key).cloned())
    }

    /// Mints the next statement name for this cache.
    fn mint_name(&self) -> Option<String> {
        let mut guard = self.inner.lock().unwrap();
        let inner = guard.as_mut()?;
        inner.counter += 1;
        Some(format!("{}_{}_{}", STATEMENT_PREFIX, self.id, inner.counter))
    }

    /// Records a freshly prepared statement; returns the name of the
    /// statement that fell out of the cache, if any.
    fn record(&self, key: String, name: String) -> Option<String> {
        let mut guard = self.inner.lock().unwrap();
        let inner = guard.as_mut()?;
        inner
            .lru
            .push(key, name.clone())
            .and_then(|(_, old)| (old != name).then_some(old))
    }

    /// Drops the entry for `key` without touching the server.
    fn forget(&self, key: &str) {
        if let Some(inner) = self.inner.lock().unwrap().as_mut() {
            let _ = inner.lru.pop(key);
        }
    }

    /// Drops every entry without touching the server.
    pub fn clear(&self) {
        if let Some(inner) = self.inner.lock().unwrap().as_mut() {
            inner.lru.clear();
        }
    }

    fn drain_names(&self) -> Vec<String> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(inner) => {
                let names = inner.lru.iter().map(|(_, name)| name.clone()).collect();
                inner.lru.clear();
                names
            }
            None => Vec::new(),
        }
    }

    /// Executes a query, caching it as a server-side prepared statement
    /// when `name` is given and `values` is non-empty.
    ///
    /// `PREPARE` failures downgrade to direct execution; a server-side
    /// statement loss (`... does not exist`) is recovered with one retry.
    pub(crate) async fn execute(
        &self,
        client: &Client,
        name: Option<&str>,
        text: &str,
        values: &[SqlValue],
    ) -> Result<QueryResult, Error> {
        if values.is_empty() {
            return simple_query(client, text).await;
        }
        if name.is_none() || self.inner.lock().unwrap().is_none() {
            return raw_query(client, text, values).await;
        }

        let key = statement_key(text, values.len());
        let mut retried = false;
        loop {
            let prepared = match self.lookup(&key) {
                Some(existing) => existing,
                None => {
                    let Some(stmt_name) = self.mint_name() else {
                        return raw_query(client, text, values).await;
                    };
                    let prepare = format!("PREPARE {} AS {}", stmt_name, text);
                    if let Err(e) = client.batch_execute(&prepare).await {
                        tracing::warn!(
                            target: "pglink",
                            "could not prepare statement, executing directly: {}",
                            e
                        );
                        return raw_query(client, text, values).await;
                    }
                    if let Some(evicted) = self.record(key.clone(), stmt_name.clone()) {
                        deallocate(client, &evicted).await;
                    }
                    stmt_name
                }
            };

            let literals: Vec<String> = values.iter().map(SqlValue::to_literal).collect();
            let sql = format!("EXECUTE {}({})", prepared, literals.join(", "));
            match simple_query(client, &sql).await {
                Ok(result) => return Ok(result),
                Err(e) if !retried && e.is_missing_statement() => {
                    // The server lost the statement; re-prepare once.
                    self.forget(&key);
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deallocates every live statement (failures logged) and drops the
    /// cached state.
    pub async fn cleanup(&self, client: &Client) {
        for name in self.drain_names() {
            deallocate(client, &name).await;
        }
    }
}

async fn deallocate(client: &Client, name: &str) {
    if let Err(e) = client.batch_execute(&format!("DEALLOCATE {}", name)).await {
        tracing::warn!(target: "pglink", "failed to deallocate {}: {}", name, e);
    }
}

/// Executes a parameterized query over the extended protocol with
/// text-format parameters.
pub(crate) async fn raw_query(
    client: &Client,
    text: &str,
    values: &[SqlValue],
) -> Result<QueryResult, Error> {
    let params = values.iter().map(|v| v as &(dyn ToSql + Sync));
    let stream = client.query_raw(text, params).await.map_err(Error::Db)?;
    pin_mut!(stream);
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await.map_err(Error::Db)? {
        rows.push(row);
    }
    let row_count = stream.rows_affected().unwrap_or(rows.len() as u64);
    Ok(QueryResult {
        rows: RowSet::Typed(rows),
        row_count,
    })
}

/// Executes a parameter-less query over the simple protocol. Utility
/// statements (`SHOW`, `EXECUTE`, ...) always return text, so this is the
/// only protocol that reads their rows reliably.
pub(crate) async fn simple_query(client: &Client, text: &str) -> Result<QueryResult, Error> {
    let messages = client.simple_query(text).await.map_err(Error::Db)?;
    let mut rows = Vec::new();
    let mut row_count = None;
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => rows.push(row),
            SimpleQueryMessage::CommandComplete(n) => row_count = Some(n),
            _ => {}
        }
    }
    let row_count = row_count.unwrap_or(rows.len() as u64);
    Ok(QueryResult {
        rows: RowSet::Text(rows),
        row_count,
    })
}

/// Holds a weak reference to the [`StatementCache`] of every connection
/// handed out by a pool, for statistics and bulk clearing.
#[derive(Default)]
pub struct StatementCaches {
    caches: Mutex<Vec<Weak<StatementCache>>>,
}

impl std::fmt::Debug for StatementCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCaches")
            .field("size", &self.size())
            .finish()
    }
}

impl StatementCaches {
    pub(crate) fn attach(&self, cache: &Arc<StatementCache>) {
        let cache = Arc::downgrade(cache);
        self.caches.lock().unwrap().push(cache);
    }

    pub(crate) fn detach(&self, cache: &Arc<StatementCache>) {
        let cache = Arc::downgrade(cache);
        self.caches.lock().unwrap().retain(|c| !c.ptr_eq(&cache));
    }

    /// Total number of cached statements across live connections.
    pub fn size(&self) -> usize {
        let caches = self.caches.lock().unwrap();
        caches
            .iter()
            .filter_map(Weak::upgrade)
            .map(|cache| cache.size())
            .sum()
    }

    /// Drops the cached state of every live connection without touching
    /// the server.
    pub fn clear(&self) {
        let caches = self.caches.lock().unwrap();
        for cache in caches.iter() {
            if let Some(cache) = cache.upgrade() {
                cache.clear();
            }
        }
    }
}

struct KeyedState {
    cache: Arc<StatementCache>,
    conn: Weak<Conn>,
}

#[derive(Default)]
struct KeyedTable {
    order: VecDeque<String>,
    map: HashMap<String, KeyedState>,
}

/// String-keyed statement state for connections without a pool identity,
/// bounded at [`KEYED_STATE_CAP`] entries with oldest-first eviction.
static KEYED_STATES: Lazy<Mutex<KeyedTable>> = Lazy::new(Mutex::default);

/// Registers a connection's statement cache under a string key. When the
/// table exceeds its bound the oldest entry is removed and its statements
/// deallocated in the background if the connection is still alive.
pub(crate) fn register_keyed(key: String, cache: &Arc<StatementCache>, conn: &Arc<Conn>) {
    let evicted: Vec<KeyedState> = {
        let mut table = KEYED_STATES.lock().unwrap();
        let state = KeyedState {
            cache: cache.clone(),
            conn: Arc::downgrade(conn),
        };
        if table.map.insert(key.clone(), state).is_none() {
            table.order.push_back(key);
        }
        let mut evicted = Vec::new();
        while table.map.len() > KEYED_STATE_CAP {
            let Some(oldest) = table.order.pop_front() else {
                break;
            };
            if let Some(state) = table.map.remove(&oldest) {
                evicted.push(state);
            }
        }
        evicted
    };
    for state in evicted {
        spawn_cleanup(state);
    }
}

/// Deallocates and drops the state registered under `key`, if any.
pub(crate) async fn cleanup_keyed(key: &str) {
    let state = {
        let mut table = KEYED_STATES.lock().unwrap();
        table.order.retain(|k| k != key);
        table.map.remove(key)
    };
    if let Some(state) = state {
        if let Some(conn) = state.conn.upgrade() {
            state.cache.cleanup(conn.client()).await;
        }
    }
}

/// Deallocates and drops every string-keyed statement state.
pub async fn cleanup_all() {
    let states: Vec<KeyedState> = {
        let mut table = KEYED_STATES.lock().unwrap();
        table.order.clear();
        table.map.drain().map(|(_, state)| state).collect()
    };
    for state in states {
        if let Some(conn) = state.conn.upgrade() {
            state.cache.cleanup(conn.client()).await;
        }
    }
}

fn spawn_cleanup(state: KeyedState) {
    let Some(conn) = state.conn.upgrade() else {
        return;
    };
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        drop(handle.spawn(async move {
            state.cache.cleanup(conn.client()).await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_16_hex_chars_and_stable() {
        let a = statement_key("select 1", 2);
        let b = statement_key("select 1", 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_depends_on_param_count() {
        assert_ne!(statement_key("select 1", 1), statement_key("select 1", 2));
    }

    #[test]
    fn record_evicts_least_recently_used() {
        let cache = StatementCache::new(2);
        let k1 = statement_key("q1", 1);
        let k2 = statement_key("q2", 1);
        let k3 = statement_key("q3", 1);

        assert_eq!(cache.record(k1.clone(), "s1".into()), None);
        assert_eq!(cache.record(k2.clone(), "s2".into()), None);
        // Touch k1 so k2 becomes the eviction candidate.
        assert_eq!(cache.lookup(&k1).as_deref(), Some("s1"));
        assert_eq!(cache.record(k3, "s3".into()).as_deref(), Some("s2"));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.lookup(&k2), None);
    }

    #[test]
    fn record_same_key_reports_replaced_name() {
        let cache = StatementCache::new(2);
        let key = statement_key("q", 1);
        assert_eq!(cache.record(key.clone(), "a".into()), None);
        assert_eq!(cache.record(key, "b".into()).as_deref(), Some("a"));
    }

    #[test]
    fn zero_cap_disables_cache() {
        let cache = StatementCache::new(0);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.record("k".into(), "s".into()), None);
        assert_eq!(cache.lookup("k"), None);
    }

    #[test]
    fn minted_names_are_unique_per_cache() {
        let cache = StatementCache::new(4);
        let a = cache.mint_name().unwrap();
        let b = cache.mint_name().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("pglink_"));
    }
}
