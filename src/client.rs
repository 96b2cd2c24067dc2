//! Client handles, the session-settings envelope and nested transactions.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::{Client, Row, SimpleQueryRow};

use crate::error::{Error, TxOp};
use crate::statements::{raw_query, StatementCache};
use crate::values::{escape_ident, SqlValue};

/// Session settings applied for the duration of a `with_pg_client` scope,
/// as ordered `(key, value)` pairs.
pub type PgSettings = Vec<(String, String)>;

/// The rows of a query.
///
/// Parameter-less queries run over the simple protocol (required for
/// utility statements such as `SHOW` and `EXECUTE`, which always return
/// text) and yield [`RowSet::Text`]; parameterized queries run over the
/// extended protocol and yield [`RowSet::Typed`].
pub enum RowSet {
    /// Binary-format rows from the extended protocol.
    Typed(Vec<Row>),
    /// Text-format rows from the simple protocol.
    Text(Vec<SimpleQueryRow>),
}

impl RowSet {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Typed(rows) => rows.len(),
            Self::Text(rows) => rows.len(),
        }
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The typed rows, if this result came from the extended protocol.
    pub fn typed(&self) -> Option<&[Row]> {
        match self {
            Self::Typed(rows) => Some(rows),
            Self::Text(_) => None,
        }
    }

    /// The text rows, if this result came from the simple protocol.
    pub fn text(&self) -> Option<&[SimpleQueryRow]> {
        match self {
            Self::Text(rows) => Some(rows),
            Self::Typed(_) => None,
        }
    }
}

impl std::fmt::Debug for RowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Typed(rows) => f.debug_tuple("Typed").field(&rows.len()).finish(),
            Self::Text(rows) => f.debug_tuple("Text").field(&rows.len()).finish(),
        }
    }
}

/// The rows of a query together with the server-reported row count.
#[derive(Debug)]
pub struct QueryResult {
    /// The returned rows.
    pub rows: RowSet,
    /// Rows affected, or the row count for row-returning statements.
    pub row_count: u64,
}

/// How session settings are applied on a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SettingsScope {
    /// `set_config(.., true)` inside the envelope transaction; the
    /// transaction boundary restores previous values.
    Local,
    /// `set_config(.., false)` on a long-lived connection; previous
    /// values are captured up front and restored on exit.
    Session,
}

/// Shared per-connection state: the driver client, its statement cache
/// and the connection-wide coordination handles.
pub(crate) struct Conn {
    client: Arc<Client>,
    statements: Arc<StatementCache>,
    scope: SettingsScope,
    /// Exclusive-execution primitive of single-connection backends; held
    /// across settings-scoped envelopes and top-level transactions.
    exclusive: Option<Mutex<()>>,
    /// The connection was already inside a transaction when supplied.
    pre_existing: bool,
    /// Clients on this connection serialize every query.
    always_queue: bool,
}

impl Conn {
    pub(crate) fn new(
        client: Arc<Client>,
        statements: Arc<StatementCache>,
        scope: SettingsScope,
        exclusive: bool,
        pre_existing: bool,
        always_queue: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            statements,
            scope,
            exclusive: exclusive.then(|| Mutex::new(())),
            pre_existing,
            always_queue,
        })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn statements(&self) -> &Arc<StatementCache> {
        &self.statements
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

/// The per-client serialization queue: a slot that operations occupy in
/// FIFO order.
struct OpQueue {
    lock: Arc<Mutex<()>>,
}

impl OpQueue {
    fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Occupies the slot for the duration of the returned guard.
    async fn occupy(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    /// Waits for the slot to settle. When `always` is set the slot stays
    /// occupied for the duration of the returned guard; otherwise the
    /// operation runs unserialized once any in-flight slot has settled.
    async fn settle(&self, always: bool) -> Option<OwnedMutexGuard<()>> {
        if always {
            return Some(self.occupy().await);
        }
        if self.lock.try_lock().is_err() {
            drop(self.lock.clone().lock_owned().await);
        }
        None
    }
}

/// A scoped handle to a single logical connection, valid inside a
/// `with_pg_client` callback or a nested `with_transaction` callback.
#[derive(Clone)]
pub struct PgClient {
    conn: Arc<Conn>,
    queue: Arc<OpQueue>,
    txn_level: usize,
    pre_existing: bool,
    always_queue: bool,
}

impl std::fmt::Debug for PgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClient")
            .field("txn_level", &self.txn_level)
            .field("pre_existing", &self.pre_existing)
            .field("always_queue", &self.always_queue)
            .finish()
    }
}

impl PgClient {
    pub(crate) fn new(conn: Arc<Conn>, txn_level: usize) -> Self {
        Self {
            queue: Arc::new(OpQueue::new()),
            pre_existing: conn.pre_existing,
            always_queue: conn.always_queue,
            conn,
            txn_level,
        }
    }

    /// Nested callbacks receive a child client one level deeper, with a
    /// fresh serialization queue.
    fn child(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            queue: Arc::new(OpQueue::new()),
            txn_level: self.txn_level + 1,
            pre_existing: self.pre_existing,
            always_queue: self.always_queue,
        }
    }

    /// Current transaction level: 0 outside a transaction, 1 top-level,
    /// ≥ 2 savepoint depth.
    pub fn transaction_level(&self) -> usize {
        self.txn_level
    }

    /// Executes a query with the given parameter values.
    pub async fn query(&self, text: &str, values: &[SqlValue]) -> Result<QueryResult, Error> {
        let _slot = self.queue.settle(self.always_queue).await;
        self.conn
            .statements()
            .execute(self.conn.client(), None, text, values)
            .await
    }

    /// Executes a named query through the prepared-statement cache.
    ///
    /// The name is a caller-chosen cache hint; queries without values
    /// execute directly.
    pub async fn query_named(
        &self,
        name: &str,
        text: &str,
        values: &[SqlValue],
    ) -> Result<QueryResult, Error> {
        let _slot = self.queue.settle(self.always_queue).await;
        self.conn
            .statements()
            .execute(self.conn.client(), Some(name), text, values)
            .await
    }

    /// Runs the callback inside a transaction one level deeper than this
    /// client: a real `BEGIN` at the top level (a savepoint when the
    /// connection was already inside a transaction), savepoints below.
    ///
    /// On success the transaction is committed (or its savepoint
    /// released); on error it is rolled back and the callback's error
    /// propagates unchanged. The operation always occupies this client's
    /// serialization slot.
    pub async fn with_transaction<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(PgClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.queue.occupy().await;
        let _exclusive = match (&self.conn.exclusive, self.txn_level) {
            (Some(m), 0) => Some(m.lock().await),
            _ => None,
        };

        let (enter, commit, rollback) = transaction_statements(self.txn_level, self.pre_existing);
        exec_tx(self.conn.client(), &enter, TxOp::Enter)
            .await
            .map_err(E::from)?;

        let guard = RollbackGuard::new(&self.conn, &rollback);
        match f(self.child()).await {
            Ok(value) => {
                guard.disarm();
                if let Err(e) = exec_tx(self.conn.client(), &commit, TxOp::Commit).await {
                    // Roll back before surfacing the commit error, while
                    // the queue slot and connection mutex are still held,
                    // so the next caller sees a clean connection.
                    rollback_logged(&self.conn, &rollback).await;
                    return Err(E::from(e));
                }
                Ok(value)
            }
            Err(err) => {
                guard.disarm();
                if let Err(e) = exec_tx(self.conn.client(), &rollback, TxOp::Rollback).await {
                    tracing::warn!(target: "pglink", "rollback failed: {}", e);
                }
                Err(err)
            }
        }
    }
}

/// The enter/commit/rollback statements for a transition out of
/// `level`. Savepoints are named after the pre-call level; the unnumbered
/// `tx` savepoint is reserved for level 0 on connections already inside a
/// transaction.
fn transaction_statements(level: usize, pre_existing: bool) -> (String, String, String) {
    match (level, pre_existing) {
        (0, false) => ("BEGIN".into(), "COMMIT".into(), "ROLLBACK".into()),
        (0, true) => (
            "SAVEPOINT tx".into(),
            "RELEASE SAVEPOINT tx".into(),
            "ROLLBACK TO SAVEPOINT tx".into(),
        ),
        (n, _) => (
            format!("SAVEPOINT tx{}", n),
            format!("RELEASE SAVEPOINT tx{}", n),
            format!("ROLLBACK TO SAVEPOINT tx{}", n),
        ),
    }
}

async fn exec_tx(client: &Client, sql: &str, op: TxOp) -> Result<(), Error> {
    client
        .batch_execute(sql)
        .await
        .map_err(|source| Error::Transaction { op, source })
}

/// Spawns the rollback statement if the scope is dropped without
/// disarming, which happens when an envelope or transaction future is
/// cancelled mid-flight.
struct RollbackGuard {
    conn: Option<Arc<Conn>>,
    sql: String,
}

impl RollbackGuard {
    fn new(conn: &Arc<Conn>, sql: &str) -> Self {
        Self {
            conn: Some(conn.clone()),
            sql: sql.to_owned(),
        }
    }

    fn disarm(mut self) {
        self.conn = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let sql = std::mem::take(&mut self.sql);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            drop(handle.spawn(async move {
                if let Err(e) = conn.client().batch_execute(&sql).await {
                    tracing::warn!(target: "pglink", "rollback after cancellation failed: {}", e);
                }
            }));
        }
    }
}

/// Runs a callback against a connection, applying session settings
/// inside a transaction when any are given.
pub(crate) async fn with_envelope<T, E, F, Fut>(
    conn: &Arc<Conn>,
    settings: Option<&PgSettings>,
    f: F,
) -> Result<T, E>
where
    E: From<Error>,
    F: FnOnce(PgClient) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let settings = settings.filter(|s| !s.is_empty());
    let Some(settings) = settings else {
        return f(PgClient::new(conn.clone(), 0)).await;
    };

    let _exclusive = match &conn.exclusive {
        Some(m) => Some(m.lock().await),
        None => None,
    };

    let (enter, commit, rollback) = transaction_statements(0, conn.pre_existing);
    exec_tx(conn.client(), &enter, TxOp::Enter)
        .await
        .map_err(E::from)?;
    let guard = RollbackGuard::new(conn, &rollback);

    let previous = match capture_previous(conn, settings).await {
        Ok(previous) => previous,
        Err(e) => {
            guard.disarm();
            rollback_logged(conn, &rollback).await;
            return Err(E::from(e));
        }
    };
    if let Err(e) = apply_settings(conn, settings).await {
        guard.disarm();
        rollback_logged(conn, &rollback).await;
        return Err(E::from(e));
    }

    match f(PgClient::new(conn.clone(), 1)).await {
        Ok(value) => {
            guard.disarm();
            if let Err(e) = exec_tx(conn.client(), &commit, TxOp::Commit).await {
                rollback_logged(conn, &rollback).await;
                if let Some(previous) = &previous {
                    if let Err(re) = restore_settings(conn, previous).await {
                        tracing::warn!(target: "pglink", "failed to restore settings: {}", re);
                    }
                }
                return Err(E::from(e));
            }
            if let Some(previous) = &previous {
                restore_settings(conn, previous).await.map_err(E::from)?;
            }
            Ok(value)
        }
        Err(err) => {
            guard.disarm();
            rollback_logged(conn, &rollback).await;
            if let Some(previous) = &previous {
                if let Err(e) = restore_settings(conn, previous).await {
                    tracing::warn!(target: "pglink", "failed to restore settings: {}", e);
                }
            }
            Err(err)
        }
    }
}

async fn rollback_logged(conn: &Conn, rollback: &str) {
    if let Err(e) = exec_tx(conn.client(), rollback, TxOp::Rollback).await {
        tracing::warn!(target: "pglink", "rollback failed: {}", e);
    }
}

/// Captures the previous value of each setting for session-scoped
/// connections; `None` for transaction-local scope.
async fn capture_previous(
    conn: &Conn,
    settings: &PgSettings,
) -> Result<Option<Vec<(String, Option<String>)>>, Error> {
    if conn.scope != SettingsScope::Session {
        return Ok(None);
    }
    let mut previous = Vec::with_capacity(settings.len());
    for (key, _) in settings {
        let result = raw_query(
            conn.client(),
            "SELECT current_setting($1, true) as value",
            &[SqlValue::Text(key.clone())],
        )
        .await?;
        let value: Option<String> = match &result.rows {
            RowSet::Typed(rows) => rows.first().and_then(|row| row.get::<_, Option<String>>(0)),
            RowSet::Text(rows) => rows.first().and_then(|row| row.get(0).map(str::to_owned)),
        };
        previous.push((key.clone(), value));
    }
    Ok(Some(previous))
}

/// Applies all settings in one round-trip.
async fn apply_settings(conn: &Conn, settings: &PgSettings) -> Result<(), Error> {
    let local = conn.scope == SettingsScope::Local;
    let sql = format!(
        "SELECT set_config(el->>0, el->>1, {}) FROM json_array_elements($1::json) el",
        if local { "true" } else { "false" }
    );
    raw_query(conn.client(), &sql, &[SqlValue::Text(settings_json(settings))])
        .await
        .map(|_| ())
}

/// Restores previously captured settings: one `set_config(.., false)`
/// round-trip for values that existed, `RESET` for those that did not.
async fn restore_settings(conn: &Conn, previous: &[(String, Option<String>)]) -> Result<(), Error> {
    let pairs: PgSettings = previous
        .iter()
        .filter_map(|(key, value)| value.clone().map(|value| (key.clone(), value)))
        .collect();
    if !pairs.is_empty() {
        raw_query(
            conn.client(),
            "SELECT set_config(el->>0, el->>1, false) FROM json_array_elements($1::json) el",
            &[SqlValue::Text(settings_json(&pairs))],
        )
        .await?;
    }
    for (key, value) in previous {
        if value.is_none() {
            let sql = format!("RESET \"{}\"", escape_ident(key));
            conn.client().batch_execute(&sql).await.map_err(Error::Db)?;
        }
    }
    Ok(())
}

/// Encodes settings as a JSON array of `[key, value]` pairs.
fn settings_json(settings: &PgSettings) -> String {
    serde_json::Value::Array(
        settings
            .iter()
            .map(|(key, value)| {
                serde_json::Value::Array(vec![key.as_str().into(), value.as_str().into()])
            })
            .collect(),
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn top_level_transaction_statements() {
        assert_eq!(
            transaction_statements(0, false),
            ("BEGIN".into(), "COMMIT".into(), "ROLLBACK".into())
        );
    }

    #[test]
    fn pre_existing_uses_unnumbered_savepoint() {
        assert_eq!(
            transaction_statements(0, true),
            (
                "SAVEPOINT tx".into(),
                "RELEASE SAVEPOINT tx".into(),
                "ROLLBACK TO SAVEPOINT tx".into()
            )
        );
    }

    #[test]
    fn nested_savepoints_use_pre_call_level() {
        assert_eq!(
            transaction_statements(1, false),
            (
                "SAVEPOINT tx1".into(),
                "RELEASE SAVEPOINT tx1".into(),
                "ROLLBACK TO SAVEPOINT tx1".into()
            )
        );
        // Pre-existing mode does not change savepoint naming below the
        // top level.
        assert_eq!(transaction_statements(3, true).0, "SAVEPOINT tx3");
    }

    #[test]
    fn settings_encode_as_json_pairs() {
        let settings: PgSettings = vec![
            ("timezone".into(), "UTC".into()),
            ("role".into(), "viewer".into()),
        ];
        assert_eq!(
            settings_json(&settings),
            r#"[["timezone","UTC"],["role","viewer"]]"#
        );
    }

    #[tokio::test]
    async fn queue_serializes_when_always_set() {
        let queue = Arc::new(OpQueue::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _slot = queue.settle(true).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                let _ = running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_waits_for_occupied_slot_to_settle() {
        let queue = Arc::new(OpQueue::new());
        let slot = queue.occupy().await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                // Settles only after the slot is released.
                let _ = queue.settle(false).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(slot);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn queue_runs_unserialized_when_idle() {
        let queue = OpQueue::new();
        assert!(queue.settle(false).await.is_none());
        // The slot is free afterwards.
        assert!(queue.settle(true).await.is_some());
    }
}
