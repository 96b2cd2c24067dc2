//! Scenarios against a live database.
//!
//! These tests run only when `PGLINK_TEST_URL` points at a PostgreSQL
//! instance, e.g. `PGLINK_TEST_URL=postgres://localhost/pglink_test`.

use std::sync::Arc;
use std::time::Duration;

use pglink::{
    BackendConfig, Error, PgSettings, PooledConfig, Service, ServiceConfig, SqlValue, Subscriber,
    TxOp,
};

fn database_url() -> Option<String> {
    std::env::var("PGLINK_TEST_URL").ok()
}

#[derive(Debug)]
enum TestError {
    Pg(Error),
    Marker(&'static str),
}

impl From<Error> for TestError {
    fn from(e: Error) -> Self {
        Self::Pg(e)
    }
}

fn text_cell(result: &pglink::QueryResult, row: usize) -> String {
    result.rows.text().expect("text rows")[row]
        .get(0)
        .expect("non-null cell")
        .to_owned()
}

#[tokio::test]
async fn settings_apply_inside_and_not_outside() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::pooled(url)).unwrap();
    let settings: PgSettings = vec![("timezone".to_owned(), "Pacific/Pitcairn".to_owned())];

    let inside = service
        .with_pg_client(Some(&settings), |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(inside, "Pacific/Pitcairn");

    let outside = service
        .with_pg_client(None, |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_ne!(outside, "Pacific/Pitcairn");

    service.release().await.unwrap();
}

#[tokio::test]
async fn exclusive_settings_are_restored_after_the_scope() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::exclusive(url)).unwrap();

    let baseline = service
        .with_pg_client(None, |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();

    let settings: PgSettings = vec![("timezone".to_owned(), "Pacific/Pitcairn".to_owned())];
    let inside = service
        .with_pg_client(Some(&settings), |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(inside, "Pacific/Pitcairn");

    // The single long-lived connection must be back at its previous
    // session value.
    let after = service
        .with_pg_client(None, |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(after, baseline);

    service.release().await.unwrap();
}

#[tokio::test]
async fn multiplexed_settings_are_transaction_scoped() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::multiplexed(url)).unwrap();
    let settings: PgSettings = vec![("timezone".to_owned(), "Pacific/Pitcairn".to_owned())];

    let inside = service
        .with_pg_client(Some(&settings), |client| async move {
            let result = client.query("show timezone", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(inside, "Pacific/Pitcairn");

    service.release().await.unwrap();
}

#[tokio::test]
async fn callback_error_rolls_back_the_transaction() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::pooled(url)).unwrap();

    service
        .with_pg_client(None, |client| async move {
            client
                .query("drop table if exists pglink_rollback_t", &[])
                .await?;
            client
                .query("create table pglink_rollback_t (v int)", &[])
                .await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    let result: Result<(), TestError> = service
        .with_pg_client(None, |client| async move {
            client
                .with_transaction(|tx| async move {
                    tx.query("insert into pglink_rollback_t values (1)", &[])
                        .await
                        .map_err(TestError::Pg)?;
                    Err(TestError::Marker("x"))
                })
                .await
        })
        .await;
    assert!(matches!(result, Err(TestError::Marker("x"))));

    let count = service
        .with_pg_client(None, |client| async move {
            let result = client
                .query("select count(*) from pglink_rollback_t", &[])
                .await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(count, "0");

    service.release().await.unwrap();
}

#[tokio::test]
async fn commit_failure_rolls_back_before_surfacing() {
    let Some(url) = database_url() else { return };
    // The single-connection backend is the sharpest probe here: any
    // rollback left pending after the failed commit would land on the
    // very next operation of the same connection.
    let service = Service::new(ServiceConfig::exclusive(url)).unwrap();

    service
        .with_pg_client(None, |client| async move {
            client
                .query("drop table if exists pglink_commit_t", &[])
                .await?;
            client
                .query(
                    "create table pglink_commit_t (v int unique deferrable initially deferred)",
                    &[],
                )
                .await?;

            // The deferred constraint only fires at COMMIT, so the
            // callback succeeds and the commit itself fails.
            let result: Result<(), Error> = client
                .with_transaction(|tx| async move {
                    tx.query("insert into pglink_commit_t values (1), (1)", &[])
                        .await?;
                    Ok(())
                })
                .await;
            assert!(matches!(
                result,
                Err(Error::Transaction {
                    op: TxOp::Commit,
                    ..
                })
            ));

            // The connection is clean: nothing from the failed
            // transaction survived and follow-up work is undisturbed.
            let count = client
                .query("select count(*) from pglink_commit_t", &[])
                .await?;
            assert_eq!(text_cell(&count, 0), "0");

            client
                .with_transaction(|tx| async move {
                    tx.query("insert into pglink_commit_t values (2)", &[])
                        .await?;
                    Ok::<_, Error>(())
                })
                .await?;
            let count = client
                .query("select count(*) from pglink_commit_t", &[])
                .await?;
            assert_eq!(text_cell(&count, 0), "1");

            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    service.release().await.unwrap();
}

#[tokio::test]
async fn inner_transaction_failure_rolls_back_to_savepoint() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::pooled(url)).unwrap();

    let rows = service
        .with_pg_client(None, |client| async move {
            client
                .query("drop table if exists pglink_savepoint_t", &[])
                .await?;
            client
                .query("create table pglink_savepoint_t (v int)", &[])
                .await?;
            client
                .with_transaction(|tx| async move {
                    tx.query("insert into pglink_savepoint_t values (1)", &[])
                        .await?;
                    let inner: Result<(), TestError> = tx
                        .with_transaction(|tx2| async move {
                            tx2.query("insert into pglink_savepoint_t values (2)", &[])
                                .await
                                .map_err(TestError::Pg)?;
                            Err(TestError::Marker("boom"))
                        })
                        .await;
                    assert!(matches!(inner, Err(TestError::Marker("boom"))));
                    Ok::<_, Error>(())
                })
                .await?;
            let result = client
                .query("select v from pglink_savepoint_t order by v", &[])
                .await?;
            let values: Vec<String> = result
                .rows
                .text()
                .expect("text rows")
                .iter()
                .map(|row| row.get(0).expect("non-null cell").to_owned())
                .collect();
            Ok::<_, Error>(values)
        })
        .await
        .unwrap();
    assert_eq!(rows, ["1"]);

    service.release().await.unwrap();
}

#[tokio::test]
async fn lru_evicts_and_recovers_prepared_statements() {
    let Some(url) = database_url() else { return };
    let config = ServiceConfig {
        name: "main".to_owned(),
        backend: BackendConfig::Pooled(PooledConfig {
            url: Some(url),
            max_size: Some(1),
            statement_cache_size: Some(2),
            ..Default::default()
        }),
    };
    let service = Service::new(config).unwrap();

    service
        .with_pg_client(None, |client| async move {
            for (name, add) in [("q1", 1i64), ("q2", 2), ("q3", 3)] {
                let text = format!("select $1::int8 + {}", add);
                let result = client
                    .query_named(name, &text, &[SqlValue::Int(10)])
                    .await?;
                assert_eq!(text_cell(&result, 0), (10 + add).to_string());
            }

            // The cache bound holds server-side: only the two
            // most-recently-used statements survive.
            let count = client
                .query(
                    "select count(*) from pg_prepared_statements where name like 'pglink_%'",
                    &[],
                )
                .await?;
            assert_eq!(text_cell(&count, 0), "2");

            // Re-executing the evicted query re-prepares it.
            let result = client
                .query_named("q1", "select $1::int8 + 1", &[SqlValue::Int(10)])
                .await?;
            assert_eq!(text_cell(&result, 0), "11");

            // Statement loss is recovered transparently with one retry.
            client.query("deallocate all", &[]).await?;
            let result = client
                .query_named("q1", "select $1::int8 + 1", &[SqlValue::Int(10)])
                .await?;
            assert_eq!(text_cell(&result, 0), "11");

            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    service.release().await.unwrap();
}

#[tokio::test]
async fn parameterized_queries_return_typed_rows() {
    let Some(url) = database_url() else { return };
    let service = Service::new(ServiceConfig::pooled(url)).unwrap();

    service
        .with_pg_client(None, |client| async move {
            let result = client
                .query("select $1::int8 + 1", &[SqlValue::Int(41)])
                .await?;
            let value: i64 = result.rows.typed().expect("typed rows")[0].get(0);
            assert_eq!(value, 42);

            let result = client
                .query(
                    "select ($1::int[])[2], $2::jsonb ->> 'k', $3::timestamptz is not null",
                    &[
                        SqlValue::Array(vec![SqlValue::Int(1), SqlValue::Int(2)]),
                        SqlValue::Json(serde_json::json!({"k": "v"})),
                        SqlValue::Timestamp(chrono::Utc::now()),
                    ],
                )
                .await?;
            let rows = result.rows.typed().expect("typed rows");
            assert_eq!(rows[0].get::<_, i32>(0), 2);
            assert_eq!(rows[0].get::<_, String>(1), "v");
            assert!(rows[0].get::<_, bool>(2));

            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    service.release().await.unwrap();
}

#[tokio::test]
async fn notify_fans_out_to_every_consumer_in_order() {
    let Some(url) = database_url() else { return };
    let service = Arc::new(Service::new(ServiceConfig::pooled(url)).unwrap());
    let subscriber = Subscriber::new(service.clone());

    let mut first = subscriber.subscribe("pglink_chat").await.unwrap();
    let mut second = subscriber.subscribe("pglink_chat").await.unwrap();

    service
        .with_pg_client(None, |client| async move {
            client.query("notify pglink_chat, 'one'", &[]).await?;
            client.query("notify pglink_chat, 'two'", &[]).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    for consumer in [&mut first, &mut second] {
        for expected in ["one", "two"] {
            let payload = tokio::time::timeout(Duration::from_secs(5), consumer.next())
                .await
                .expect("notification within 5s");
            assert_eq!(payload.as_deref(), Some(expected));
        }
    }

    // Detaching every consumer tears the physical LISTEN down; a fresh
    // subscription starts a new one and still receives.
    drop(first);
    drop(second);
    let mut third = subscriber.subscribe("pglink_chat").await.unwrap();
    service
        .with_pg_client(None, |client| async move {
            client.query("notify pglink_chat, 'three'", &[]).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), third.next())
        .await
        .expect("notification within 5s");
    assert_eq!(payload.as_deref(), Some("three"));

    drop(third);
    subscriber.release().await.unwrap();
    service.release().await.unwrap();
}

#[tokio::test]
async fn external_client_survives_service_release() {
    let Some(url) = database_url() else { return };
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let client = Arc::new(client);

    let service = Service::from_client("external", client.clone(), false);
    let value = service
        .with_pg_client(None, |c| async move {
            let result = c.query("select 1", &[]).await?;
            Ok::<_, Error>(text_cell(&result, 0))
        })
        .await
        .unwrap();
    assert_eq!(value, "1");

    service.release().await.unwrap();

    // The externally supplied client is still usable.
    let rows = client.simple_query("select 2").await.unwrap();
    assert!(!rows.is_empty());
}
