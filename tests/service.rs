//! Service behaviors that need no live database.

use std::sync::Arc;

use pglink::{BackendConfig, Error, ExclusiveConfig, PooledConfig, Service, ServiceConfig};

fn exclusive_without_url(name: &str) -> Service {
    Service::new(ServiceConfig {
        name: name.to_owned(),
        backend: BackendConfig::Exclusive(ExclusiveConfig::default()),
    })
    .unwrap()
}

#[tokio::test]
async fn missing_configuration_fails_on_first_use() {
    let service = exclusive_without_url("main");
    let result: Result<(), Error> = service
        .with_pg_client(None, |_client| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn missing_superuser_url_fails() {
    let service = exclusive_without_url("main");
    let result: Result<(), Error> = service
        .with_superuser_pg_client(None, |_client| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn double_release_fails() {
    let service = exclusive_without_url("main");
    service.release().await.unwrap();
    assert!(matches!(service.release().await, Err(Error::DoubleRelease)));
}

#[tokio::test]
async fn released_service_rejects_clients() {
    let service = exclusive_without_url("main");
    service.release().await.unwrap();
    let result: Result<(), Error> = service
        .with_pg_client(None, |_client| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(Error::PoolReleased)));
}

#[tokio::test]
async fn listen_requires_a_url() {
    let service = exclusive_without_url("main");
    let result = service
        .listen(
            "chat",
            Arc::new(|_payload: String| {}),
            Arc::new(|_error: Error| {}),
        )
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn pool_size_reflects_backend() {
    let pooled = Service::new(ServiceConfig {
        name: "main".to_owned(),
        backend: BackendConfig::Pooled(PooledConfig {
            max_size: Some(7),
            ..Default::default()
        }),
    })
    .unwrap();
    assert_eq!(pooled.pool_size(), 7);

    let pooled_default = Service::new(ServiceConfig::pooled("postgres://localhost/x")).unwrap();
    assert_eq!(pooled_default.pool_size(), 10);

    let exclusive = exclusive_without_url("main");
    assert_eq!(exclusive.pool_size(), 1);
}

#[test]
fn context_key_follows_service_name() {
    assert_eq!(exclusive_without_url("main").context_key(), "withPgClient");
    assert_eq!(
        exclusive_without_url("geo").context_key(),
        "geo_withPgClient"
    );
}

#[test]
fn pooled_backend_exposes_statement_caches() {
    let pooled = Service::new(ServiceConfig::pooled("postgres://localhost/x")).unwrap();
    let caches = pooled.statement_caches().unwrap();
    assert_eq!(caches.size(), 0);
    assert!(exclusive_without_url("main").statement_caches().is_none());
}
