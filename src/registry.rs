//! Process-wide shared services with grace-period release.
//!
//! Several independent consumers (schema builders, watchers, test
//! harnesses) often want the same service. [`acquire`] hands out
//! ref-counted handles to one shared [`Service`] per key; when the last
//! handle drops, teardown is deferred by a grace period so an immediate
//! re-acquire reuses the live service instead of reconnecting.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::backend::Service;
use crate::error::Error;

/// Environment variable overriding the default release grace period in
/// milliseconds.
pub const RELEASE_GRACE_ENV: &str = "PGLINK_RELEASE_GRACE_MS";

const DEFAULT_RELEASE_GRACE_MS: u64 = 5000;

static SHARED: Lazy<Mutex<HashMap<String, SharedEntry>>> = Lazy::new(Mutex::default);

struct SharedEntry {
    service: Arc<Service>,
    refs: usize,
    /// Bumped on every acquire and final drop; a scheduled reap only
    /// fires if the epoch is unchanged, so re-acquiring within the grace
    /// period cancels the teardown.
    epoch: u64,
}

/// The default grace period, honoring [`RELEASE_GRACE_ENV`].
pub fn default_grace() -> Duration {
    let ms = std::env::var(RELEASE_GRACE_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RELEASE_GRACE_MS);
    Duration::from_millis(ms)
}

/// A ref-counted handle to a shared [`Service`].
pub struct SharedService {
    key: String,
    service: Arc<Service>,
    grace: Duration,
}

impl std::fmt::Debug for SharedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedService")
            .field("key", &self.key)
            .finish()
    }
}

impl Deref for SharedService {
    type Target = Service;

    fn deref(&self) -> &Service {
        &self.service
    }
}

impl Drop for SharedService {
    fn drop(&mut self) {
        let mut map = SHARED.lock().unwrap();
        let Some(entry) = map.get_mut(&self.key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        entry.epoch += 1;
        let epoch = entry.epoch;
        drop(map);

        let key = std::mem::take(&mut self.key);
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    reap(&key, epoch).await;
                }));
            }
            Err(_) => {
                // Without a runtime the grace period cannot be awaited;
                // drop the entry now. Connections close as their handles
                // drop.
                let _ = SHARED.lock().unwrap().remove(&key);
            }
        }
    }
}

async fn reap(key: &str, epoch: u64) {
    let service = {
        let mut map = SHARED.lock().unwrap();
        match map.get(key) {
            Some(entry) if entry.refs == 0 && entry.epoch == epoch => {
                map.remove(key).map(|entry| entry.service)
            }
            _ => None,
        }
    };
    if let Some(service) = service {
        if let Err(e) = service.release().await {
            tracing::warn!(target: "pglink", "failed to release shared service {:?}: {}", key, e);
        }
    }
}

/// Returns a handle to the service registered under `key`, creating it
/// with `init` on first acquisition.
pub fn acquire(
    key: &str,
    grace: Duration,
    init: impl FnOnce() -> Result<Service, Error>,
) -> Result<SharedService, Error> {
    let mut map = SHARED.lock().unwrap();
    if let Some(entry) = map.get_mut(key) {
        entry.refs += 1;
        entry.epoch += 1;
        return Ok(SharedService {
            key: key.to_owned(),
            service: entry.service.clone(),
            grace,
        });
    }
    let service = Arc::new(init()?);
    let _ = map.insert(
        key.to_owned(),
        SharedEntry {
            service: service.clone(),
            refs: 1,
            epoch: 0,
        },
    );
    Ok(SharedService {
        key: key.to_owned(),
        service,
        grace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn unconnected(name: &str) -> Result<Service, Error> {
        let raw = format!(r#"{{ "name": "{}", "backend": {{ "kind": "exclusive" }} }}"#, name);
        Service::new(serde_json::from_str::<ServiceConfig>(&raw).unwrap())
    }

    #[tokio::test]
    async fn acquire_shares_one_service_per_key() {
        let a = acquire("registry-share", Duration::from_secs(1), || {
            unconnected("share")
        })
        .unwrap();
        let b = acquire("registry-share", Duration::from_secs(1), || {
            panic!("init must not run for a live entry")
        })
        .unwrap();
        assert!(Arc::ptr_eq(&a.service, &b.service));
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn reacquire_within_grace_cancels_teardown() {
        let first = acquire("registry-grace", Duration::from_millis(50), || {
            unconnected("grace")
        })
        .unwrap();
        let service = first.service.clone();
        drop(first);

        // Still inside the grace period: the same service comes back.
        let second = acquire("registry-grace", Duration::from_millis(50), || {
            panic!("init must not run within the grace period")
        })
        .unwrap();
        assert!(Arc::ptr_eq(&service, &second.service));

        drop(second);
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Grace expired with no holders: the entry is gone and a fresh
        // acquire runs init again.
        let third = acquire("registry-grace", Duration::from_millis(50), || {
            unconnected("grace")
        })
        .unwrap();
        assert!(!Arc::ptr_eq(&service, &third.service));
        drop(third);
    }

    #[test]
    fn grace_defaults_to_five_seconds() {
        if std::env::var(RELEASE_GRACE_ENV).is_err() {
            assert_eq!(default_grace(), Duration::from_millis(5000));
        }
    }
}
