//! LISTEN/NOTIFY fan-out.
//!
//! A [`Subscriber`] multiplexes one physical `LISTEN` per topic into any
//! number of consumer [`Subscription`] streams. The physical `LISTEN` is
//! created for the first consumer of a topic and torn down when the last
//! one detaches.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::backend::Service;
use crate::error::Error;
use crate::listen::{ErrorCallback, ListenGuard, NotifyCallback};

/// Fans notifications out to per-topic consumer streams over a service's
/// `listen` support.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").finish()
    }
}

struct SubscriberInner {
    service: Arc<Service>,
    topics: Mutex<HashMap<String, Topic>>,
    released: AtomicBool,
    next_consumer: AtomicU64,
    dispatch: mpsc::UnboundedSender<(String, String)>,
}

struct Topic {
    consumers: Vec<Consumer>,
    guard: Option<ListenGuard>,
}

impl Topic {
    /// Delivers a payload to every consumer in registration order.
    fn deliver(&self, payload: &str) {
        for consumer in &self.consumers {
            let _ = consumer.tx.send(payload.to_owned());
        }
    }
}

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl Subscriber {
    /// Creates a subscriber on top of a service. The service must stay
    /// unreleased while subscriptions are live.
    pub fn new(service: Arc<Service>) -> Self {
        let (dispatch, mut dispatch_rx) = mpsc::unbounded_channel::<(String, String)>();
        let inner = Arc::new(SubscriberInner {
            service,
            topics: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
            next_consumer: AtomicU64::new(1),
            dispatch,
        });

        // The dispatcher serializes delivery, which preserves the
        // publisher's emission order per consumer. It holds only a weak
        // reference so the subscriber can be dropped normally.
        let weak = Arc::downgrade(&inner);
        drop(tokio::spawn(async move {
            while let Some((topic, payload)) = dispatch_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let topics = inner.topics.lock().await;
                if let Some(topic) = topics.get(&topic) {
                    topic.deliver(&payload);
                }
            }
        }));

        Self { inner }
    }

    /// Subscribes to a topic, sharing the physical `LISTEN` with other
    /// consumers of the same topic.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, Error> {
        if self.inner.released.load(Ordering::SeqCst) {
            return Err(Error::SubscriberReleased);
        }
        let mut topics = self.inner.topics.lock().await;
        if self.inner.released.load(Ordering::SeqCst) {
            return Err(Error::SubscriberReleased);
        }

        let id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        match topics.get_mut(topic) {
            Some(entry) => entry.consumers.push(Consumer { id, tx }),
            None => {
                let dispatch = self.inner.dispatch.clone();
                let topic_name = topic.to_owned();
                let on_notify: NotifyCallback = Arc::new(move |payload| {
                    let _ = dispatch.send((topic_name.clone(), payload));
                });
                let channel = topic.to_owned();
                let on_error: ErrorCallback = Arc::new(move |err| {
                    tracing::warn!(target: "pglink", "listen error on {:?}: {}", channel, err);
                });
                let guard = self.inner.service.listen(topic, on_notify, on_error).await?;
                let _ = topics.insert(
                    topic.to_owned(),
                    Topic {
                        consumers: vec![Consumer { id, tx }],
                        guard: Some(guard),
                    },
                );
            }
        }

        Ok(Subscription {
            rx,
            topic: topic.to_owned(),
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Releases the subscriber: finishes every outstanding consumer
    /// stream, tears down every `LISTEN` and rejects further
    /// subscriptions. A second release fails with
    /// [`Error::SubscriberReleased`].
    pub async fn release(&self) -> Result<(), Error> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Err(Error::SubscriberReleased);
        }
        let drained: Vec<Topic> = {
            let mut topics = self.inner.topics.lock().await;
            topics.drain().map(|(_, topic)| topic).collect()
        };
        for topic in drained {
            // Dropping the senders finishes the consumer streams.
            drop(topic.consumers);
            if let Some(guard) = topic.guard {
                guard.unlisten().await;
            }
        }
        Ok(())
    }
}

impl SubscriberInner {
    async fn detach(inner: Arc<Self>, topic: String, id: u64) {
        let guard = {
            let mut topics = inner.topics.lock().await;
            let Some(entry) = topics.get_mut(&topic) else {
                return;
            };
            entry.consumers.retain(|c| c.id != id);
            if entry.consumers.is_empty() {
                topics.remove(&topic).and_then(|entry| entry.guard)
            } else {
                None
            }
        };
        if let Some(guard) = guard {
            guard.unlisten().await;
        }
    }
}

/// One consumer's stream of payloads for a topic. Dropping it detaches
/// the consumer; the topic's `LISTEN` is torn down with the last one.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    topic: String,
    id: u64,
    inner: Weak<SubscriberInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

impl Subscription {
    /// The next payload, or `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// The topic this subscription consumes.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let topic = std::mem::take(&mut self.topic);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            drop(handle.spawn(async move {
                SubscriberInner::detach(inner, topic, id).await;
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn unconnected_service() -> Arc<Service> {
        let config: ServiceConfig =
            serde_json::from_str(r#"{ "backend": { "kind": "exclusive" } }"#).unwrap();
        Arc::new(Service::new(config).unwrap())
    }

    #[test]
    fn deliver_fans_out_in_registration_order() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let topic = Topic {
            consumers: vec![Consumer { id: 1, tx: tx_a }, Consumer { id: 2, tx: tx_b }],
            guard: None,
        };

        topic.deliver("one");
        topic.deliver("two");

        assert_eq!(rx_a.try_recv().unwrap(), "one");
        assert_eq!(rx_a.try_recv().unwrap(), "two");
        assert_eq!(rx_b.try_recv().unwrap(), "one");
        assert_eq!(rx_b.try_recv().unwrap(), "two");
    }

    #[tokio::test]
    async fn subscribe_after_release_fails() {
        let subscriber = Subscriber::new(unconnected_service());
        subscriber.release().await.unwrap();
        assert!(matches!(
            subscriber.subscribe("chat").await,
            Err(Error::SubscriberReleased)
        ));
    }

    #[tokio::test]
    async fn double_release_fails() {
        let subscriber = Subscriber::new(unconnected_service());
        subscriber.release().await.unwrap();
        assert!(matches!(
            subscriber.release().await,
            Err(Error::SubscriberReleased)
        ));
    }

    #[tokio::test]
    async fn subscribe_without_listen_support_surfaces_error() {
        // An exclusive backend without a URL cannot open a listen
        // connection; the configuration error must reach the caller.
        let subscriber = Subscriber::new(unconnected_service());
        assert!(subscriber.subscribe("chat").await.is_err());
    }
}
