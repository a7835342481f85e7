use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::Event;

pub type SubscriberFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("subscriber closed")]
    Closed,
}

/// Receives published events. Each subscription gets its own worker, so a
/// slow or failing subscriber never holds up the publisher or its peers.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: Arc<Event>) -> SubscriberFuture<'_>;

    /// Called once after the last queued event was handled.
    fn close(&self) -> SubscriberFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

struct Registration {
    sender: mpsc::UnboundedSender<Arc<Event>>,
    worker: JoinHandle<()>,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Subscription registry with per-subscriber ordered delivery.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    topic: String,
    subscriptions: RwLock<HashMap<Uuid, Registration>>,
}

impl PubSub {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                topic: topic.into(),
                subscriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> Uuid {
        let mut subscriptions = self.inner.subscriptions.write().await;
        let mut id = Uuid::new_v4();
        while subscriptions.contains_key(&id) {
            id = Uuid::new_v4();
        }
        subscriptions.insert(id, self.register(id, subscriber));
        id
    }

    /// Registers `subscriber` under a caller-chosen id. `false` if the id is
    /// already taken.
    pub async fn subscribe_with_id(&self, id: Uuid, subscriber: Arc<dyn EventSubscriber>) -> bool {
        let mut subscriptions = self.inner.subscriptions.write().await;
        if subscriptions.contains_key(&id) {
            return false;
        }
        subscriptions.insert(id, self.register(id, subscriber));
        true
    }

    fn register(&self, id: Uuid, subscriber: Arc<dyn EventSubscriber>) -> Registration {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            self.inner.topic.clone(),
            id,
            subscriber.clone(),
            receiver,
        ));
        tracing::debug!(topic = %self.inner.topic, subscription_id = %id, "subscriber registered");
        Registration {
            sender,
            worker,
            subscriber,
        }
    }

    /// Queues `event` for every current subscriber without waiting on any.
    pub async fn publish(&self, event: Arc<Event>) {
        let subscriptions = self.inner.subscriptions.read().await;
        for (id, registration) in subscriptions.iter() {
            if registration.sender.send(event.clone()).is_err() {
                tracing::warn!(topic = %self.inner.topic, subscription_id = %id, "subscriber worker is gone");
            }
        }
    }

    /// Removes the subscription, lets its worker drain what was already
    /// queued, then closes the subscriber.
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let registration = self.inner.subscriptions.write().await.remove(&id);
        match registration {
            Some(registration) => {
                self.finish(id, registration).await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let drained: Vec<(Uuid, Registration)> =
            self.inner.subscriptions.write().await.drain().collect();
        for (id, registration) in drained {
            self.finish(id, registration).await;
        }
    }

    async fn finish(&self, id: Uuid, registration: Registration) {
        let Registration {
            sender,
            worker,
            subscriber,
        } = registration;
        drop(sender);
        if let Err(err) = worker.await {
            tracing::error!(topic = %self.inner.topic, subscription_id = %id, error = %err, "subscriber worker failed");
        }
        if let Err(err) = subscriber.close().await {
            tracing::warn!(topic = %self.inner.topic, subscription_id = %id, error = %err, "failed to close subscriber");
        }
        tracing::debug!(topic = %self.inner.topic, subscription_id = %id, "subscriber removed");
    }

    pub async fn len(&self) -> usize {
        self.inner.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.inner.subscriptions.read().await.contains_key(&id)
    }
}

async fn run_worker(
    topic: String,
    id: Uuid,
    subscriber: Arc<dyn EventSubscriber>,
    mut receiver: mpsc::UnboundedReceiver<Arc<Event>>,
) {
    while let Some(event) = receiver.recv().await {
        let event_id = event.id;
        let delivery = AssertUnwindSafe(async { subscriber.on_event(event).await });
        match delivery.catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(topic = %topic, subscription_id = %id, event_id = %event_id, error = %err, "subscriber failed to handle event");
            }
            Err(_) => {
                tracing::error!(topic = %topic, subscription_id = %id, event_id = %event_id, "subscriber panicked while handling event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NewEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        kinds: Mutex<Vec<String>>,
        closed: AtomicBool,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
        delay: Option<Duration>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<String> {
            self.kinds.lock().unwrap().clone()
        }
    }

    impl EventSubscriber for Recorder {
        fn on_event(&self, event: Arc<Event>) -> SubscriberFuture<'_> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.panic_on == Some(event.kind.as_str()) {
                    panic!("boom");
                }
                if self.fail_on == Some(event.kind.as_str()) {
                    return Err(SubscriberError::Delivery("rejected".to_string()));
                }
                self.kinds.lock().unwrap().push(event.kind.clone());
                Ok(())
            })
        }

        fn close(&self) -> SubscriberFuture<'_> {
            self.closed.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn event(kind: &str) -> Arc<Event> {
        Arc::new(NewEvent::new(kind, json!({})).into_event(Uuid::nil()))
    }

    #[tokio::test]
    async fn delivers_in_publish_order_and_drains_on_unsubscribe() {
        let pubsub = PubSub::new("test");
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let id = pubsub.subscribe(recorder.clone()).await;

        for kind in ["a", "b", "c", "d"] {
            pubsub.publish(event(kind)).await;
        }
        assert!(pubsub.unsubscribe(id).await);
        assert_eq!(recorder.kinds(), vec!["a", "b", "c", "d"]);
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(!pubsub.unsubscribe(id).await);
        assert!(pubsub.is_empty().await);
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_affect_others() {
        let pubsub = PubSub::new("test");
        let failing = Arc::new(Recorder {
            fail_on: Some("b"),
            panic_on: Some("c"),
            ..Default::default()
        });
        let healthy = Arc::new(Recorder::default());
        pubsub.subscribe(failing.clone()).await;
        pubsub.subscribe(healthy.clone()).await;

        for kind in ["a", "b", "c", "d"] {
            pubsub.publish(event(kind)).await;
        }
        pubsub.shutdown().await;

        assert_eq!(healthy.kinds(), vec!["a", "b", "c", "d"]);
        assert_eq!(failing.kinds(), vec!["a", "d"]);
        assert!(failing.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_ids_are_unique() {
        let pubsub = PubSub::new("test");
        let id = Uuid::new_v4();
        assert!(pubsub.subscribe_with_id(id, Arc::new(Recorder::default())).await);
        assert!(!pubsub.subscribe_with_id(id, Arc::new(Recorder::default())).await);
        assert!(pubsub.contains(id).await);
        assert_eq!(pubsub.len().await, 1);
    }
}
