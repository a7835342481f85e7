//! Batching webhook delivery.
//!
//! A [`WebhookSubscriber`] buffers matching events and POSTs them as
//! [`WebhookBatch`]es, either when `max_batch_size` events are waiting or
//! `max_wait` after the first buffered event. Failed batches are kept intact
//! and retried ahead of newer events with an exponential delay.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

use super::pubsub::{EventSubscriber, SubscriberError, SubscriberFuture};
use super::Event;

/// JSON body of every webhook POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WebhookBatch {
    pub subscriber_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub events: Vec<Event>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(String),
    #[error("webhook responded with status {0}")]
    Status(u16),
}

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

pub trait WebhookTransport: Send + Sync {
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        session_api_key: Option<&'a str>,
        batch: &'a WebhookBatch,
    ) -> DeliveryFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| DeliveryError::Request(err.to_string()))?;
        Ok(Self { client })
    }
}

impl WebhookTransport for HttpWebhookTransport {
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        session_api_key: Option<&'a str>,
        batch: &'a WebhookBatch,
    ) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.post(url).json(batch);
            if let Some(key) = session_api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|err| DeliveryError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(DeliveryError::Status(status.as_u16()));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    pub url: String,
    pub session_api_key: Option<String>,
    /// `None` accepts every kind.
    pub filter_types: Option<Vec<String>>,
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub max_retry_attempts: Option<u32>,
    pub max_retry_delay: Duration,
}

impl WebhookSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_api_key: None,
            filter_types: None,
            max_batch_size: 10,
            max_wait: Duration::from_secs(1),
            max_retry_attempts: None,
            max_retry_delay: Duration::from_secs(60),
        }
    }

    fn accepts(&self, kind: &str) -> bool {
        match &self.filter_types {
            Some(kinds) => kinds.iter().any(|accepted| accepted == kind),
            None => true,
        }
    }

    fn batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    /// Delay before the next flush after `failures` consecutive failures.
    fn retry_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.max_wait;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.max_wait
            .saturating_mul(factor)
            .min(self.max_retry_delay.max(self.max_wait))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryStats {
    pub pending_events: usize,
    pub delivered_events: u64,
    pub dropped_events: u64,
    pub consecutive_failures: u32,
    pub last_flush_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct BufferState {
    /// Batches that failed, oldest first. Retried before `pending`.
    retry: VecDeque<Vec<Event>>,
    pending: Vec<Event>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    closed: bool,
    stats: DeliveryStats,
}

impl BufferState {
    fn queued(&self) -> usize {
        self.pending.len() + self.retry.iter().map(Vec::len).sum::<usize>()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct WebhookSubscriber {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    settings: WebhookSettings,
    transport: Arc<dyn WebhookTransport>,
    state: Mutex<BufferState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BufferState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl WebhookSubscriber {
    pub fn new(id: Uuid, settings: WebhookSettings, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                settings,
                transport,
                state: Mutex::new(BufferState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> DeliveryStats {
        let state = self.inner.state();
        DeliveryStats {
            pending_events: state.queued(),
            ..state.stats.clone()
        }
    }

    /// Buffers `event` if it passes the filter, flushing right away once a
    /// full batch is waiting.
    pub async fn push(&self, event: Event) -> Result<(), SubscriberError> {
        if !self.inner.settings.accepts(&event.kind) {
            return Ok(());
        }
        let flush_now = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(SubscriberError::Closed);
            }
            state.pending.push(event);
            // While retrying, deliveries wait for the backoff timer.
            let flush_now = state.stats.consecutive_failures == 0
                && state.pending.len() >= self.inner.settings.batch_size();
            if !flush_now && state.timer.is_none() {
                let delay = self
                    .inner
                    .settings
                    .retry_delay(state.stats.consecutive_failures);
                arm_timer(&self.inner, &mut state, delay);
            }
            flush_now
        };
        if flush_now {
            flush(&self.inner).await;
        }
        Ok(())
    }

    pub async fn flush(&self) {
        flush(&self.inner).await;
    }

    /// Stops the timer, waits for an in-flight flush and makes one final
    /// delivery attempt. No timers are armed afterwards.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state();
            state.closed = true;
            state.cancel_timer();
        }
        flush(&self.inner).await;
        let remaining = self.inner.state().queued();
        if remaining > 0 {
            tracing::warn!(
                subscriber_id = %self.inner.id,
                pending_events = remaining,
                "webhook subscriber closed with undelivered events"
            );
        }
    }
}

fn arm_timer(inner: &Arc<Inner>, state: &mut BufferState, delay: Duration) {
    state.timer_generation = state.timer_generation.wrapping_add(1);
    let generation = state.timer_generation;
    let weak: Weak<Inner> = Arc::downgrade(inner);
    state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut state = inner.state();
            if state.timer_generation != generation {
                return;
            }
            // Release the slot so a flush never aborts the task running it.
            state.timer = None;
        }
        flush(&inner).await;
    }));
}

async fn flush(inner: &Arc<Inner>) {
    let _flushing = inner.flush_lock.lock().await;
    let settings = &inner.settings;

    let mut chunks: VecDeque<Vec<Event>> = {
        let mut state = inner.state();
        state.cancel_timer();
        let mut chunks = std::mem::take(&mut state.retry);
        let pending = std::mem::take(&mut state.pending);
        chunks.extend(pending.chunks(settings.batch_size()).map(<[Event]>::to_vec));
        chunks
    };

    while let Some(events) = chunks.pop_front() {
        let batch = WebhookBatch {
            subscriber_id: inner.id,
            timestamp: Utc::now(),
            events,
        };
        let result = inner
            .transport
            .deliver(&settings.url, settings.session_api_key.as_deref(), &batch)
            .await;

        let mut state = inner.state();
        match result {
            Ok(()) => {
                state.stats.delivered_events += batch.events.len() as u64;
                state.stats.last_flush_at = Some(batch.timestamp);
                state.stats.consecutive_failures = 0;
                tracing::debug!(
                    subscriber_id = %inner.id,
                    events = batch.events.len(),
                    "webhook batch delivered"
                );
            }
            Err(err) => {
                state.stats.consecutive_failures += 1;
                let failures = state.stats.consecutive_failures;
                let exhausted = settings
                    .max_retry_attempts
                    .is_some_and(|max_attempts| failures > max_attempts);
                if exhausted {
                    tracing::error!(
                        subscriber_id = %inner.id,
                        url = %settings.url,
                        events = batch.events.len(),
                        attempts = failures,
                        error = %err,
                        "dropping webhook batch after repeated failures"
                    );
                    state.stats.dropped_events += batch.events.len() as u64;
                    state.stats.consecutive_failures = 0;
                } else {
                    tracing::warn!(
                        subscriber_id = %inner.id,
                        url = %settings.url,
                        events = batch.events.len(),
                        attempts = failures,
                        error = %err,
                        "webhook delivery failed, will retry"
                    );
                    chunks.push_front(batch.events);
                }
                // Unsent batches go back ahead of anything buffered meanwhile.
                let unsent = std::mem::take(&mut chunks);
                for events in unsent.into_iter().rev() {
                    state.retry.push_front(events);
                }
                break;
            }
        }
    }

    let mut state = inner.state();
    if !state.closed && state.timer.is_none() && state.queued() > 0 {
        let delay = settings.retry_delay(state.stats.consecutive_failures);
        arm_timer(inner, &mut state, delay);
    }
}

impl EventSubscriber for WebhookSubscriber {
    fn on_event(&self, event: Arc<Event>) -> SubscriberFuture<'_> {
        Box::pin(async move { self.push(event.as_ref().clone()).await })
    }

    fn close(&self) -> SubscriberFuture<'_> {
        Box::pin(async move {
            WebhookSubscriber::close(self).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NewEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        delivered: Mutex<Vec<WebhookBatch>>,
        attempts: AtomicUsize,
        /// Number of leading attempts that fail; `usize::MAX` fails forever.
        fail_first: AtomicUsize,
        keys: Mutex<Vec<Option<String>>>,
    }

    impl FakeTransport {
        fn failing(count: usize) -> Arc<Self> {
            let transport = Self::default();
            transport.fail_first.store(count, Ordering::SeqCst);
            Arc::new(transport)
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|batch| batch.events.iter().map(|event| event.kind.clone()).collect())
                .collect()
        }
    }

    impl WebhookTransport for FakeTransport {
        fn deliver<'a>(
            &'a self,
            _url: &'a str,
            session_api_key: Option<&'a str>,
            batch: &'a WebhookBatch,
        ) -> DeliveryFuture<'a> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().unwrap().push(session_api_key.map(str::to_string));
            let result = if attempt < self.fail_first.load(Ordering::SeqCst) {
                Err(DeliveryError::Status(503))
            } else {
                self.delivered.lock().unwrap().push(batch.clone());
                Ok(())
            };
            Box::pin(async move { result })
        }
    }

    fn event(kind: &str) -> Event {
        NewEvent::new(kind, json!({ "kind": kind })).into_event(Uuid::nil())
    }

    fn settings(max_batch_size: usize, max_wait_ms: u64) -> WebhookSettings {
        WebhookSettings {
            max_batch_size,
            max_wait: Duration::from_millis(max_wait_ms),
            ..WebhookSettings::new("http://hooks.test/events")
        }
    }

    fn subscriber(settings: WebhookSettings, transport: Arc<FakeTransport>) -> WebhookSubscriber {
        WebhookSubscriber::new(Uuid::new_v4(), settings, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately() {
        let transport = Arc::new(FakeTransport::default());
        let subscriber = subscriber(settings(3, 60_000), transport.clone());

        for kind in ["a", "b", "c"] {
            subscriber.push(event(kind)).await.expect("push");
        }
        assert_eq!(transport.batches(), vec![vec!["a", "b", "c"]]);

        subscriber.push(event("d")).await.expect("push");
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(subscriber.stats().pending_events, 1);
        assert_eq!(subscriber.stats().delivered_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batches() {
        let transport = Arc::new(FakeTransport::default());
        let subscriber = subscriber(settings(10, 1_000), transport.clone());

        subscriber.push(event("a")).await.expect("push");
        tokio::time::sleep(Duration::from_millis(600)).await;
        subscriber.push(event("b")).await.expect("push");
        assert!(transport.batches().is_empty());

        // Anchored to the first event: fires 1s after "a", not after "b".
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.batches(), vec![vec!["a", "b"]]);
        assert!(subscriber.stats().last_flush_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_retried_intact_before_newer_events() {
        let transport = FakeTransport::failing(1);
        let subscriber = subscriber(settings(2, 1_000), transport.clone());

        subscriber.push(event("a")).await.expect("push");
        subscriber.push(event("b")).await.expect("push");
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(transport.batches().is_empty());
        assert_eq!(subscriber.stats().consecutive_failures, 1);

        for kind in ["c", "d", "e"] {
            subscriber.push(event(kind)).await.expect("push");
        }
        // Backing off: no size-triggered flush while the retry is pending.
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(
            transport.batches(),
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
        let stats = subscriber.stats();
        assert_eq!(stats.pending_events, 0);
        assert_eq!(stats.delivered_events, 5);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_doubles_up_to_the_cap() {
        let mut settings = settings(1, 1_000);
        settings.max_retry_delay = Duration::from_millis(3_000);
        assert_eq!(settings.retry_delay(0), Duration::from_millis(1_000));
        assert_eq!(settings.retry_delay(1), Duration::from_millis(1_000));
        assert_eq!(settings.retry_delay(2), Duration::from_millis(2_000));
        assert_eq!(settings.retry_delay(3), Duration::from_millis(3_000));
        assert_eq!(settings.retry_delay(40), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_batches_are_dropped() {
        let transport = FakeTransport::failing(usize::MAX);
        let mut settings = settings(1, 1_000);
        settings.max_retry_attempts = Some(1);
        let subscriber = subscriber(settings, transport.clone());

        subscriber.push(event("a")).await.expect("push");
        assert_eq!(subscriber.stats().pending_events, 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        let stats = subscriber.stats();
        assert_eq!(stats.pending_events, 0);
        assert_eq!(stats.dropped_events, 1);

        // Nothing left to retry, so no more attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_drops_unmatched_kinds() {
        let transport = Arc::new(FakeTransport::default());
        let mut settings = settings(2, 1_000);
        settings.filter_types = Some(vec!["message".to_string()]);
        settings.session_api_key = Some("key".to_string());
        let subscriber = subscriber(settings, transport.clone());

        for kind in ["message", "action", "observation", "message"] {
            subscriber.push(event(kind)).await.expect("push");
        }
        assert_eq!(transport.batches(), vec![vec!["message", "message"]]);
        assert_eq!(
            transport.keys.lock().unwrap().clone(),
            vec![Some("key".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_and_rejects_new_events() {
        let transport = Arc::new(FakeTransport::default());
        let subscriber = subscriber(settings(10, 60_000), transport.clone());

        subscriber.push(event("a")).await.expect("push");
        subscriber.push(event("b")).await.expect("push");
        subscriber.close().await;
        assert_eq!(transport.batches(), vec![vec!["a", "b"]]);

        assert!(matches!(
            subscriber.push(event("c")).await,
            Err(SubscriberError::Closed)
        ));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.batches().len(), 1);
    }
}
