use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::events::{Event, EventSubscriber, SubscriberError, SubscriberFuture};
use crate::store::{now, StoreError};

use super::models::{
    EventCallback, EventCallbackProcessor, EventCallbackResult, EventCallbackResultStatus,
};
use super::store::CallbackStore;

/// Runs every matching callback for each published event and records one
/// result per callback and event.
#[derive(Clone)]
pub struct CallbackDispatcher {
    store: CallbackStore,
    client: reqwest::Client,
}

impl CallbackDispatcher {
    pub fn new(store: CallbackStore, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { store, client })
    }

    /// Returns the number of callbacks that ran. A result that cannot be
    /// stored is logged and does not stop the remaining callbacks.
    pub async fn dispatch(&self, event: &Event) -> Result<usize, StoreError> {
        let callbacks = self
            .store
            .matching_callbacks(event.conversation_id, &event.kind)
            .await?;
        for callback in &callbacks {
            let (status, detail) = match self.run(callback, event).await {
                Ok(detail) => (EventCallbackResultStatus::Success, detail),
                Err(message) => {
                    tracing::warn!(
                        event_callback_id = %callback.id,
                        event_id = %event.id,
                        error = %message,
                        "event callback failed"
                    );
                    (EventCallbackResultStatus::Error, Some(message))
                }
            };
            let result = EventCallbackResult {
                id: Uuid::new_v4(),
                event_callback_id: callback.id,
                event_id: event.id,
                conversation_id: event.conversation_id,
                status,
                detail,
                created_at: now(),
            };
            if let Err(err) = self.store.insert_result(&result).await {
                tracing::error!(
                    event_callback_id = %callback.id,
                    event_id = %event.id,
                    error = %err,
                    "failed to record event callback result"
                );
            }
        }
        Ok(callbacks.len())
    }

    async fn run(&self, callback: &EventCallback, event: &Event) -> Result<Option<String>, String> {
        match &callback.processor {
            EventCallbackProcessor::Logging { label } => {
                tracing::info!(
                    event_callback_id = %callback.id,
                    label = label.as_deref().unwrap_or(""),
                    conversation_id = %event.conversation_id,
                    event_id = %event.id,
                    kind = %event.kind,
                    "event received"
                );
                Ok(None)
            }
            EventCallbackProcessor::Webhook { url, headers } => {
                let mut request = self.client.post(url).json(event);
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                let response = request.send().await.map_err(|err| err.to_string())?;
                let status = response.status();
                if status.is_success() {
                    Ok(Some(format!("HTTP {}", status.as_u16())))
                } else {
                    Err(format!("webhook responded with HTTP {}", status.as_u16()))
                }
            }
        }
    }
}

impl EventSubscriber for CallbackDispatcher {
    fn on_event(&self, event: Arc<Event>) -> SubscriberFuture<'_> {
        Box::pin(async move {
            self.dispatch(&event)
                .await
                .map(|_| ())
                .map_err(|err| SubscriberError::Delivery(err.to_string()))
        })
    }
}
