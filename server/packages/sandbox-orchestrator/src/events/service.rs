use std::collections::HashMap;
use std::sync::Arc;

use sandbox_orchestrator_error::OrchestratorError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::pagination::{clamp_limit, paginate_from_key};

use super::pubsub::{EventSubscriber, PubSub};
use super::{Event, EventPage, NewEvent};

/// In-memory conversation event logs. Appending an event publishes it to
/// the conversation's subscribers and to the global subscribers, in append
/// order.
#[derive(Clone)]
pub struct EventService {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<EventState>,
    global: PubSub,
}

#[derive(Default)]
struct EventState {
    logs: HashMap<Uuid, ConversationLog>,
    /// Event id to owning conversation.
    index: HashMap<Uuid, Uuid>,
}

struct ConversationLog {
    events: Vec<Arc<Event>>,
    positions: HashMap<Uuid, usize>,
    topic: PubSub,
}

impl ConversationLog {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            events: Vec::new(),
            positions: HashMap::new(),
            topic: PubSub::new(format!("conversation:{conversation_id}")),
        }
    }
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EventState::default()),
                global: PubSub::new("all-conversations"),
            }),
        }
    }

    /// Stores and publishes an event. Re-appending an id that is already in
    /// the log returns the stored event without publishing it again; an id
    /// owned by another conversation is a conflict.
    pub async fn append_event(
        &self,
        conversation_id: Uuid,
        event: NewEvent,
    ) -> Result<Event, OrchestratorError> {
        let event = Arc::new(event.into_event(conversation_id));
        let mut state = self.inner.state.lock().await;
        if let Some(owner) = state.index.get(&event.id).copied() {
            if owner != conversation_id {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    owner = %owner,
                    event_id = %event.id,
                    "event id already used by another conversation"
                );
                return Err(OrchestratorError::Conflict {
                    message: format!("event {} belongs to another conversation", event.id),
                });
            }
            let existing = state
                .logs
                .get(&conversation_id)
                .and_then(|log| log.positions.get(&event.id).map(|pos| log.events[*pos].clone()));
            if let Some(existing) = existing {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    event_id = %event.id,
                    "duplicate event ignored"
                );
                return Ok(existing.as_ref().clone());
            }
        }

        state.index.insert(event.id, conversation_id);
        let log = state
            .logs
            .entry(conversation_id)
            .or_insert_with(|| ConversationLog::new(conversation_id));
        log.positions.insert(event.id, log.events.len());
        log.events.push(event.clone());

        // Publishing under the state lock keeps delivery in log order.
        log.topic.publish(event.clone()).await;
        self.inner.global.publish(event.clone()).await;
        tracing::debug!(
            conversation_id = %conversation_id,
            event_id = %event.id,
            kind = %event.kind,
            "event appended"
        );
        Ok(event.as_ref().clone())
    }

    /// Appends in order and stops at the first conflicting id.
    pub async fn append_events(
        &self,
        conversation_id: Uuid,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            appended.push(self.append_event(conversation_id, event).await?);
        }
        Ok(appended)
    }

    pub async fn get_event(&self, event_id: Uuid) -> Option<Event> {
        let state = self.inner.state.lock().await;
        let conversation_id = state.index.get(&event_id)?;
        let log = state.logs.get(conversation_id)?;
        let position = log.positions.get(&event_id)?;
        Some(log.events[*position].as_ref().clone())
    }

    pub async fn batch_get_events(&self, event_ids: &[Uuid]) -> Vec<Option<Event>> {
        let mut events = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            events.push(self.get_event(*event_id).await);
        }
        events
    }

    /// Events of one conversation in append order, optionally restricted to
    /// one kind.
    pub async fn search_events(
        &self,
        conversation_id: Uuid,
        kind: Option<&str>,
        page_id: Option<&str>,
        limit: Option<usize>,
    ) -> EventPage {
        let events: Vec<Event> = {
            let state = self.inner.state.lock().await;
            match state.logs.get(&conversation_id) {
                Some(log) => log
                    .events
                    .iter()
                    .filter(|event| kind.map(|kind| event.kind == kind).unwrap_or(true))
                    .map(|event| event.as_ref().clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        let (items, next_page_id) =
            paginate_from_key(events, page_id, clamp_limit(limit), |event| event.id.to_string());
        EventPage {
            items,
            next_page_id,
        }
    }

    pub async fn count_events(&self, conversation_id: Uuid) -> usize {
        let state = self.inner.state.lock().await;
        state
            .logs
            .get(&conversation_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    pub async fn subscribe(
        &self,
        conversation_id: Uuid,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Uuid {
        let topic = self.topic(conversation_id).await;
        topic.subscribe(subscriber).await
    }

    pub async fn subscribe_with_id(
        &self,
        conversation_id: Uuid,
        subscription_id: Uuid,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> bool {
        let topic = self.topic(conversation_id).await;
        topic.subscribe_with_id(subscription_id, subscriber).await
    }

    pub async fn unsubscribe(&self, conversation_id: Uuid, subscription_id: Uuid) -> bool {
        let topic = {
            let state = self.inner.state.lock().await;
            state.logs.get(&conversation_id).map(|log| log.topic.clone())
        };
        match topic {
            Some(topic) => topic.unsubscribe(subscription_id).await,
            None => false,
        }
    }

    /// Subscribes to events of every conversation.
    pub async fn subscribe_all(&self, subscriber: Arc<dyn EventSubscriber>) -> Uuid {
        self.inner.global.subscribe(subscriber).await
    }

    pub async fn unsubscribe_all(&self, subscription_id: Uuid) -> bool {
        self.inner.global.unsubscribe(subscription_id).await
    }

    /// Drains and closes every subscriber.
    pub async fn shutdown(&self) {
        let topics: Vec<PubSub> = {
            let state = self.inner.state.lock().await;
            state.logs.values().map(|log| log.topic.clone()).collect()
        };
        for topic in topics {
            topic.shutdown().await;
        }
        self.inner.global.shutdown().await;
    }

    async fn topic(&self, conversation_id: Uuid) -> PubSub {
        let mut state = self.inner.state.lock().await;
        state
            .logs
            .entry(conversation_id)
            .or_insert_with(|| ConversationLog::new(conversation_id))
            .topic
            .clone()
    }
}
