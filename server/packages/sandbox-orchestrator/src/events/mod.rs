//! Conversation events and their in-process fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod pubsub;
pub mod service;
pub mod webhook;

pub use pubsub::{EventSubscriber, PubSub, SubscriberError, SubscriberFuture};
pub use service::EventService;
pub use webhook::{
    DeliveryError, DeliveryFuture, DeliveryStats, HttpWebhookTransport, WebhookBatch,
    WebhookSettings, WebhookSubscriber, WebhookTransport,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Event type, e.g. `message` or `action`. Subscribers filter on it.
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

/// An event as submitted by an agent server, before it is assigned to a
/// conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NewEvent {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            timestamp: None,
            payload,
        }
    }

    pub fn into_event(self, conversation_id: Uuid) -> Event {
        Event {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            conversation_id,
            kind: self.kind,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventPage {
    pub items: Vec<Event>,
    pub next_page_id: Option<String>,
}
