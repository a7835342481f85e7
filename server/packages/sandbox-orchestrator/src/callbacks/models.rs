use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// What runs when a matching event arrives. Stored as JSON with a `kind`
/// discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventCallbackProcessor {
    Logging {
        #[serde(default)]
        label: Option<String>,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCallbackStatus {
    Active,
    Disabled,
    Completed,
    Error,
}

impl EventCallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Disabled => "DISABLED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventCallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCallbackStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "DISABLED" => Ok(Self::Disabled),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown callback status {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventCallback {
    pub id: Uuid,
    /// `None` matches every conversation.
    pub conversation_id: Option<Uuid>,
    pub processor: EventCallbackProcessor,
    /// `None` matches every event kind.
    pub event_kind: Option<String>,
    pub status: EventCallbackStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEventCallbackRequest {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub processor: EventCallbackProcessor,
    #[serde(default)]
    pub event_kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateEventCallbackRequest {
    #[serde(default)]
    pub processor: Option<EventCallbackProcessor>,
    #[serde(default)]
    pub event_kind: Option<String>,
    #[serde(default)]
    pub status: Option<EventCallbackStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventCallbackQuery {
    pub conversation_id: Option<Uuid>,
    pub event_kind: Option<String>,
    pub status: Option<EventCallbackStatus>,
    pub page_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventCallbackPage {
    pub items: Vec<EventCallback>,
    pub next_page_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCallbackResultStatus {
    Success,
    Error,
}

impl EventCallbackResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for EventCallbackResultStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown callback result status {other}")),
        }
    }
}

/// Outcome of one callback run for one event. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventCallbackResult {
    pub id: Uuid,
    pub event_callback_id: Uuid,
    pub event_id: Uuid,
    pub conversation_id: Uuid,
    pub status: EventCallbackResultStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCallbackResultSortOrder {
    #[default]
    CreatedAt,
    CreatedAtDesc,
}

impl EventCallbackResultSortOrder {
    pub(crate) fn order_by(&self) -> &'static str {
        match self {
            Self::CreatedAt => " ORDER BY created_at ASC, rowid ASC",
            Self::CreatedAtDesc => " ORDER BY created_at DESC, rowid DESC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventCallbackResultQuery {
    pub event_callback_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub sort_order: EventCallbackResultSortOrder,
    pub page_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventCallbackResultPage {
    pub items: Vec<EventCallbackResult>,
    pub next_page_id: Option<String>,
}
