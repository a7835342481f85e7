use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Starting,
    Running,
    Paused,
    Deleted,
    Error,
}

impl SandboxStatus {
    /// Maps a container runtime status onto the sandbox lifecycle. Unknown
    /// statuses are errors.
    pub fn from_runtime_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" => Self::Deleted,
            "created" => Self::Starting,
            "restarting" => Self::Starting,
            "removing" => Self::Deleted,
            "dead" => Self::Error,
            _ => Self::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ExposedUrl {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxInfo {
    pub id: Uuid,
    pub created_by_user_id: String,
    pub sandbox_spec_id: String,
    pub status: SandboxStatus,
    /// Only set while the sandbox is running.
    pub url: Option<String>,
    /// Only set while the sandbox is running and the caller owns it.
    pub session_api_key: Option<String>,
    #[serde(default)]
    pub exposed_urls: Vec<ExposedUrl>,
    pub created_at: DateTime<Utc>,
}

impl SandboxInfo {
    pub fn without_secrets(mut self) -> Self {
        self.session_api_key = None;
        self
    }

    pub fn exposed_url(&self, name: &str) -> Option<&str> {
        self.exposed_urls
            .iter()
            .find(|exposed| exposed.name == name)
            .map(|exposed| exposed.url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxPage {
    pub items: Vec<SandboxInfo>,
    pub next_page_id: Option<String>,
}

impl SandboxPage {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_page_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxSpecInfo {
    /// Image reference the sandbox is launched from.
    pub id: String,
    pub command: Vec<String>,
    pub initial_env: BTreeMap<String, String>,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxSpecPage {
    pub items: Vec<SandboxSpecInfo>,
    pub next_page_id: Option<String>,
}
