//! Conversations bound to a sandbox's agent server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox_orchestrator_error::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::Caller;
use crate::pagination::{clamp_limit, parse_offset};
use crate::sandbox::{ReadinessWaiter, SandboxManager, SandboxStatus};
use crate::store::{from_millis, now, to_millis, Store, StoreError};

pub const SESSION_API_KEY_HEADER: &str = "X-Session-API-Key";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent server request failed: {0}")]
    Request(String),
    #[error("agent server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<AgentError> for OrchestratorError {
    fn from(err: AgentError) -> Self {
        OrchestratorError::Upstream {
            message: err.to_string(),
        }
    }
}

pub type AgentFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AgentError>> + Send + 'a>>;

/// Body sent to the agent server when a conversation starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConversationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
}

pub trait AgentServerClient: Send + Sync {
    fn start_conversation<'a>(
        &'a self,
        agent_url: &'a str,
        session_api_key: Option<&'a str>,
        request: &'a AgentConversationRequest,
    ) -> AgentFuture<'a, Value>;
}

#[derive(Debug, Clone)]
pub struct HttpAgentServerClient {
    client: reqwest::Client,
}

impl HttpAgentServerClient {
    pub fn new(request_timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| AgentError::Request(err.to_string()))?;
        Ok(Self { client })
    }
}

impl AgentServerClient for HttpAgentServerClient {
    fn start_conversation<'a>(
        &'a self,
        agent_url: &'a str,
        session_api_key: Option<&'a str>,
        request: &'a AgentConversationRequest,
    ) -> AgentFuture<'a, Value> {
        Box::pin(async move {
            let url = format!("{}/api/conversations", agent_url.trim_end_matches('/'));
            let mut builder = self.client.post(&url).json(request);
            if let Some(key) = session_api_key {
                builder = builder.header(SESSION_API_KEY_HEADER, key);
            }
            let response = builder
                .send()
                .await
                .map_err(|err| AgentError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AgentError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let body = response
                .bytes()
                .await
                .map_err(|err| AgentError::Request(err.to_string()))?;
            if body.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&body).map_err(|err| AgentError::Request(err.to_string()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxedConversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub sandbox_id: Uuid,
    pub created_by_user_id: String,
    pub created_at: DateTime<Utc>,
    /// Current status of the backing sandbox; `DELETED` once it is gone.
    pub sandbox_status: SandboxStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StartConversationRequest {
    #[serde(default)]
    pub sandbox_id: Option<Uuid>,
    #[serde(default)]
    pub sandbox_spec_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxedConversationPage {
    pub items: Vec<SandboxedConversation>,
    pub next_page_id: Option<String>,
}

struct ConversationRecord {
    id: Uuid,
    title: Option<String>,
    sandbox_id: Uuid,
    created_by_user_id: String,
    created_at: DateTime<Utc>,
}

fn record_from_row(row: &SqliteRow) -> Result<ConversationRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let sandbox_id: String = row.try_get("sandbox_id")?;
    Ok(ConversationRecord {
        id: Uuid::parse_str(&id).map_err(|err| StoreError::decode("id", err))?,
        title: row.try_get("title")?,
        sandbox_id: Uuid::parse_str(&sandbox_id).map_err(|err| StoreError::decode("sandbox_id", err))?,
        created_by_user_id: row.try_get("created_by_user_id")?,
        created_at: from_millis("created_at", row.try_get("created_at")?)?,
    })
}

#[derive(Clone)]
pub struct ConversationService {
    store: Store,
    sandboxes: SandboxManager,
    waiter: ReadinessWaiter,
    agent: Arc<dyn AgentServerClient>,
    /// Name of the exposed port the agent server listens on.
    agent_server_port: String,
}

impl ConversationService {
    pub fn new(
        store: Store,
        sandboxes: SandboxManager,
        waiter: ReadinessWaiter,
        agent: Arc<dyn AgentServerClient>,
        agent_server_port: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sandboxes,
            waiter,
            agent,
            agent_server_port: agent_server_port.into(),
        }
    }

    /// Waits for the sandbox (starting one when no id is given), asks its
    /// agent server to open a conversation and records it.
    pub async fn start_conversation(
        &self,
        caller: &Caller,
        request: StartConversationRequest,
    ) -> Result<SandboxedConversation, OrchestratorError> {
        if let Some(sandbox_id) = request.sandbox_id {
            let sandbox = self
                .sandboxes
                .get_sandbox(sandbox_id)
                .await
                .ok_or_else(|| OrchestratorError::not_found("sandbox", sandbox_id))?;
            if !caller.can_access(&sandbox.created_by_user_id) {
                return Err(OrchestratorError::permission_denied(format!(
                    "sandbox {sandbox_id} belongs to another user"
                )));
            }
        }

        let sandbox = self
            .waiter
            .wait_for_sandbox(caller, request.sandbox_id, request.sandbox_spec_id.as_deref())
            .await?;
        let agent_url = sandbox
            .exposed_url(&self.agent_server_port)
            .or(sandbox.url.as_deref())
            .ok_or_else(|| OrchestratorError::Sandbox {
                message: format!("sandbox {} exposes no agent server url", sandbox.id),
            })?
            .to_string();

        let body = AgentConversationRequest {
            title: request.title.clone(),
            initial_message: request.initial_message,
        };
        let response = self
            .agent
            .start_conversation(&agent_url, sandbox.session_api_key.as_deref(), &body)
            .await?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::new_v4);

        let record = ConversationRecord {
            id,
            title: request.title,
            sandbox_id: sandbox.id,
            created_by_user_id: caller.user_id.clone(),
            created_at: now(),
        };
        sqlx::query(
            r#"INSERT INTO conversations (id, title, sandbox_id, created_by_user_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.title)
        .bind(record.sandbox_id.to_string())
        .bind(&record.created_by_user_id)
        .bind(to_millis(record.created_at))
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        tracing::info!(
            conversation_id = %record.id,
            sandbox_id = %record.sandbox_id,
            created_by_user_id = %record.created_by_user_id,
            "conversation started"
        );
        Ok(Self::with_status(record, sandbox.status))
    }

    fn with_status(record: ConversationRecord, sandbox_status: SandboxStatus) -> SandboxedConversation {
        SandboxedConversation {
            id: record.id,
            title: record.title,
            sandbox_id: record.sandbox_id,
            created_by_user_id: record.created_by_user_id,
            created_at: record.created_at,
            sandbox_status,
        }
    }

    async fn resolve(&self, record: ConversationRecord) -> SandboxedConversation {
        let status = self
            .sandboxes
            .get_sandbox(record.sandbox_id)
            .await
            .map(|sandbox| sandbox.status)
            .unwrap_or(SandboxStatus::Deleted);
        Self::with_status(record, status)
    }

    /// Conversations of other users read as missing unless the caller is an
    /// admin.
    pub async fn get_conversation(
        &self,
        caller: &Caller,
        id: Uuid,
    ) -> Result<Option<SandboxedConversation>, OrchestratorError> {
        let row = sqlx::query(
            "SELECT id, title, sandbox_id, created_by_user_id, created_at FROM conversations WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row)?;
        if !caller.can_access(&record.created_by_user_id) {
            return Ok(None);
        }
        Ok(Some(self.resolve(record).await))
    }

    /// Sandbox a recorded conversation is bound to, regardless of owner.
    pub async fn sandbox_of(&self, id: Uuid) -> Result<Option<Uuid>, OrchestratorError> {
        let row = sqlx::query("SELECT sandbox_id FROM conversations WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("sandbox_id").map_err(StoreError::from)?;
        let sandbox_id =
            Uuid::parse_str(&raw).map_err(|err| StoreError::decode("sandbox_id", err))?;
        Ok(Some(sandbox_id))
    }

    pub async fn batch_get_conversations(
        &self,
        caller: &Caller,
        ids: &[Uuid],
    ) -> Result<Vec<Option<SandboxedConversation>>, OrchestratorError> {
        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            conversations.push(self.get_conversation(caller, *id).await?);
        }
        Ok(conversations)
    }

    /// Newest first, offset cursor.
    pub async fn search_conversations(
        &self,
        caller: &Caller,
        page_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<SandboxedConversationPage, OrchestratorError> {
        let offset = parse_offset(page_id);
        let limit = clamp_limit(limit);
        let rows = sqlx::query(
            r#"SELECT id, title, sandbox_id, created_by_user_id, created_at
               FROM conversations
               WHERE ?1 IS NULL OR created_by_user_id = ?1
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?2 OFFSET ?3"#,
        )
        .bind(caller.owner_filter())
        .bind(limit as i64 + 1)
        .bind(offset as i64)
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let next_page_id = if records.len() > limit {
            records.truncate(limit);
            Some((offset + limit).to_string())
        } else {
            None
        };
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.resolve(record).await);
        }
        Ok(SandboxedConversationPage {
            items,
            next_page_id,
        })
    }
}
