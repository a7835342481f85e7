//! Webhook subscribers attached to conversation event logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox_orchestrator_error::OrchestratorError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::events::{DeliveryStats, EventService, WebhookSettings, WebhookSubscriber, WebhookTransport};
use crate::pagination::{clamp_limit, paginate_from_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriberDefinition {
    Webhook {
        #[serde(default)]
        name: Option<String>,
        url: String,
        /// Event kinds to deliver. Missing means every kind.
        #[serde(default)]
        filter_types: Option<Vec<String>>,
        #[serde(default)]
        max_batch_size: Option<usize>,
        #[serde(default)]
        max_wait_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_api_key: Option<String>,
    },
}

impl SubscriberDefinition {
    fn validate(&self) -> Result<(), OrchestratorError> {
        match self {
            Self::Webhook {
                url,
                max_batch_size,
                ..
            } => {
                let parsed = url::Url::parse(url).map_err(|err| OrchestratorError::InvalidRequest {
                    message: format!("invalid webhook url {url}: {err}"),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(OrchestratorError::InvalidRequest {
                        message: format!("webhook url must be http or https: {url}"),
                    });
                }
                if *max_batch_size == Some(0) {
                    return Err(OrchestratorError::InvalidRequest {
                        message: "max_batch_size must be at least 1".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    fn settings(&self, defaults: &WebhookConfig) -> WebhookSettings {
        match self {
            Self::Webhook {
                url,
                filter_types,
                max_batch_size,
                max_wait_ms,
                session_api_key,
                ..
            } => WebhookSettings {
                url: url.clone(),
                session_api_key: session_api_key.clone(),
                filter_types: filter_types.clone(),
                max_batch_size: max_batch_size.unwrap_or(defaults.max_batch_size),
                max_wait: Duration::from_millis(max_wait_ms.unwrap_or(defaults.max_wait_ms)),
                max_retry_attempts: defaults.max_retry_attempts,
                max_retry_delay: Duration::from_millis(defaults.max_retry_delay_ms),
            },
        }
    }

    /// The definition as shown to API clients.
    fn redacted(&self) -> Self {
        match self.clone() {
            Self::Webhook {
                name,
                url,
                filter_types,
                max_batch_size,
                max_wait_ms,
                ..
            } => Self::Webhook {
                name,
                url,
                filter_types,
                max_batch_size,
                max_wait_ms,
                session_api_key: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub definition: SubscriberDefinition,
    pub created_at: DateTime<Utc>,
    pub stats: DeliveryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SubscriberPage {
    pub items: Vec<SubscriberInfo>,
    pub next_page_id: Option<String>,
}

/// Persisted form of a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSubscriber {
    id: Uuid,
    conversation_id: Uuid,
    definition: SubscriberDefinition,
    created_at: DateTime<Utc>,
}

struct Registered {
    stored: StoredSubscriber,
    handle: WebhookSubscriber,
}

impl Registered {
    fn info(&self) -> SubscriberInfo {
        SubscriberInfo {
            id: self.stored.id,
            conversation_id: self.stored.conversation_id,
            definition: self.stored.definition.redacted(),
            created_at: self.stored.created_at,
            stats: self.handle.stats(),
        }
    }
}

#[derive(Clone)]
pub struct SubscriberService {
    inner: Arc<Inner>,
}

struct Inner {
    events: EventService,
    transport: Arc<dyn WebhookTransport>,
    defaults: WebhookConfig,
    path: Option<PathBuf>,
    /// Creation order.
    registered: Mutex<Vec<Registered>>,
}

impl SubscriberService {
    pub fn new(
        events: EventService,
        transport: Arc<dyn WebhookTransport>,
        defaults: WebhookConfig,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                events,
                transport,
                defaults,
                path,
                registered: Mutex::new(Vec::new()),
            }),
        }
    }

    async fn register(&self, stored: StoredSubscriber) -> Result<Registered, OrchestratorError> {
        let handle = WebhookSubscriber::new(
            stored.id,
            stored.definition.settings(&self.inner.defaults),
            self.inner.transport.clone(),
        );
        let subscribed = self
            .inner
            .events
            .subscribe_with_id(stored.conversation_id, stored.id, Arc::new(handle.clone()))
            .await;
        if !subscribed {
            return Err(OrchestratorError::Conflict {
                message: format!("subscriber {} already exists", stored.id),
            });
        }
        Ok(Registered { stored, handle })
    }

    pub async fn create_subscriber(
        &self,
        conversation_id: Uuid,
        definition: SubscriberDefinition,
    ) -> Result<SubscriberInfo, OrchestratorError> {
        definition.validate()?;
        let stored = StoredSubscriber {
            id: Uuid::new_v4(),
            conversation_id,
            definition,
            created_at: Utc::now(),
        };
        let registered = self.register(stored).await?;
        let info = registered.info();

        let mut all = self.inner.registered.lock().await;
        all.push(registered);
        self.persist(&all).await?;
        tracing::info!(subscriber_id = %info.id, conversation_id = %conversation_id, "subscriber created");
        Ok(info)
    }

    pub async fn get_subscriber(&self, id: Uuid) -> Option<SubscriberInfo> {
        let all = self.inner.registered.lock().await;
        all.iter()
            .find(|registered| registered.stored.id == id)
            .map(Registered::info)
    }

    pub async fn batch_get_subscribers(&self, ids: &[Uuid]) -> Vec<Option<SubscriberInfo>> {
        let all = self.inner.registered.lock().await;
        ids.iter()
            .map(|id| {
                all.iter()
                    .find(|registered| registered.stored.id == *id)
                    .map(Registered::info)
            })
            .collect()
    }

    pub async fn search_subscribers(
        &self,
        conversation_id: Option<Uuid>,
        page_id: Option<&str>,
        limit: Option<usize>,
    ) -> SubscriberPage {
        let infos: Vec<SubscriberInfo> = {
            let all = self.inner.registered.lock().await;
            all.iter()
                .filter(|registered| {
                    conversation_id
                        .map(|conversation_id| registered.stored.conversation_id == conversation_id)
                        .unwrap_or(true)
                })
                .map(Registered::info)
                .collect()
        };
        let (items, next_page_id) =
            paginate_from_key(infos, page_id, clamp_limit(limit), |info| info.id.to_string());
        SubscriberPage {
            items,
            next_page_id,
        }
    }

    /// Unsubscribes (which flushes whatever is still buffered) and forgets
    /// the subscriber.
    pub async fn delete_subscriber(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let removed = {
            let mut all = self.inner.registered.lock().await;
            let Some(position) = all.iter().position(|registered| registered.stored.id == id) else {
                return Ok(false);
            };
            let removed = all.remove(position);
            self.persist(&all).await?;
            removed
        };
        self.inner
            .events
            .unsubscribe(removed.stored.conversation_id, id)
            .await;
        tracing::info!(subscriber_id = %id, "subscriber deleted");
        Ok(true)
    }

    /// Re-registers persisted subscribers that are not active yet. Returns
    /// how many were restored.
    pub async fn reload(&self) -> Result<usize, OrchestratorError> {
        let Some(path) = &self.inner.path else {
            return Ok(0);
        };
        let stored = read_subscribers(path).await?;
        let mut all = self.inner.registered.lock().await;
        let mut restored = 0;
        for subscriber in stored {
            if all
                .iter()
                .any(|registered| registered.stored.id == subscriber.id)
            {
                continue;
            }
            if let Err(err) = subscriber.definition.validate() {
                tracing::warn!(subscriber_id = %subscriber.id, error = %err, "skipping invalid persisted subscriber");
                continue;
            }
            all.push(self.register(subscriber).await?);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(restored, "persisted subscribers restored");
        }
        Ok(restored)
    }

    /// Unsubscribes every subscriber, flushing their buffers. The persisted
    /// definitions are kept for the next start.
    pub async fn close(&self) {
        let drained: Vec<Registered> = self.inner.registered.lock().await.drain(..).collect();
        for registered in drained {
            self.inner
                .events
                .unsubscribe(registered.stored.conversation_id, registered.stored.id)
                .await;
        }
    }

    async fn persist(&self, all: &[Registered]) -> Result<(), OrchestratorError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let stored: Vec<&StoredSubscriber> = all.iter().map(|registered| &registered.stored).collect();
        let raw = serde_json::to_vec_pretty(&stored).map_err(|err| OrchestratorError::Storage {
            message: format!("failed to encode subscribers: {err}"),
        })?;
        write_atomically(path, &raw).await
    }
}

async fn read_subscribers(path: &Path) -> Result<Vec<StoredSubscriber>, OrchestratorError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(OrchestratorError::Storage {
                message: format!("failed to read {}: {err}", path.display()),
            })
        }
    };
    serde_json::from_slice(&raw).map_err(|err| OrchestratorError::Storage {
        message: format!("invalid subscribers file {}: {err}", path.display()),
    })
}

async fn write_atomically(path: &Path, raw: &[u8]) -> Result<(), OrchestratorError> {
    let storage_error = |err: std::io::Error| OrchestratorError::Storage {
        message: format!("failed to write {}: {err}", path.display()),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_error)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, raw).await.map_err(storage_error)?;
    tokio::fs::rename(&tmp, path).await.map_err(storage_error)
}
