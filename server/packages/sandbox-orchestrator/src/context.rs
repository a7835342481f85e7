use std::sync::Arc;

use sandbox_orchestrator_error::OrchestratorError;
use uuid::Uuid;

use crate::callbacks::{CallbackDispatcher, CallbackStore};
use crate::config::OrchestratorConfig;
use crate::conversations::{AgentServerClient, ConversationService, HttpAgentServerClient};
use crate::engine::{self, ContainerEngine};
use crate::events::{EventService, HttpWebhookTransport, WebhookTransport};
use crate::sandbox::{ReadinessWaiter, SandboxManager, SandboxSpecService};
use crate::store::Store;
use crate::subscribers::SubscriberService;

/// Every long-lived component, built once from an [`OrchestratorConfig`].
pub struct AppContext {
    pub config: OrchestratorConfig,
    pub engine: Arc<dyn ContainerEngine>,
    pub sandboxes: SandboxManager,
    pub waiter: ReadinessWaiter,
    pub events: EventService,
    pub subscribers: SubscriberService,
    pub callbacks: CallbackStore,
    pub conversations: ConversationService,
    store: Store,
    dispatcher_subscription: Uuid,
}

impl AppContext {
    pub async fn build(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let engine = engine::build_engine(&config)?;
        let request_timeout = config.webhooks.request_timeout();
        let transport = HttpWebhookTransport::new(request_timeout).map_err(|err| {
            OrchestratorError::Upstream {
                message: err.to_string(),
            }
        })?;
        let agent = HttpAgentServerClient::new(request_timeout)?;
        let store = Store::connect(&config.storage.database_url).await?;
        let context = Self::with_components(
            config,
            engine,
            store,
            Arc::new(agent),
            Arc::new(transport),
        )
        .await?;
        context.subscribers.reload().await?;
        Ok(context)
    }

    /// Wires the services over caller-provided collaborators. Persisted
    /// subscribers are not reloaded.
    pub async fn with_components(
        config: OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
        store: Store,
        agent: Arc<dyn AgentServerClient>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let specs = SandboxSpecService::new(engine.clone(), config.specs.clone());
        let sandboxes = SandboxManager::new(engine.clone(), specs, config.docker.clone());
        let waiter = ReadinessWaiter::new(Arc::new(sandboxes.clone()), config.readiness.clone());

        let events = EventService::new();
        let subscribers = SubscriberService::new(
            events.clone(),
            transport,
            config.webhooks.clone(),
            config.storage.subscribers_path.clone(),
        );

        let callbacks = CallbackStore::new(store.clone());
        let dispatcher = CallbackDispatcher::new(callbacks.clone(), config.webhooks.request_timeout())
            .map_err(|err| OrchestratorError::Upstream {
                message: err.to_string(),
            })?;
        let dispatcher_subscription = events.subscribe_all(Arc::new(dispatcher)).await;

        let conversations = ConversationService::new(
            store.clone(),
            sandboxes.clone(),
            waiter.clone(),
            agent,
            config.docker.agent_server_port.clone(),
        );

        Ok(Self {
            config,
            engine,
            sandboxes,
            waiter,
            events,
            subscribers,
            callbacks,
            conversations,
            store,
            dispatcher_subscription,
        })
    }

    /// Flushes subscribers, joins every pub/sub worker and closes the
    /// database.
    pub async fn shutdown(&self) {
        self.subscribers.close().await;
        self.events.unsubscribe_all(self.dispatcher_subscription).await;
        self.events.shutdown().await;
        self.store.close().await;
        tracing::info!("orchestrator shut down");
    }
}
