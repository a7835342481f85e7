use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use sandbox_orchestrator_error::OrchestratorError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::Caller;
use crate::config::DockerConfig;
use crate::engine::{
    ContainerDetails, ContainerEngine, CreateContainerRequest, EngineError, PortMapping,
    VolumeMount,
};
use crate::pagination::{clamp_limit, paginate_offset};

use super::models::{ExposedUrl, SandboxInfo, SandboxPage, SandboxStatus};
use super::naming::{
    generate_session_api_key, SandboxNaming, CREATED_BY_LABEL, SESSION_API_KEY_VARIABLE,
    SPEC_LABEL,
};
use super::ports::PortAllocator;
use super::specs::SandboxSpecService;

/// Translates sandbox operations into container engine calls. No sandbox
/// state is kept here: every read is rebuilt from the engine.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    specs: SandboxSpecService,
    naming: SandboxNaming,
    docker: DockerConfig,
    ports: PortAllocator,
    id_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

fn sandbox_error(action: &str, err: EngineError) -> OrchestratorError {
    OrchestratorError::Sandbox {
        message: format!("failed to {action}: {err}"),
    }
}

impl SandboxManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        specs: SandboxSpecService,
        docker: DockerConfig,
    ) -> Self {
        let naming = SandboxNaming::new(
            docker.container_name_prefix.clone(),
            docker.volume_name_prefix.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                engine,
                specs,
                naming,
                docker,
                ports: PortAllocator::new(),
                id_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn naming(&self) -> &SandboxNaming {
        &self.inner.naming
    }

    pub fn specs(&self) -> &SandboxSpecService {
        &self.inner.specs
    }

    fn container_to_info(&self, container: &ContainerDetails) -> Option<SandboxInfo> {
        let id = self.inner.naming.sandbox_id(&container.name)?;
        let created_by_user_id = container.label(CREATED_BY_LABEL)?.to_string();
        let sandbox_spec_id = container.label(SPEC_LABEL)?.to_string();
        let status = SandboxStatus::from_runtime_status(&container.status);

        let mut url = None;
        let mut session_api_key = None;
        let mut exposed_urls = Vec::new();
        if status == SandboxStatus::Running {
            let docker = &self.inner.docker;
            url = container
                .ports
                .values()
                .find_map(|bindings| bindings.first())
                .map(|binding| docker.format_url(&binding.host_port));
            session_api_key = container
                .env_var(SESSION_API_KEY_VARIABLE)
                .map(str::to_string);
            exposed_urls = docker
                .exposed_ports
                .iter()
                .filter_map(|exposed| {
                    let key = format!("{}/tcp", exposed.container_port);
                    let binding = container.ports.get(&key)?.first()?;
                    Some(ExposedUrl {
                        name: exposed.name.clone(),
                        url: docker.format_url(&binding.host_port),
                    })
                })
                .collect();
        }

        Some(SandboxInfo {
            id,
            created_by_user_id,
            sandbox_spec_id,
            status,
            url,
            session_api_key,
            exposed_urls,
            created_at: container.created.unwrap_or_else(Utc::now),
        })
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.id_locks.lock().await;
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the caller's handle and forgets the id's lock once nobody else
    /// holds or waits on it. Handles are only cloned under the map lock.
    async fn release_lock(&self, id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.id_locks.lock().await;
        drop(lock);
        if locks
            .get(&id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.inner.id_locks.lock().await.len()
    }

    /// Inspects the sandbox's container and checks the caller may mutate it.
    /// `Ok(None)` when the sandbox does not exist.
    async fn inspect_for_mutation(
        &self,
        caller: &Caller,
        id: Uuid,
    ) -> Result<Option<ContainerDetails>, OrchestratorError> {
        let name = self.inner.naming.container_name(id);
        let container = match self.inner.engine.inspect_container(&name).await {
            Ok(container) => container,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(sandbox_error("inspect sandbox", err)),
        };
        if let Some(owner) = container.label(CREATED_BY_LABEL) {
            if !caller.can_access(owner) {
                return Err(OrchestratorError::permission_denied(format!(
                    "sandbox {id} belongs to another user"
                )));
            }
        }
        Ok(Some(container))
    }

    /// Sandboxes newest first, optionally restricted to one creator. Engine
    /// failures yield an empty page.
    pub async fn search_sandboxes(
        &self,
        created_by_user_id: Option<&str>,
        page_id: Option<&str>,
        limit: Option<usize>,
    ) -> SandboxPage {
        let containers = match self
            .inner
            .engine
            .list_containers(self.inner.naming.container_prefix())
            .await
        {
            Ok(containers) => containers,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list sandbox containers");
                return SandboxPage::empty();
            }
        };

        let mut sandboxes: Vec<SandboxInfo> = containers
            .iter()
            .filter_map(|container| self.container_to_info(container))
            .filter(|sandbox| {
                created_by_user_id
                    .map(|owner| sandbox.created_by_user_id == owner)
                    .unwrap_or(true)
            })
            .collect();
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let (items, next_page_id) = paginate_offset(sandboxes, page_id, clamp_limit(limit));
        SandboxPage {
            items,
            next_page_id,
        }
    }

    pub async fn get_sandbox(&self, id: Uuid) -> Option<SandboxInfo> {
        let name = self.inner.naming.container_name(id);
        match self.inner.engine.inspect_container(&name).await {
            Ok(container) => self.container_to_info(&container),
            Err(EngineError::NotFound(_)) => None,
            Err(err) => {
                tracing::warn!(sandbox_id = %id, error = %err, "failed to inspect sandbox");
                None
            }
        }
    }

    pub async fn batch_get_sandboxes(&self, ids: &[Uuid]) -> Vec<Option<SandboxInfo>> {
        let mut sandboxes = Vec::with_capacity(ids.len());
        for id in ids {
            sandboxes.push(self.get_sandbox(*id).await);
        }
        sandboxes
    }

    /// Launches a sandbox from `sandbox_spec_id`, or from the default spec.
    /// The returned info reflects the container as created, before the
    /// engine reports it running.
    pub async fn start_sandbox(
        &self,
        caller: &Caller,
        sandbox_spec_id: Option<&str>,
    ) -> Result<SandboxInfo, OrchestratorError> {
        let spec = match sandbox_spec_id {
            Some(spec_id) => self.inner.specs.get_sandbox_spec(spec_id).await,
            None => self.inner.specs.get_default_sandbox_spec().await,
        }
        .ok_or_else(|| OrchestratorError::SandboxSpecNotFound {
            spec_id: sandbox_spec_id.unwrap_or("default").to_string(),
        })?;

        let id = Uuid::new_v4();
        let name = self.inner.naming.container_name(id);
        let volume = self.inner.naming.volume_name(id);
        let exposed_ports = &self.inner.docker.exposed_ports;

        let mut env: BTreeMap<String, String> = spec.initial_env.clone();
        env.insert(
            SESSION_API_KEY_VARIABLE.to_string(),
            generate_session_api_key(),
        );

        let mut labels = HashMap::new();
        labels.insert(CREATED_BY_LABEL.to_string(), caller.user_id.clone());
        labels.insert(SPEC_LABEL.to_string(), spec.id.clone());

        let reservation = self
            .inner
            .ports
            .reserve(exposed_ports.len())
            .await
            .map_err(|err| OrchestratorError::Sandbox {
                message: format!("failed to allocate host port: {err}"),
            })?;
        let mut ports = Vec::with_capacity(exposed_ports.len());
        for (exposed, host_port) in exposed_ports.iter().zip(reservation.ports.iter().copied()) {
            ports.push(PortMapping {
                container_port: exposed.container_port,
                host_port,
            });
            env.insert(exposed.name.clone(), host_port.to_string());
        }

        let request = CreateContainerRequest {
            name: name.clone(),
            image: spec.id.clone(),
            command: spec.command.clone(),
            env,
            labels: labels.clone(),
            ports,
            volumes: vec![VolumeMount {
                volume: volume.clone(),
                target: spec.working_dir.clone(),
            }],
            working_dir: spec.working_dir.clone(),
        };

        let engine = &self.inner.engine;
        engine
            .create_volume(&volume, labels)
            .await
            .map_err(|err| sandbox_error("create sandbox volume", err))?;
        if let Err(err) = engine.create_container(request).await {
            if let Err(cleanup) = engine.remove_volume(&volume).await {
                tracing::warn!(volume = %volume, error = %cleanup, "failed to remove volume after failed create");
            }
            return Err(sandbox_error("create sandbox container", err));
        }
        let created = match engine.inspect_container(&name).await {
            Ok(created) => created,
            Err(err) => {
                self.discard_container(&name, &volume).await;
                return Err(sandbox_error("inspect sandbox container", err));
            }
        };
        if let Err(err) = engine.start_container(&name).await {
            self.discard_container(&name, &volume).await;
            return Err(sandbox_error("start sandbox container", err));
        }
        drop(reservation);

        let info = self
            .container_to_info(&created)
            .ok_or_else(|| OrchestratorError::Sandbox {
                message: format!("container {name} is not a readable sandbox"),
            })?;
        tracing::info!(
            sandbox_id = %id,
            sandbox_spec_id = %spec.id,
            created_by_user_id = %caller.user_id,
            "sandbox started"
        );
        Ok(info)
    }

    async fn discard_container(&self, name: &str, volume: &str) {
        let engine = &self.inner.engine;
        if let Err(err) = engine.remove_container(name).await {
            tracing::warn!(
                container = %name,
                error = %err,
                "failed to remove container after failed start"
            );
        }
        if let Err(err) = engine.remove_volume(volume).await {
            tracing::warn!(
                volume = %volume,
                error = %err,
                "failed to remove volume after failed start"
            );
        }
    }

    /// Pauses a running sandbox. Already-paused or stopped sandboxes are
    /// left alone. `false` only when the sandbox does not exist.
    pub async fn pause_sandbox(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let lock = self.lock_for(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.pause_locked(caller, id).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn pause_locked(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let Some(container) = self.inspect_for_mutation(caller, id).await? else {
            return Ok(false);
        };
        if container.status == "running" {
            match self.inner.engine.pause_container(&container.name).await {
                Ok(()) => tracing::info!(sandbox_id = %id, "sandbox paused"),
                Err(EngineError::NotFound(_)) => return Ok(false),
                Err(err) => return Err(sandbox_error("pause sandbox", err)),
            }
        }
        Ok(true)
    }

    /// Unpauses a paused sandbox or starts an exited one. Running sandboxes
    /// are left alone. `false` only when the sandbox does not exist.
    pub async fn resume_sandbox(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let lock = self.lock_for(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(caller, id).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn resume_locked(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let Some(container) = self.inspect_for_mutation(caller, id).await? else {
            return Ok(false);
        };
        let engine = &self.inner.engine;
        let result = match container.status.as_str() {
            "paused" => engine.unpause_container(&container.name).await,
            "exited" => engine.start_container(&container.name).await,
            _ => Ok(()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(err) => Err(sandbox_error("resume sandbox", err)),
        }
    }

    /// Stops (bounded grace period) and removes the sandbox container, then
    /// removes its volume on a best-effort basis.
    pub async fn delete_sandbox(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let lock = self.lock_for(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(caller, id).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn delete_locked(&self, caller: &Caller, id: Uuid) -> Result<bool, OrchestratorError> {
        let Some(container) = self.inspect_for_mutation(caller, id).await? else {
            return Ok(false);
        };
        let engine = &self.inner.engine;
        if matches!(container.status.as_str(), "running" | "paused") {
            match engine
                .stop_container(&container.name, self.inner.docker.stop_timeout())
                .await
            {
                Ok(()) => {}
                Err(EngineError::NotFound(_)) => return Ok(false),
                Err(err) => return Err(sandbox_error("stop sandbox", err)),
            }
        }
        match engine.remove_container(&container.name).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(sandbox_error("remove sandbox", err)),
        }

        let volume = self.inner.naming.volume_name(id);
        match engine.remove_volume(&volume).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(sandbox_id = %id, volume = %volume, error = %err, "failed to remove sandbox volume");
            }
        }
        tracing::info!(sandbox_id = %id, "sandbox deleted");
        Ok(true)
    }
}
