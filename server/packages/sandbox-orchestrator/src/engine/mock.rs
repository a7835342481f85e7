//! In-memory container engine used by `engine = "mock"` and by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{
    ContainerDetails, ContainerEngine, CreateContainerRequest, EngineError, EngineFuture,
    HostPortBinding, ImageDetails, PortMapping,
};

#[derive(Debug, Clone)]
struct MockContainer {
    status: String,
    created: DateTime<Utc>,
    labels: HashMap<String, String>,
    env: Vec<String>,
    ports: Vec<PortMapping>,
}

#[derive(Debug)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    volumes: BTreeSet<String>,
    images: Vec<ImageDetails>,
    calls: Vec<String>,
    fail_with: Option<String>,
    failing_operations: HashMap<String, String>,
    start_status: String,
    last_created: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                containers: BTreeMap::new(),
                volumes: BTreeSet::new(),
                images: Vec::new(),
                calls: Vec::new(),
                fail_with: None,
                failing_operations: HashMap::new(),
                start_status: "running".to_string(),
                last_created: None,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn add_image(&self, tag: &str) {
        self.with_state(|state| {
            let index = state.images.len();
            let created = next_created(state);
            state.images.push(ImageDetails {
                id: format!("sha256:{:064x}", index + 1),
                tags: vec![tag.to_string()],
                created: Some(created),
            });
        });
    }

    /// Overrides the runtime status of an existing container.
    pub fn set_status(&self, name: &str, status: &str) -> bool {
        self.with_state(|state| match state.containers.get_mut(name) {
            Some(container) => {
                container.status = status.to_string();
                true
            }
            None => false,
        })
    }

    /// Status a container reports right after `start_container`.
    pub fn set_start_status(&self, status: &str) {
        self.with_state(|state| state.start_status = status.to_string());
    }

    /// Makes every subsequent call fail with an API error until cleared.
    pub fn fail_with(&self, message: Option<&str>) {
        self.with_state(|state| state.fail_with = message.map(str::to_string));
    }

    /// Makes one engine operation (e.g. `inspect_container`) fail until
    /// cleared with `None`.
    pub fn fail_operation(&self, operation: &str, message: Option<&str>) {
        self.with_state(|state| match message {
            Some(message) => {
                state
                    .failing_operations
                    .insert(operation.to_string(), message.to_string());
            }
            None => {
                state.failing_operations.remove(operation);
            }
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.with_state(|state| state.volumes.contains(name))
    }

    pub fn container_names(&self) -> Vec<String> {
        self.with_state(|state| state.containers.keys().cloned().collect())
    }

    /// Inserts a container directly, bypassing the create call.
    pub fn insert_container(&self, name: &str, status: &str, labels: HashMap<String, String>) {
        self.with_state(|state| {
            let created = next_created(state);
            state.containers.insert(
                name.to_string(),
                MockContainer {
                    status: status.to_string(),
                    created,
                    labels,
                    env: Vec::new(),
                    ports: Vec::new(),
                },
            );
        });
    }

    fn call<T>(
        &self,
        name: String,
        f: impl FnOnce(&mut MockState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.with_state(|state| {
            let operation = name.split_whitespace().next().unwrap_or_default();
            let failure = state
                .fail_with
                .clone()
                .or_else(|| state.failing_operations.get(operation).cloned());
            state.calls.push(name);
            if let Some(message) = failure {
                return Err(EngineError::Api(message));
            }
            f(state)
        })
    }
}

fn next_created(state: &mut MockState) -> DateTime<Utc> {
    let mut created = Utc::now();
    if let Some(last) = state.last_created {
        if created <= last {
            created = last + chrono::Duration::milliseconds(1);
        }
    }
    state.last_created = Some(created);
    created
}

fn details(name: &str, container: &MockContainer) -> ContainerDetails {
    // Like Docker, port bindings are only reported while the container is up.
    let ports = if matches!(container.status.as_str(), "running" | "paused") {
        container
            .ports
            .iter()
            .map(|port| {
                (
                    port.container_key(),
                    vec![HostPortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: port.host_port.to_string(),
                    }],
                )
            })
            .collect()
    } else {
        BTreeMap::new()
    };
    ContainerDetails {
        name: name.to_string(),
        status: container.status.clone(),
        created: Some(container.created),
        labels: container.labels.clone(),
        env: container.env.clone(),
        ports,
    }
}

fn container_mut<'s>(
    state: &'s mut MockState,
    name: &str,
) -> Result<&'s mut MockContainer, EngineError> {
    state
        .containers
        .get_mut(name)
        .ok_or_else(|| EngineError::NotFound(format!("No such container: {name}")))
}

impl ContainerEngine for MockEngine {
    fn list_containers<'a>(&'a self, name_prefix: &'a str) -> EngineFuture<'a, Vec<ContainerDetails>> {
        let result = self.call(format!("list_containers {name_prefix}"), |state| {
            Ok(state
                .containers
                .iter()
                .filter(|(name, _)| name.starts_with(name_prefix))
                .map(|(name, container)| details(name, container))
                .collect())
        });
        Box::pin(async move { result })
    }

    fn inspect_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ContainerDetails> {
        let result = self.call(format!("inspect_container {name}"), |state| {
            let container = container_mut(state, name)?;
            Ok(details(name, container))
        });
        Box::pin(async move { result })
    }

    fn create_container(&self, request: CreateContainerRequest) -> EngineFuture<'_, ()> {
        let result = self.call(format!("create_container {}", request.name), |state| {
            if state.containers.contains_key(&request.name) {
                return Err(EngineError::Api(format!(
                    "Conflict. The container name {} is already in use",
                    request.name
                )));
            }
            for volume in &request.volumes {
                state.volumes.insert(volume.volume.clone());
            }
            let created = next_created(state);
            state.containers.insert(
                request.name.clone(),
                MockContainer {
                    status: "created".to_string(),
                    created,
                    labels: request.labels.clone(),
                    env: request
                        .env
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect(),
                    ports: request.ports.clone(),
                },
            );
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn start_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        let result = self.call(format!("start_container {name}"), |state| {
            let status = state.start_status.clone();
            let container = container_mut(state, name)?;
            container.status = status;
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn stop_container<'a>(&'a self, name: &'a str, _grace: Duration) -> EngineFuture<'a, ()> {
        let result = self.call(format!("stop_container {name}"), |state| {
            let container = container_mut(state, name)?;
            container.status = "exited".to_string();
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn pause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        let result = self.call(format!("pause_container {name}"), |state| {
            let container = container_mut(state, name)?;
            if container.status != "running" {
                return Err(EngineError::Api(format!("Container {name} is not running")));
            }
            container.status = "paused".to_string();
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn unpause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        let result = self.call(format!("unpause_container {name}"), |state| {
            let container = container_mut(state, name)?;
            if container.status != "paused" {
                return Err(EngineError::Api(format!("Container {name} is not paused")));
            }
            container.status = "running".to_string();
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn remove_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        let result = self.call(format!("remove_container {name}"), |state| {
            let container = container_mut(state, name)?;
            if matches!(container.status.as_str(), "running" | "paused") {
                return Err(EngineError::Api(format!(
                    "You cannot remove a running container {name}"
                )));
            }
            state.containers.remove(name);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        _labels: HashMap<String, String>,
    ) -> EngineFuture<'a, ()> {
        let result = self.call(format!("create_volume {name}"), |state| {
            state.volumes.insert(name.to_string());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn remove_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        let result = self.call(format!("remove_volume {name}"), |state| {
            if state.volumes.remove(name) {
                Ok(())
            } else {
                Err(EngineError::NotFound(format!("get {name}: no such volume")))
            }
        });
        Box::pin(async move { result })
    }

    fn list_images<'a>(&'a self, repository: &'a str) -> EngineFuture<'a, Vec<ImageDetails>> {
        let result = self.call(format!("list_images {repository}"), |state| {
            Ok(state
                .images
                .iter()
                .filter(|image| image.tags.iter().any(|tag| tag.starts_with(repository)))
                .cloned()
                .collect())
        });
        Box::pin(async move { result })
    }

    fn inspect_image<'a>(&'a self, reference: &'a str) -> EngineFuture<'a, ImageDetails> {
        let result = self.call(format!("inspect_image {reference}"), |state| {
            state
                .images
                .iter()
                .find(|image| image.id == reference || image.tags.iter().any(|tag| tag == reference))
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("No such image: {reference}")))
        });
        Box::pin(async move { result })
    }
}
