//! Container engine seam.
//!
//! [`ContainerEngine`] is the narrow slice of the Docker API the sandbox
//! manager needs. The Docker implementation talks to the local daemon through
//! bollard; [`mock::MockEngine`] keeps everything in memory.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox_orchestrator_error::OrchestratorError;
use thiserror::Error;

use crate::config::{EngineKind, OrchestratorConfig};

pub mod docker;
pub mod mock;

pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("container engine error: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(value: EngineError) -> Self {
        Self::Sandbox {
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPortBinding {
    pub host_ip: Option<String>,
    pub host_port: String,
}

/// Inspected container attributes.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub name: String,
    /// Raw runtime status (`running`, `paused`, `exited`, ...).
    pub status: String,
    pub created: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    /// `KEY=value` entries as declared on the container.
    pub env: Vec<String>,
    /// Container port key (`8000/tcp`) to host bindings, ordered by key.
    pub ports: BTreeMap<String, Vec<HostPortBinding>>,
}

impl ContainerDetails {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| match entry.split_once('=') {
            Some((name, value)) if name == key => Some(value),
            _ => None,
        })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

impl PortMapping {
    pub fn container_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    pub id: String,
    pub tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
}

pub trait ContainerEngine: Send + Sync {
    /// Lists every container (running or not) whose name starts with `name_prefix`.
    fn list_containers<'a>(&'a self, name_prefix: &'a str) -> EngineFuture<'a, Vec<ContainerDetails>>;

    fn inspect_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ContainerDetails>;

    fn create_container(&self, request: CreateContainerRequest) -> EngineFuture<'_, ()>;

    fn start_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()>;

    fn stop_container<'a>(&'a self, name: &'a str, grace: Duration) -> EngineFuture<'a, ()>;

    fn pause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()>;

    fn unpause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()>;

    fn remove_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()>;

    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: HashMap<String, String>,
    ) -> EngineFuture<'a, ()>;

    fn remove_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()>;

    /// Images with at least one tag in `repository`.
    fn list_images<'a>(&'a self, repository: &'a str) -> EngineFuture<'a, Vec<ImageDetails>>;

    fn inspect_image<'a>(&'a self, reference: &'a str) -> EngineFuture<'a, ImageDetails>;
}

/// Compile-time engine registry.
pub fn build_engine(config: &OrchestratorConfig) -> Result<Arc<dyn ContainerEngine>, EngineError> {
    match config.engine {
        EngineKind::Docker => Ok(Arc::new(docker::DockerEngine::connect()?)),
        EngineKind::Mock => {
            let engine = mock::MockEngine::new();
            engine.add_image(&format!("{}:latest", config.specs.repository));
            Ok(Arc::new(engine))
        }
    }
}
