use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};

use super::{
    ContainerDetails, ContainerEngine, CreateContainerRequest, EngineError, EngineFuture,
    HostPortBinding, ImageDetails,
};

/// [`ContainerEngine`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, EngineError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        Ok(details_from_inspect(response))
    }
}

impl ContainerEngine for DockerEngine {
    fn list_containers<'a>(&'a self, name_prefix: &'a str) -> EngineFuture<'a, Vec<ContainerDetails>> {
        Box::pin(async move {
            let mut filters = HashMap::new();
            filters.insert("name".to_string(), vec![name_prefix.to_string()]);
            let options = ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            };
            let summaries = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(map_error)?;

            let mut containers = Vec::with_capacity(summaries.len());
            for summary in summaries {
                // The daemon's name filter is a substring match.
                let name = summary.names.unwrap_or_default().into_iter().find_map(|name| {
                    let name = name.trim_start_matches('/');
                    name.starts_with(name_prefix).then(|| name.to_string())
                });
                let Some(name) = name else {
                    continue;
                };
                match self.inspect(&name).await {
                    Ok(details) => containers.push(details),
                    Err(EngineError::NotFound(_)) => {
                        tracing::debug!(container = %name, "container disappeared while listing");
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(containers)
        })
    }

    fn inspect_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ContainerDetails> {
        Box::pin(self.inspect(name))
    }

    fn create_container(&self, request: CreateContainerRequest) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            let exposed_ports: HashMap<String, HashMap<(), ()>> = request
                .ports
                .iter()
                .map(|port| (port.container_key(), HashMap::new()))
                .collect();
            let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = request
                .ports
                .iter()
                .map(|port| {
                    (
                        port.container_key(),
                        Some(vec![PortBinding {
                            host_ip: None,
                            host_port: Some(port.host_port.to_string()),
                        }]),
                    )
                })
                .collect();
            let mounts: Vec<Mount> = request
                .volumes
                .iter()
                .map(|volume| Mount {
                    target: Some(volume.target.clone()),
                    source: Some(volume.volume.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    read_only: Some(false),
                    ..Default::default()
                })
                .collect();
            let env: Vec<String> = request
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();

            let options = CreateContainerOptions {
                name: request.name.clone(),
                platform: None,
            };
            let config = Config {
                image: Some(request.image),
                cmd: (!request.command.is_empty()).then_some(request.command),
                env: Some(env),
                labels: Some(request.labels),
                working_dir: Some(request.working_dir),
                exposed_ports: Some(exposed_ports),
                host_config: Some(HostConfig {
                    port_bindings: Some(port_bindings),
                    mounts: Some(mounts),
                    ..Default::default()
                }),
                ..Default::default()
            };

            self.docker
                .create_container(Some(options), config)
                .await
                .map_err(map_error)?;
            Ok(())
        })
    }

    fn start_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
                .map_err(map_error)
        })
    }

    fn stop_container<'a>(&'a self, name: &'a str, grace: Duration) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = StopContainerOptions {
                t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
            };
            self.docker
                .stop_container(name, Some(options))
                .await
                .map_err(map_error)
        })
    }

    fn pause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.docker.pause_container(name).await.map_err(map_error) })
    }

    fn unpause_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.docker.unpause_container(name).await.map_err(map_error) })
    }

    fn remove_container<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.docker
                .remove_container(name, Some(RemoveContainerOptions::default()))
                .await
                .map_err(map_error)
        })
    }

    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: HashMap<String, String>,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                driver_opts: HashMap::new(),
                labels,
            };
            self.docker.create_volume(options).await.map_err(map_error)?;
            Ok(())
        })
    }

    fn remove_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.docker
                .remove_volume(name, None::<RemoveVolumeOptions>)
                .await
                .map_err(map_error)
        })
    }

    fn list_images<'a>(&'a self, repository: &'a str) -> EngineFuture<'a, Vec<ImageDetails>> {
        Box::pin(async move {
            let mut filters = HashMap::new();
            filters.insert("reference".to_string(), vec![repository.to_string()]);
            let options = ListImagesOptions::<String> {
                filters,
                ..Default::default()
            };
            let images = self
                .docker
                .list_images(Some(options))
                .await
                .map_err(map_error)?;
            Ok(images
                .into_iter()
                .map(|image| ImageDetails {
                    id: image.id,
                    tags: image.repo_tags,
                    created: Utc.timestamp_opt(image.created, 0).single(),
                })
                .collect())
        })
    }

    fn inspect_image<'a>(&'a self, reference: &'a str) -> EngineFuture<'a, ImageDetails> {
        Box::pin(async move {
            let image = self
                .docker
                .inspect_image(reference)
                .await
                .map_err(map_error)?;
            Ok(ImageDetails {
                id: image.id.unwrap_or_else(|| reference.to_string()),
                tags: image.repo_tags.unwrap_or_default(),
                created: image.created.as_deref().and_then(parse_timestamp),
            })
        })
    }
}

fn map_error(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => EngineError::Api(other.to_string()),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|created| created.with_timezone(&Utc))
}

fn details_from_inspect(response: ContainerInspectResponse) -> ContainerDetails {
    let name = response
        .name
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let status = response
        .state
        .and_then(|state| state.status)
        .map(|status| status.to_string())
        .unwrap_or_default();
    let created = response.created.as_deref().and_then(parse_timestamp);
    let (labels, env) = match response.config {
        Some(config) => (
            config.labels.unwrap_or_default(),
            config.env.unwrap_or_default(),
        ),
        None => (HashMap::new(), Vec::new()),
    };
    let ports: BTreeMap<String, Vec<HostPortBinding>> = response
        .network_settings
        .and_then(|settings| settings.ports)
        .unwrap_or_default()
        .into_iter()
        .map(|(container_port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|PortBinding { host_ip, host_port }| {
                    host_port
                        .filter(|port| !port.is_empty())
                        .map(|host_port| HostPortBinding { host_ip, host_port })
                })
                .collect();
            (container_port, bindings)
        })
        .collect();

    ContainerDetails {
        name,
        status,
        created,
        labels,
        env,
        ports,
    }
}
