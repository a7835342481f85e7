use std::sync::Arc;

use chrono::Utc;

use crate::config::SpecConfig;
use crate::engine::{ContainerEngine, EngineError, ImageDetails};
use crate::pagination::{clamp_limit, paginate_offset};

use super::models::{SandboxSpecInfo, SandboxSpecPage};

/// Read-only view of the sandbox specs available in the image store. Specs
/// are never persisted; every call goes back to the engine.
#[derive(Clone)]
pub struct SandboxSpecService {
    engine: Arc<dyn ContainerEngine>,
    config: SpecConfig,
}

impl SandboxSpecService {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SpecConfig) -> Self {
        Self { engine, config }
    }

    fn to_spec(&self, id: String, image: &ImageDetails) -> SandboxSpecInfo {
        SandboxSpecInfo {
            id,
            command: self.config.command_args(),
            initial_env: self.config.initial_env.clone(),
            working_dir: self.config.working_dir.clone(),
            created_at: image.created.unwrap_or_else(Utc::now),
        }
    }

    fn spec_id(&self, image: &ImageDetails) -> String {
        image
            .tags
            .iter()
            .find(|tag| tag.starts_with(&self.config.repository))
            .or_else(|| image.tags.first())
            .cloned()
            .unwrap_or_else(|| short_image_id(&image.id))
    }

    /// Newest first. Engine failures yield an empty page.
    pub async fn search_sandbox_specs(
        &self,
        page_id: Option<&str>,
        limit: Option<usize>,
    ) -> SandboxSpecPage {
        let images = match self.engine.list_images(&self.config.repository).await {
            Ok(images) => images,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list sandbox spec images");
                return SandboxSpecPage {
                    items: Vec::new(),
                    next_page_id: None,
                };
            }
        };

        let mut specs: Vec<SandboxSpecInfo> = images
            .iter()
            .filter(|image| {
                image
                    .tags
                    .iter()
                    .any(|tag| tag.starts_with(&self.config.repository))
            })
            .map(|image| self.to_spec(self.spec_id(image), image))
            .collect();
        specs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let (items, next_page_id) = paginate_offset(specs, page_id, clamp_limit(limit));
        SandboxSpecPage {
            items,
            next_page_id,
        }
    }

    pub async fn get_sandbox_spec(&self, id: &str) -> Option<SandboxSpecInfo> {
        match self.engine.inspect_image(id).await {
            Ok(image) => Some(self.to_spec(id.to_string(), &image)),
            Err(EngineError::NotFound(_)) => None,
            Err(err) => {
                tracing::warn!(sandbox_spec_id = %id, error = %err, "failed to inspect sandbox spec image");
                None
            }
        }
    }

    /// The configured default spec, or else the newest available one.
    pub async fn get_default_sandbox_spec(&self) -> Option<SandboxSpecInfo> {
        if let Some(default_spec) = &self.config.default_spec {
            return self.get_sandbox_spec(default_spec).await;
        }
        self.search_sandbox_specs(None, Some(1))
            .await
            .items
            .into_iter()
            .next()
    }

    pub async fn batch_get_sandbox_specs(&self, ids: &[String]) -> Vec<Option<SandboxSpecInfo>> {
        let mut specs = Vec::with_capacity(ids.len());
        for id in ids {
            specs.push(self.get_sandbox_spec(id).await);
        }
        specs
    }
}

fn short_image_id(id: &str) -> String {
    id.trim_start_matches("sha256:").chars().take(12).collect()
}
