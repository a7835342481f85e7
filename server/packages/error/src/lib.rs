use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    PermissionDenied,
    NotFound,
    SandboxSpecNotFound,
    Conflict,
    SandboxError,
    StorageError,
    UpstreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:sandbox-orchestrator:error:invalid_request",
            Self::TokenInvalid => "urn:sandbox-orchestrator:error:token_invalid",
            Self::PermissionDenied => "urn:sandbox-orchestrator:error:permission_denied",
            Self::NotFound => "urn:sandbox-orchestrator:error:not_found",
            Self::SandboxSpecNotFound => "urn:sandbox-orchestrator:error:sandbox_spec_not_found",
            Self::Conflict => "urn:sandbox-orchestrator:error:conflict",
            Self::SandboxError => "urn:sandbox-orchestrator:error:sandbox_error",
            Self::StorageError => "urn:sandbox-orchestrator:error:storage_error",
            Self::UpstreamError => "urn:sandbox-orchestrator:error:upstream_error",
            Self::Timeout => "urn:sandbox-orchestrator:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::PermissionDenied => "Permission Denied",
            Self::NotFound => "Not Found",
            Self::SandboxSpecNotFound => "Sandbox Spec Not Found",
            Self::Conflict => "Conflict",
            Self::SandboxError => "Sandbox Error",
            Self::StorageError => "Storage Error",
            Self::UpstreamError => "Upstream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::SandboxSpecNotFound => 404,
            Self::Conflict => 409,
            Self::SandboxError => 500,
            Self::StorageError => 500,
            Self::UpstreamError => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("permission denied")]
    PermissionDenied { message: Option<String> },
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },
    #[error("sandbox spec not found: {spec_id}")]
    SandboxSpecNotFound { spec_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("sandbox error: {message}")]
    Sandbox { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl OrchestratorError {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: Some(message.into()),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::SandboxSpecNotFound { .. } => ErrorType::SandboxSpecNotFound,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::Sandbox { .. } => ErrorType::SandboxError,
            Self::Storage { .. } => ErrorType::StorageError,
            Self::Upstream { .. } => ErrorType::UpstreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::NotFound { resource, id } => {
                map.insert("resource".to_string(), Value::String(resource.clone()));
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            Self::SandboxSpecNotFound { spec_id } => {
                map.insert("sandboxSpecId".to_string(), Value::String(spec_id.clone()));
            }
            Self::TokenInvalid { message }
            | Self::PermissionDenied { message }
            | Self::Timeout { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::InvalidRequest { .. }
            | Self::Conflict { .. }
            | Self::Sandbox { .. }
            | Self::Storage { .. }
            | Self::Upstream { .. } => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<OrchestratorError> for ProblemDetails {
    fn from(value: OrchestratorError) -> Self {
        value.to_problem_details()
    }
}

impl From<&OrchestratorError> for ProblemDetails {
    fn from(value: &OrchestratorError) -> Self {
        value.to_problem_details()
    }
}
