use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use sandbox_orchestrator_error::{ErrorType, OrchestratorError, ProblemDetails};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::auth::Caller;
use crate::callbacks::{
    CreateEventCallbackRequest, EventCallback, EventCallbackPage, EventCallbackProcessor,
    EventCallbackQuery, EventCallbackResult, EventCallbackResultPage, EventCallbackResultQuery,
    EventCallbackResultSortOrder, EventCallbackResultStatus, EventCallbackStatus,
    UpdateEventCallbackRequest,
};
use crate::context::AppContext;
use crate::conversations::{
    SandboxedConversation, SandboxedConversationPage, StartConversationRequest,
    SESSION_API_KEY_HEADER,
};
use crate::events::{DeliveryStats, Event, EventPage, NewEvent};
use crate::sandbox::{
    ExposedUrl, SandboxInfo, SandboxPage, SandboxSpecInfo, SandboxSpecPage, SandboxStatus,
};
use crate::store::StoreError;
use crate::subscribers::{SubscriberDefinition, SubscriberInfo, SubscriberPage};

pub const USER_ID_HEADER: &str = "x-user-id";
const LOG_HTTP_ENV: &str = "SANDBOX_ORCHESTRATOR_LOG_HTTP";
const LOG_HTTP_HEADERS_ENV: &str = "SANDBOX_ORCHESTRATOR_LOG_HTTP_HEADERS";

pub struct AppState {
    auth: AuthConfig,
    context: AppContext,
}

impl AppState {
    pub fn new(auth: AuthConfig, context: AppContext) -> Self {
        Self { auth, context }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    fn caller(&self, headers: &HeaderMap) -> Caller {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok());
        Caller::resolve(user_id, &self.context.config.auth.admin_users)
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/sandboxes", get(batch_get_sandboxes).post(start_sandbox))
        .route("/sandboxes/search", get(search_sandboxes))
        .route("/sandboxes/:sandbox_id", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/:sandbox_id/pause", post(pause_sandbox))
        .route("/sandboxes/:sandbox_id/resume", post(resume_sandbox))
        .route("/sandbox-specs", get(batch_get_sandbox_specs))
        .route("/sandbox-specs/search", get(search_sandbox_specs))
        .route("/sandbox-specs/:spec_id", get(get_sandbox_spec))
        .route(
            "/conversations",
            get(batch_get_conversations).post(start_conversation),
        )
        .route("/conversations/search", get(search_conversations))
        .route("/conversations/:conversation_id", get(get_conversation))
        .route(
            "/conversations/:conversation_id/events",
            get(search_events).post(append_events),
        )
        .route(
            "/conversations/:conversation_id/events/:event_id",
            get(get_event),
        )
        .route(
            "/conversations/:conversation_id/subscribers",
            post(create_subscriber),
        )
        .route("/events", get(batch_get_events))
        .route("/subscribers", get(batch_get_subscribers))
        .route("/subscribers/search", get(search_subscribers))
        .route(
            "/subscribers/:subscriber_id",
            get(get_subscriber).delete(delete_subscriber),
        )
        .route(
            "/event-callbacks",
            get(batch_get_event_callbacks).post(create_event_callback),
        )
        .route("/event-callbacks/search", get(search_event_callbacks))
        .route(
            "/event-callbacks/:callback_id",
            get(get_event_callback)
                .put(update_event_callback)
                .delete(delete_event_callback),
        )
        .route(
            "/event-callback-results",
            get(batch_get_event_callback_results),
        )
        .route(
            "/event-callback-results/search",
            get(search_event_callback_results),
        )
        .route(
            "/event-callback-results/:result_id",
            get(get_event_callback_result).delete(delete_event_callback_result),
        )
        .route(
            "/event-webhooks/:sandbox_id/events",
            post(receive_sandbox_events),
        )
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var(LOG_HTTP_ENV) {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var(LOG_HTTP_HEADERS_ENV).is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if is_secret_header(name_str) {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

fn is_secret_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case(SESSION_API_KEY_HEADER)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        search_sandboxes,
        batch_get_sandboxes,
        get_sandbox,
        start_sandbox,
        pause_sandbox,
        resume_sandbox,
        delete_sandbox,
        search_sandbox_specs,
        batch_get_sandbox_specs,
        get_sandbox_spec,
        start_conversation,
        search_conversations,
        batch_get_conversations,
        get_conversation,
        append_events,
        search_events,
        get_event,
        batch_get_events,
        create_subscriber,
        search_subscribers,
        batch_get_subscribers,
        get_subscriber,
        delete_subscriber,
        create_event_callback,
        search_event_callbacks,
        batch_get_event_callbacks,
        get_event_callback,
        update_event_callback,
        delete_event_callback,
        search_event_callback_results,
        batch_get_event_callback_results,
        get_event_callback_result,
        delete_event_callback_result,
        receive_sandbox_events
    ),
    components(
        schemas(
            HealthResponse,
            ProblemDetails,
            ErrorType,
            SandboxStatus,
            ExposedUrl,
            SandboxInfo,
            SandboxPage,
            SandboxSpecInfo,
            SandboxSpecPage,
            StartSandboxRequest,
            StartConversationRequest,
            SandboxedConversation,
            SandboxedConversationPage,
            Event,
            NewEvent,
            EventPage,
            AppendEventsRequest,
            SandboxEventsRequest,
            SubscriberDefinition,
            SubscriberInfo,
            SubscriberPage,
            DeliveryStats,
            EventCallbackProcessor,
            EventCallbackStatus,
            EventCallback,
            EventCallbackPage,
            CreateEventCallbackRequest,
            UpdateEventCallbackRequest,
            EventCallbackResultStatus,
            EventCallbackResultSortOrder,
            EventCallbackResult,
            EventCallbackResultPage
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sandboxes", description = "Sandbox lifecycle"),
        (name = "sandbox-specs", description = "Sandbox images"),
        (name = "conversations", description = "Sandboxed conversations"),
        (name = "events", description = "Conversation events and subscribers"),
        (name = "event-callbacks", description = "Stored event callbacks and their results")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:3000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match self {
            ApiError::Orchestrator(err) => err.to_problem_details(),
            ApiError::Store(err) => OrchestratorError::from(err).to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    // Agent servers authenticate inbound events with their session key.
    if path == "/v1/health" || path == "/health" || is_event_webhook_path(path) {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(OrchestratorError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn is_event_webhook_path(path: &str) -> bool {
    let path = path.strip_prefix("/v1").unwrap_or(path);
    path.starts_with("/event-webhooks/")
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            for engine in engines {
                let Ok(decoded) = engine.decode(rest) else {
                    continue;
                };
                let Ok(decoded) = String::from_utf8(decoded) else {
                    continue;
                };
                if let Some((_, password)) = decoded.split_once(':') {
                    return Some(password.to_string());
                }
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            None
        }
        _ => None,
    }
}

/// Collects `ids` query values, accepting both repeated parameters and
/// comma separated lists.
fn query_ids(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    url::form_urlencoded::parse(raw.as_bytes())
        .filter(|(key, _)| key == "ids")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn query_uuids(raw: Option<&str>) -> Result<Vec<Uuid>, ApiError> {
    query_ids(raw)
        .iter()
        .map(|id| {
            Uuid::parse_str(id).map_err(|_| {
                ApiError::from(OrchestratorError::InvalidRequest {
                    message: format!("invalid id: {id}"),
                })
            })
        })
        .collect()
}

/// Only the owner (or an admin) may see a sandbox's session key.
fn visible_to(caller: &Caller, sandbox: SandboxInfo) -> SandboxInfo {
    if caller.can_access(&sandbox.created_by_user_id) {
        sandbox
    } else {
        sandbox.without_secrets()
    }
}

fn no_content_or_missing(found: bool, resource: &str, id: impl ToString) -> Result<StatusCode, ApiError> {
    if found {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::not_found(resource, id).into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    pub page_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventSearchQuery {
    /// Restrict the page to one event kind.
    pub kind: Option<String>,
    pub page_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SubscriberSearchQuery {
    pub conversation_id: Option<Uuid>,
    pub page_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StartSandboxRequest {
    #[serde(default)]
    pub sandbox_spec_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AppendEventsRequest {
    pub events: Vec<NewEvent>,
}

/// Events posted by a sandbox's agent server.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SandboxEventsRequest {
    pub conversation_id: Uuid,
    pub events: Vec<NewEvent>,
}

const SERVER_INFO: &str = "\
This is a sandbox orchestrator server. Available endpoints:\n\
  - GET  /                  - Server info\n\
  - GET  /v1/health         - Health check\n\
  - GET  /v1/openapi.json   - OpenAPI document";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes/search",
    params(PageQuery),
    responses((status = 200, body = SandboxPage)),
    tag = "sandboxes"
)]
async fn search_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Json<SandboxPage> {
    let caller = state.caller(&headers);
    let mut page = state
        .context
        .sandboxes
        .search_sandboxes(caller.owner_filter(), query.page_id.as_deref(), query.limit)
        .await;
    page.items = page
        .items
        .into_iter()
        .map(|sandbox| visible_to(&caller, sandbox))
        .collect();
    Json(page)
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes",
    params(("ids" = Vec<String>, Query, description = "Sandbox ids, repeated or comma separated")),
    responses(
        (status = 200, body = [SandboxInfo], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn batch_get_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<SandboxInfo>>>, ApiError> {
    let caller = state.caller(&headers);
    let ids = query_uuids(raw.as_deref())?;
    let sandboxes = state.context.sandboxes.batch_get_sandboxes(&ids).await;
    Ok(Json(
        sandboxes
            .into_iter()
            .map(|sandbox| sandbox.map(|sandbox| visible_to(&caller, sandbox)))
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes/{sandbox_id}",
    params(("sandbox_id" = Uuid, Path, description = "Sandbox id")),
    responses(
        (status = 200, body = SandboxInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let caller = state.caller(&headers);
    let sandbox = state
        .context
        .sandboxes
        .get_sandbox(sandbox_id)
        .await
        .ok_or_else(|| OrchestratorError::not_found("sandbox", sandbox_id))?;
    Ok(Json(visible_to(&caller, sandbox)))
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes",
    request_body = StartSandboxRequest,
    responses(
        (status = 200, body = SandboxInfo),
        (status = 404, body = ProblemDetails, description = "Unknown sandbox spec"),
        (status = 500, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn start_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StartSandboxRequest>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let caller = state.caller(&headers);
    let sandbox = state
        .context
        .sandboxes
        .start_sandbox(&caller, request.sandbox_spec_id.as_deref())
        .await?;
    Ok(Json(sandbox))
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes/{sandbox_id}/pause",
    params(("sandbox_id" = Uuid, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Sandbox paused"),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers);
    let found = state.context.sandboxes.pause_sandbox(&caller, sandbox_id).await?;
    no_content_or_missing(found, "sandbox", sandbox_id)
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes/{sandbox_id}/resume",
    params(("sandbox_id" = Uuid, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Sandbox resumed"),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers);
    let found = state.context.sandboxes.resume_sandbox(&caller, sandbox_id).await?;
    no_content_or_missing(found, "sandbox", sandbox_id)
}

#[utoipa::path(
    delete,
    path = "/v1/sandboxes/{sandbox_id}",
    params(("sandbox_id" = Uuid, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Sandbox deleted"),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn delete_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers);
    let found = state.context.sandboxes.delete_sandbox(&caller, sandbox_id).await?;
    no_content_or_missing(found, "sandbox", sandbox_id)
}

#[utoipa::path(
    get,
    path = "/v1/sandbox-specs/search",
    params(PageQuery),
    responses((status = 200, body = SandboxSpecPage)),
    tag = "sandbox-specs"
)]
async fn search_sandbox_specs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Json<SandboxSpecPage> {
    Json(
        state
            .context
            .sandboxes
            .specs()
            .search_sandbox_specs(query.page_id.as_deref(), query.limit)
            .await,
    )
}

#[utoipa::path(
    get,
    path = "/v1/sandbox-specs",
    params(("ids" = Vec<String>, Query, description = "Spec ids, repeated or comma separated")),
    responses((status = 200, body = [SandboxSpecInfo], description = "One entry per id, null when missing")),
    tag = "sandbox-specs"
)]
async fn batch_get_sandbox_specs(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Json<Vec<Option<SandboxSpecInfo>>> {
    let ids = query_ids(raw.as_deref());
    Json(
        state
            .context
            .sandboxes
            .specs()
            .batch_get_sandbox_specs(&ids)
            .await,
    )
}

#[utoipa::path(
    get,
    path = "/v1/sandbox-specs/{spec_id}",
    params(("spec_id" = String, Path, description = "Image reference")),
    responses(
        (status = 200, body = SandboxSpecInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandbox-specs"
)]
async fn get_sandbox_spec(
    State(state): State<Arc<AppState>>,
    Path(spec_id): Path<String>,
) -> Result<Json<SandboxSpecInfo>, ApiError> {
    let spec = state
        .context
        .sandboxes
        .specs()
        .get_sandbox_spec(&spec_id)
        .await;
    match spec {
        Some(spec) => Ok(Json(spec)),
        None => Err(OrchestratorError::SandboxSpecNotFound { spec_id }.into()),
    }
}

#[utoipa::path(
    post,
    path = "/v1/conversations",
    request_body = StartConversationRequest,
    responses(
        (status = 200, body = SandboxedConversation),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 502, body = ProblemDetails),
        (status = 504, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn start_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StartConversationRequest>,
) -> Result<Json<SandboxedConversation>, ApiError> {
    let caller = state.caller(&headers);
    let conversation = state
        .context
        .conversations
        .start_conversation(&caller, request)
        .await?;
    Ok(Json(conversation))
}

#[utoipa::path(
    get,
    path = "/v1/conversations/search",
    params(PageQuery),
    responses((status = 200, body = SandboxedConversationPage)),
    tag = "conversations"
)]
async fn search_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<SandboxedConversationPage>, ApiError> {
    let caller = state.caller(&headers);
    let page = state
        .context
        .conversations
        .search_conversations(&caller, query.page_id.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/v1/conversations",
    params(("ids" = Vec<String>, Query, description = "Conversation ids, repeated or comma separated")),
    responses(
        (status = 200, body = [SandboxedConversation], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn batch_get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<SandboxedConversation>>>, ApiError> {
    let caller = state.caller(&headers);
    let ids = query_uuids(raw.as_deref())?;
    let conversations = state
        .context
        .conversations
        .batch_get_conversations(&caller, &ids)
        .await?;
    Ok(Json(conversations))
}

#[utoipa::path(
    get,
    path = "/v1/conversations/{conversation_id}",
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, body = SandboxedConversation),
        (status = 404, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<SandboxedConversation>, ApiError> {
    let caller = state.caller(&headers);
    let conversation = state
        .context
        .conversations
        .get_conversation(&caller, conversation_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("conversation", conversation_id))?;
    Ok(Json(conversation))
}

#[utoipa::path(
    post,
    path = "/v1/conversations/{conversation_id}/events",
    request_body = AppendEventsRequest,
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, body = [Event]),
        (status = 409, body = ProblemDetails, description = "Event id used by another conversation")
    ),
    tag = "events"
)]
async fn append_events(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<AppendEventsRequest>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let events = state
        .context
        .events
        .append_events(conversation_id, request.events)
        .await?;
    Ok(Json(events))
}

#[utoipa::path(
    get,
    path = "/v1/conversations/{conversation_id}/events",
    params(
        ("conversation_id" = Uuid, Path, description = "Conversation id"),
        EventSearchQuery
    ),
    responses((status = 200, body = EventPage)),
    tag = "events"
)]
async fn search_events(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<EventSearchQuery>,
) -> Json<EventPage> {
    Json(
        state
            .context
            .events
            .search_events(
                conversation_id,
                query.kind.as_deref(),
                query.page_id.as_deref(),
                query.limit,
            )
            .await,
    )
}

#[utoipa::path(
    get,
    path = "/v1/conversations/{conversation_id}/events/{event_id}",
    params(
        ("conversation_id" = Uuid, Path, description = "Conversation id"),
        ("event_id" = Uuid, Path, description = "Event id")
    ),
    responses(
        (status = 200, body = Event),
        (status = 404, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn get_event(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, event_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Event>, ApiError> {
    let event = state
        .context
        .events
        .get_event(event_id)
        .await
        .filter(|event| event.conversation_id == conversation_id)
        .ok_or_else(|| OrchestratorError::not_found("event", event_id))?;
    Ok(Json(event))
}

#[utoipa::path(
    get,
    path = "/v1/events",
    params(("ids" = Vec<String>, Query, description = "Event ids, repeated or comma separated")),
    responses(
        (status = 200, body = [Event], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn batch_get_events(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<Event>>>, ApiError> {
    let ids = query_uuids(raw.as_deref())?;
    Ok(Json(state.context.events.batch_get_events(&ids).await))
}

#[utoipa::path(
    post,
    path = "/v1/conversations/{conversation_id}/subscribers",
    request_body = SubscriberDefinition,
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, body = SubscriberInfo),
        (status = 400, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn create_subscriber(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(definition): Json<SubscriberDefinition>,
) -> Result<Json<SubscriberInfo>, ApiError> {
    let subscriber = state
        .context
        .subscribers
        .create_subscriber(conversation_id, definition)
        .await?;
    Ok(Json(subscriber))
}

#[utoipa::path(
    get,
    path = "/v1/subscribers/search",
    params(SubscriberSearchQuery),
    responses((status = 200, body = SubscriberPage)),
    tag = "events"
)]
async fn search_subscribers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriberSearchQuery>,
) -> Json<SubscriberPage> {
    Json(
        state
            .context
            .subscribers
            .search_subscribers(query.conversation_id, query.page_id.as_deref(), query.limit)
            .await,
    )
}

#[utoipa::path(
    get,
    path = "/v1/subscribers",
    params(("ids" = Vec<String>, Query, description = "Subscriber ids, repeated or comma separated")),
    responses(
        (status = 200, body = [SubscriberInfo], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn batch_get_subscribers(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<SubscriberInfo>>>, ApiError> {
    let ids = query_uuids(raw.as_deref())?;
    Ok(Json(state.context.subscribers.batch_get_subscribers(&ids).await))
}

#[utoipa::path(
    get,
    path = "/v1/subscribers/{subscriber_id}",
    params(("subscriber_id" = Uuid, Path, description = "Subscriber id")),
    responses(
        (status = 200, body = SubscriberInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn get_subscriber(
    State(state): State<Arc<AppState>>,
    Path(subscriber_id): Path<Uuid>,
) -> Result<Json<SubscriberInfo>, ApiError> {
    let subscriber = state
        .context
        .subscribers
        .get_subscriber(subscriber_id)
        .await
        .ok_or_else(|| OrchestratorError::not_found("subscriber", subscriber_id))?;
    Ok(Json(subscriber))
}

#[utoipa::path(
    delete,
    path = "/v1/subscribers/{subscriber_id}",
    params(("subscriber_id" = Uuid, Path, description = "Subscriber id")),
    responses(
        (status = 204, description = "Subscriber flushed and removed"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn delete_subscriber(
    State(state): State<Arc<AppState>>,
    Path(subscriber_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state
        .context
        .subscribers
        .delete_subscriber(subscriber_id)
        .await?;
    no_content_or_missing(found, "subscriber", subscriber_id)
}

#[utoipa::path(
    post,
    path = "/v1/event-callbacks",
    request_body = CreateEventCallbackRequest,
    responses((status = 200, body = EventCallback)),
    tag = "event-callbacks"
)]
async fn create_event_callback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateEventCallbackRequest>,
) -> Result<Json<EventCallback>, ApiError> {
    Ok(Json(
        state.context.callbacks.create_event_callback(request).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/v1/event-callbacks/search",
    params(EventCallbackQuery),
    responses((status = 200, body = EventCallbackPage)),
    tag = "event-callbacks"
)]
async fn search_event_callbacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventCallbackQuery>,
) -> Result<Json<EventCallbackPage>, ApiError> {
    Ok(Json(
        state.context.callbacks.search_event_callbacks(&query).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/v1/event-callbacks",
    params(("ids" = Vec<String>, Query, description = "Callback ids, repeated or comma separated")),
    responses(
        (status = 200, body = [EventCallback], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn batch_get_event_callbacks(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<EventCallback>>>, ApiError> {
    let ids = query_uuids(raw.as_deref())?;
    Ok(Json(
        state.context.callbacks.batch_get_event_callbacks(&ids).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/v1/event-callbacks/{callback_id}",
    params(("callback_id" = Uuid, Path, description = "Callback id")),
    responses(
        (status = 200, body = EventCallback),
        (status = 404, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn get_event_callback(
    State(state): State<Arc<AppState>>,
    Path(callback_id): Path<Uuid>,
) -> Result<Json<EventCallback>, ApiError> {
    let callback = state
        .context
        .callbacks
        .get_event_callback(callback_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("event callback", callback_id))?;
    Ok(Json(callback))
}

#[utoipa::path(
    put,
    path = "/v1/event-callbacks/{callback_id}",
    request_body = UpdateEventCallbackRequest,
    params(("callback_id" = Uuid, Path, description = "Callback id")),
    responses(
        (status = 200, body = EventCallback),
        (status = 404, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn update_event_callback(
    State(state): State<Arc<AppState>>,
    Path(callback_id): Path<Uuid>,
    Json(request): Json<UpdateEventCallbackRequest>,
) -> Result<Json<EventCallback>, ApiError> {
    let callback = state
        .context
        .callbacks
        .update_event_callback(callback_id, request)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("event callback", callback_id))?;
    Ok(Json(callback))
}

#[utoipa::path(
    delete,
    path = "/v1/event-callbacks/{callback_id}",
    params(("callback_id" = Uuid, Path, description = "Callback id")),
    responses(
        (status = 204, description = "Callback deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn delete_event_callback(
    State(state): State<Arc<AppState>>,
    Path(callback_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state
        .context
        .callbacks
        .delete_event_callback(callback_id)
        .await?;
    no_content_or_missing(found, "event callback", callback_id)
}

#[utoipa::path(
    get,
    path = "/v1/event-callback-results/search",
    params(EventCallbackResultQuery),
    responses((status = 200, body = EventCallbackResultPage)),
    tag = "event-callbacks"
)]
async fn search_event_callback_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventCallbackResultQuery>,
) -> Result<Json<EventCallbackResultPage>, ApiError> {
    Ok(Json(
        state
            .context
            .callbacks
            .search_event_callback_results(&query)
            .await?,
    ))
}

#[utoipa::path(
    get,
    path = "/v1/event-callback-results",
    params(("ids" = Vec<String>, Query, description = "Result ids, repeated or comma separated")),
    responses(
        (status = 200, body = [EventCallbackResult], description = "One entry per id, null when missing"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn batch_get_event_callback_results(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Option<EventCallbackResult>>>, ApiError> {
    let ids = query_uuids(raw.as_deref())?;
    Ok(Json(
        state
            .context
            .callbacks
            .batch_get_event_callback_results(&ids)
            .await?,
    ))
}

#[utoipa::path(
    get,
    path = "/v1/event-callback-results/{result_id}",
    params(("result_id" = Uuid, Path, description = "Result id")),
    responses(
        (status = 200, body = EventCallbackResult),
        (status = 404, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn get_event_callback_result(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<Uuid>,
) -> Result<Json<EventCallbackResult>, ApiError> {
    let result = state
        .context
        .callbacks
        .get_event_callback_result(result_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("event callback result", result_id))?;
    Ok(Json(result))
}

#[utoipa::path(
    delete,
    path = "/v1/event-callback-results/{result_id}",
    params(("result_id" = Uuid, Path, description = "Result id")),
    responses(
        (status = 204, description = "Result deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "event-callbacks"
)]
async fn delete_event_callback_result(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state
        .context
        .callbacks
        .delete_event_callback_result(result_id)
        .await?;
    no_content_or_missing(found, "event callback result", result_id)
}

#[utoipa::path(
    post,
    path = "/v1/event-webhooks/{sandbox_id}/events",
    request_body = SandboxEventsRequest,
    params(("sandbox_id" = Uuid, Path, description = "Sandbox the events come from")),
    responses(
        (status = 200, body = [Event]),
        (status = 403, body = ProblemDetails, description = "Session key or conversation does not match the sandbox"),
        (status = 404, body = ProblemDetails, description = "Unknown sandbox or conversation"),
        (status = 409, body = ProblemDetails)
    ),
    tag = "events"
)]
async fn receive_sandbox_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
    Json(request): Json<SandboxEventsRequest>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let sandbox = state
        .context
        .sandboxes
        .get_sandbox(sandbox_id)
        .await
        .ok_or_else(|| OrchestratorError::not_found("sandbox", sandbox_id))?;
    let provided = headers
        .get(SESSION_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    match (sandbox.session_api_key.as_deref(), provided) {
        (Some(expected), Some(provided)) if expected == provided => {}
        _ => {
            tracing::warn!(sandbox_id = %sandbox_id, "rejected sandbox events with bad session key");
            return Err(OrchestratorError::permission_denied("invalid session api key").into());
        }
    }
    // The session key only identifies the sandbox; the conversation must be
    // bound to it as well.
    let bound_to = state
        .context
        .conversations
        .sandbox_of(request.conversation_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("conversation", request.conversation_id))?;
    if bound_to != sandbox_id {
        tracing::warn!(
            sandbox_id = %sandbox_id,
            conversation_id = %request.conversation_id,
            "rejected sandbox events for a conversation bound to another sandbox"
        );
        return Err(OrchestratorError::permission_denied(format!(
            "conversation {} is not bound to sandbox {sandbox_id}",
            request.conversation_id
        ))
        .into());
    }
    let events = state
        .context
        .events
        .append_events(request.conversation_id, request.events)
        .await?;
    tracing::debug!(
        sandbox_id = %sandbox_id,
        conversation_id = %request.conversation_id,
        count = events.len(),
        "sandbox events received"
    );
    Ok(Json(events))
}
