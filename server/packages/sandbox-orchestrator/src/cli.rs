use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use sandbox_orchestrator_error::OrchestratorError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::config::{ConfigError, EngineKind, OrchestratorConfig};
use crate::context::AppContext;
use crate::router::{
    build_router_with_state, ApiDoc, AppState, AuthConfig, StartSandboxRequest, USER_ID_HEADER,
};
use crate::sandbox::{SandboxInfo, SandboxPage, SandboxSpecPage};

mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

const API_PREFIX: &str = "/v1";
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000";

#[derive(Parser, Debug)]
#[command(name = "sandbox-orchestrator", bin_name = "sandbox-orchestrator")]
#[command(about = "Docker sandbox and conversation event control plane", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct SandboxOrchestratorCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,

    /// User id sent as `X-User-Id` by the API client commands.
    #[arg(long, short = 'u', global = true)]
    user: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator HTTP server.
    Server(ServerArgs),
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
    /// Print the OpenAPI document.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Overrides `server.host` from the config file.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Overrides `server.port` from the config file.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Start, inspect and stop sandboxes.
    Sandboxes(SandboxesArgs),
    /// List available sandbox images.
    Specs(SpecsArgs),
}

#[derive(Args, Debug)]
pub struct SandboxesArgs {
    #[command(subcommand)]
    command: SandboxesCommand,
}

#[derive(Args, Debug)]
pub struct SpecsArgs {
    #[command(subcommand)]
    command: SpecsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SandboxesCommand {
    List(ListArgs),
    Get(SandboxIdArgs),
    Start(StartSandboxArgs),
    Pause(SandboxIdArgs),
    Resume(SandboxIdArgs),
    Delete(SandboxIdArgs),
}

#[derive(Subcommand, Debug)]
pub enum SpecsCommand {
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    client: ClientArgs,
    #[arg(long)]
    page_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SandboxIdArgs {
    sandbox_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct StartSandboxArgs {
    #[arg(long, short = 's')]
    spec: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
    pub user: Option<String>,
}

pub fn run_sandbox_orchestrator() -> Result<(), CliError> {
    let SandboxOrchestratorCli {
        command,
        token,
        no_token,
        user,
    } = SandboxOrchestratorCli::parse();
    let config = CliConfig {
        token,
        no_token,
        user,
    };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Api(subcommand) => run_api(&subcommand.command, cli),
        Command::Openapi => write_stdout_line(&ApiDoc::openapi().to_pretty_json()?),
    }
}

/// File config, then env overrides, then flags.
fn server_config(cli: &CliConfig, server: &ServerArgs) -> Result<OrchestratorConfig, CliError> {
    let mut config = OrchestratorConfig::load(server.config.as_deref())?;
    if let Some(host) = &server.host {
        config.server.host = host.clone();
    }
    if let Some(port) = server.port {
        config.server.port = port;
    }
    if let Some(engine) = server.engine {
        config.engine = engine;
    }
    if cli.no_token {
        config.auth.token = None;
    } else if let Some(token) = &cli.token {
        config.auth.token = Some(token.clone());
    }
    Ok(config)
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let config = server_config(cli, server)?;
    let auth = match config.auth.token.clone() {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let engine = config.engine;
        let context = AppContext::build(config).await?;
        let state = Arc::new(AppState::new(auth, context));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, engine = %engine, "server listening");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));
        state.context().shutdown().await;
        served
    })
}

fn run_api(command: &ApiCommand, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        ApiCommand::Sandboxes(subcommand) => run_sandboxes(&subcommand.command, cli),
        ApiCommand::Specs(subcommand) => run_specs(&subcommand.command, cli),
    }
}

fn run_sandboxes(command: &SandboxesCommand, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        SandboxesCommand::List(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let response = ctx.get_with_query(
                &format!("{API_PREFIX}/sandboxes/search"),
                &page_query(args),
            )?;
            print_json_response::<SandboxPage>(response)
        }
        SandboxesCommand::Get(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let response = ctx.get(&format!("{API_PREFIX}/sandboxes/{}", args.sandbox_id))?;
            print_json_response::<SandboxInfo>(response)
        }
        SandboxesCommand::Start(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let body = StartSandboxRequest {
                sandbox_spec_id: args.spec.clone(),
            };
            let response = ctx.post(&format!("{API_PREFIX}/sandboxes"), &body)?;
            print_json_response::<SandboxInfo>(response)
        }
        SandboxesCommand::Pause(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let path = format!("{API_PREFIX}/sandboxes/{}/pause", args.sandbox_id);
            print_empty_response(ctx.post_empty(&path)?)
        }
        SandboxesCommand::Resume(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let path = format!("{API_PREFIX}/sandboxes/{}/resume", args.sandbox_id);
            print_empty_response(ctx.post_empty(&path)?)
        }
        SandboxesCommand::Delete(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let path = format!("{API_PREFIX}/sandboxes/{}", args.sandbox_id);
            print_empty_response(ctx.delete(&path)?)
        }
    }
}

fn run_specs(command: &SpecsCommand, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        SpecsCommand::List(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let response = ctx.get_with_query(
                &format!("{API_PREFIX}/sandbox-specs/search"),
                &page_query(args),
            )?;
            print_json_response::<SandboxSpecPage>(response)
        }
    }
}

fn page_query(args: &ListArgs) -> Vec<(&'static str, Option<String>)> {
    vec![
        ("page_id", args.page_id.clone()),
        ("limit", args.limit.map(|limit| limit.to_string())),
    ]
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    token: Option<String>,
    user: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(cli: &CliConfig, args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let token = if cli.no_token {
            None
        } else {
            cli.token.clone()
        };
        let client = HttpClient::builder().build()?;
        Ok(Self {
            endpoint,
            token,
            user: cli.user.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(user) = &self.user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        let mut request = self.request(Method::GET, path);
        for (key, value) in query {
            if let Some(value) = value {
                request = request.query(&[(key, value)]);
            }
        }
        Ok(request.send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }

    fn post_empty(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).send()?)
    }

    fn delete(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::DELETE, path).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_empty_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text()?;
    print_error_body(&text)?;
    Err(CliError::HttpStatus(status))
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn parse(args: &[&str]) -> SandboxOrchestratorCli {
        SandboxOrchestratorCli::try_parse_from(args).expect("parse")
    }

    #[test]
    #[serial]
    fn flags_override_file_config() {
        let cli = parse(&[
            "sandbox-orchestrator",
            "--token",
            "secret",
            "server",
            "--port",
            "4000",
            "--engine",
            "mock",
        ]);
        let Command::Server(args) = &cli.command else {
            panic!("expected server command");
        };
        let config = server_config(
            &CliConfig {
                token: cli.token.clone(),
                no_token: cli.no_token,
                user: None,
            },
            args,
        )
        .expect("config");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.engine, EngineKind::Mock);
        assert_eq!(config.auth.token.as_deref(), Some("secret"));
    }

    #[test]
    fn api_commands_parse() {
        let cli = parse(&[
            "sandbox-orchestrator",
            "--user",
            "alice",
            "api",
            "sandboxes",
            "start",
            "--spec",
            "ghcr.io/all-hands-ai/runtime:latest",
        ]);
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert!(matches!(
            cli.command,
            Command::Api(ApiArgs {
                command: ApiCommand::Sandboxes(SandboxesArgs {
                    command: SandboxesCommand::Start(StartSandboxArgs { spec: Some(_), .. })
                })
            })
        ));
    }

    #[test]
    fn cors_rejects_bad_methods() {
        let cli = parse(&[
            "sandbox-orchestrator",
            "server",
            "--cors-allow-method",
            "NOT A METHOD",
        ]);
        let Command::Server(args) = &cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(args),
            Err(CliError::InvalidCorsMethod(_))
        ));
    }
}
