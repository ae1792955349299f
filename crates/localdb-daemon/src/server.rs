use std::{convert::Infallible, env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, Stream};
use localdb_core::{
    parse_engine, AsyncTask, CoreConfig, CoreError, DbManager, EngineOverview, InstallOptions,
    Notification, StartupReport,
};
use localdb_store::{Database, DatabaseInstance, WorkerRegistry};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

const DEFAULT_API_ADDR: &str = "127.0.0.1:7420";

#[derive(Clone)]
pub struct AppState {
    pub manager: DbManager,
}

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&config.home)
        .await
        .with_context(|| format!("failed to create {}", config.home.display()))?;
    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open state database")?;
    let manager = DbManager::with_database(config.core.clone(), db)
        .await
        .context("failed to load instance registry")?;

    if config.autostart {
        let report = manager.startup().await.context("startup pass failed")?;
        log_startup(&report);
    } else {
        manager
            .sync_status()
            .await
            .context("startup reconciliation failed")?;
    }

    let workers = WorkerRegistry::default();
    workers.spawn(manager.synchronizer());

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, home = %config.home.display(), "localdb-daemon listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager.clone()))
        .await
        .context("HTTP server exited");

    manager.shutdown();
    workers.wait_all().await?;
    served
}

fn log_startup(report: &StartupReport) {
    info!(
        corrected = report.reconcile.corrected.len(),
        adopted = report.reconcile.adopted.len(),
        auto_started = report.auto_started.len(),
        failures = report.failures.len(),
        "startup pass finished"
    );
    for failure in &report.failures {
        warn!(
            instance_id = %failure.instance_id,
            engine = %failure.engine_type,
            error = %failure.error,
            "instance did not auto-start"
        );
    }
}

/// Completes on ctrl-c or SIGTERM and flips the manager's shutdown flag so
/// event streams end and the server can drain. Engines keep running.
async fn shutdown_signal(manager: DbManager) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
    manager.shutdown();
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/openapi.json", get(openapi_json))
        .route("/api/v1/engines", get(list_engines))
        .route("/api/v1/engines/:engine/instance", get(get_engine_instance))
        .route("/api/v1/instances", get(list_instances))
        .route(
            "/api/v1/instances/:id",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/v1/instances/:id/start", post(start_instance))
        .route("/api/v1/instances/:id/stop", post(stop_instance))
        .route("/api/v1/instances/:id/restart", post(restart_instance))
        .route("/api/v1/instances/:id/auto-start", put(set_auto_start))
        .route("/api/v1/instances/:id/uninstall", post(uninstall))
        .route("/api/v1/install", post(install))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/sync", post(sync_status))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Daemon is serving", body = HealthResponse))
)]
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(docs::ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/v1/engines",
    responses((status = 200, description = "Every supported engine with its instance, if any", body = [EngineResponse]))
)]
async fn list_engines(State(state): State<Arc<AppState>>) -> Json<Vec<EngineResponse>> {
    Json(
        state
            .manager
            .engines()
            .into_iter()
            .map(EngineResponse::from)
            .collect(),
    )
}

#[utoipa::path(
    get,
    path = "/api/v1/engines/{engine}/instance",
    params(("engine" = String, Path, description = "Engine wire name, e.g. `redis`")),
    responses(
        (status = 200, description = "Installed instance of the engine", body = InstanceResponse),
        (status = 404, description = "Unknown engine or not installed", body = ErrorBody)
    )
)]
async fn get_engine_instance(
    State(state): State<Arc<AppState>>,
    Path(engine): Path<String>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let engine = parse_engine(&engine)?;
    let instance = state.manager.get_instance_by_type(engine)?;
    Ok(Json(instance.into()))
}

#[utoipa::path(
    get,
    path = "/api/v1/instances",
    responses((status = 200, description = "All installed instances", body = [InstanceResponse]))
)]
async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceResponse>> {
    Json(instance_list(state.manager.list_instances()))
}

#[utoipa::path(
    get,
    path = "/api/v1/instances/{id}",
    params(("id" = Uuid, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Instance details", body = InstanceResponse),
        (status = 404, description = "Instance not found", body = ErrorBody)
    )
)]
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.get_instance(id)?.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances/{id}/start",
    params(("id" = Uuid, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Instance started", body = InstanceResponse),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 409, description = "Already running or busy", body = ErrorBody),
        (status = 500, description = "Process failed to start", body = ErrorBody)
    )
)]
async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.start_instance(id).await?.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances/{id}/stop",
    params(("id" = Uuid, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Instance stopped", body = InstanceResponse),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 409, description = "Not running or busy", body = ErrorBody),
        (status = 500, description = "Process refused to exit", body = ErrorBody)
    )
)]
async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.stop_instance(id).await?.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances/{id}/restart",
    params(("id" = Uuid, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Instance restarted", body = InstanceResponse),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 409, description = "Another operation is in progress", body = ErrorBody),
        (status = 500, description = "Stop or start failed", body = ErrorBody)
    )
)]
async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.restart_instance(id).await?.into()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/instances/{id}",
    params(("id" = Uuid, Path, description = "Instance identifier"), PurgeQuery),
    responses(
        (status = 204, description = "Instance removed"),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 409, description = "Another operation is in progress", body = ErrorBody),
        (status = 500, description = "Stop failed; record kept", body = ErrorBody)
    )
)]
async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<PurgeQuery>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_instance(id, query.purge_data).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/api/v1/instances/{id}/auto-start",
    params(("id" = Uuid, Path, description = "Instance identifier")),
    request_body = AutoStartBody,
    responses(
        (status = 200, description = "Flag updated", body = InstanceResponse),
        (status = 404, description = "Instance not found", body = ErrorBody)
    )
)]
async fn set_auto_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<AutoStartBody>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let updated = state.manager.set_auto_start(id, body.enabled).await?;
    Ok(Json(updated.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/install",
    request_body = InstallBody,
    responses(
        (status = 202, description = "Install task accepted", body = TaskAccepted),
        (status = 404, description = "Unsupported engine type", body = ErrorBody),
        (status = 409, description = "Engine already installed or installing", body = ErrorBody)
    )
)]
async fn install(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallBody>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let engine = parse_engine(&body.engine_type)?;
    let options = InstallOptions {
        port: body.port,
        username: body.username,
        password: body.password,
        auto_start: body.auto_start,
    };
    let task_id = state.manager.install(engine, body.version, options)?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances/{id}/uninstall",
    params(("id" = Uuid, Path, description = "Instance identifier"), PurgeQuery),
    responses(
        (status = 202, description = "Uninstall task accepted", body = TaskAccepted),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 409, description = "Another task is active for the engine", body = ErrorBody)
    )
)]
async fn uninstall(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<PurgeQuery>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let task_id = state.manager.uninstall(id, query.purge_data)?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks",
    responses((status = 200, description = "Retained tasks, newest first", body = [TaskResponse]))
)]
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskResponse>> {
    Json(
        state
            .manager
            .list_tasks()
            .into_iter()
            .map(TaskResponse::from)
            .collect(),
    )
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task identifier")),
    responses(
        (status = 200, description = "Task snapshot", body = TaskResponse),
        (status = 404, description = "Unknown or evicted task", body = ErrorBody)
    )
)]
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(state.manager.get_task(id)?.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/sync",
    responses(
        (status = 200, description = "Snapshot after reconciliation", body = [InstanceResponse]),
        (status = 500, description = "Reconciliation failed", body = ErrorBody)
    )
)]
async fn sync_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InstanceResponse>>, ApiError> {
    Ok(Json(instance_list(state.manager.sync_status().await?)))
}

#[utoipa::path(
    get,
    path = "/api/v1/events",
    responses((
        status = 200,
        description = "Server-sent events named `install-progress` (TaskResponse) and `instances-updated` ([InstanceResponse])",
        content_type = "text/event-stream",
        body = String
    ))
)]
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.manager.subscribe();
    let shutdown = state.manager.shutdown_listener();

    let stream = stream::unfold(
        (subscription, shutdown),
        |(mut subscription, mut shutdown)| async move {
            if *shutdown.borrow() {
                return None;
            }
            let notification = tokio::select! {
                notification = subscription.recv() => notification?,
                _ = shutdown.changed() => return None,
            };
            Some((Ok(sse_event(&notification)), (subscription, shutdown)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// SSE frames carry the same JSON shapes as the REST responses.
fn sse_event(notification: &Notification) -> Event {
    let event = Event::default().event(notification.channel());
    let framed = match notification {
        Notification::InstallProgress(task) => event.json_data(TaskResponse::from(task.clone())),
        Notification::InstancesUpdated(instances) => {
            event.json_data(instance_list(instances.clone()))
        }
    };
    framed.unwrap_or_else(|err| {
        error!(error = %err, channel = notification.channel(), "failed to encode event");
        Event::default().event("error").data(err.to_string())
    })
}

fn instance_list(instances: Vec<DatabaseInstance>) -> Vec<InstanceResponse> {
    instances.into_iter().map(InstanceResponse::from).collect()
}

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct InstanceResponse {
    id: Uuid,
    engine_type: String,
    name: String,
    version: String,
    install_path: String,
    data_path: String,
    log_path: String,
    config_path: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    status: String,
    pid: Option<u32>,
    auto_start: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DatabaseInstance> for InstanceResponse {
    fn from(instance: DatabaseInstance) -> Self {
        Self {
            id: instance.id,
            engine_type: instance.engine_type.as_str().to_string(),
            name: instance.name,
            version: instance.version,
            install_path: instance.install_path.display().to_string(),
            data_path: instance.data_path.display().to_string(),
            log_path: instance.log_path.display().to_string(),
            config_path: instance.config_path.map(|p| p.display().to_string()),
            port: instance.port,
            username: instance.username,
            password: instance.password,
            status: instance.status.as_str().to_string(),
            pid: instance.pid,
            auto_start: instance.auto_start,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct EngineResponse {
    engine_type: String,
    display_name: String,
    default_port: u16,
    status: String,
    instance: Option<InstanceResponse>,
}

impl From<EngineOverview> for EngineResponse {
    fn from(overview: EngineOverview) -> Self {
        Self {
            engine_type: overview.engine_type.as_str().to_string(),
            display_name: overview.display_name.to_string(),
            default_port: overview.default_port,
            status: overview.status.as_str().to_string(),
            instance: overview.instance.map(InstanceResponse::from),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct TaskResponse {
    id: Uuid,
    task_type: String,
    engine_type: String,
    instance_id: Option<Uuid>,
    status: String,
    progress: u8,
    message: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AsyncTask> for TaskResponse {
    fn from(task: AsyncTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.as_str().to_string(),
            engine_type: task.engine_type.as_str().to_string(),
            instance_id: task.instance_id,
            status: task.status.to_string(),
            progress: task.progress,
            message: task.message,
            error: task.error,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct TaskAccepted {
    task_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
struct InstallBody {
    /// Engine wire name, e.g. `postgresql`.
    engine_type: String,
    /// Defaults to `latest`.
    #[serde(default)]
    version: Option<String>,
    /// Defaults to the engine's standard port.
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auto_start: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
struct AutoStartBody {
    enabled: bool,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct PurgeQuery {
    /// Also delete the engine's data directory.
    #[serde(default)]
    purge_data: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Conflict(_) | CoreError::NotRunning(_) => StatusCode::CONFLICT,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Process(_)
            | CoreError::Provisioning(_)
            | CoreError::InvariantViolation(_)
            | CoreError::Storage(_)
            | CoreError::Io(..) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "request rejected");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Daemon settings read from `LOCALDB_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub home: PathBuf,
    pub db_url: String,
    /// Start auto-start instances after the startup reconciliation.
    pub autostart: bool,
    pub core: CoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let listen_addr: SocketAddr = var("LOCALDB_API_ADDR")
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string())
            .parse()
            .context("invalid LOCALDB_API_ADDR")?;

        let home = var("LOCALDB_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_home(&var));
        let db_url = var("LOCALDB_DB_DSN")
            .unwrap_or_else(|| format!("sqlite://{}", home.join("state.db").display()));

        let mut core = CoreConfig::with_storage_root(home.clone());
        if let Some(interval) = secs_var(&var, "LOCALDB_SYNC_INTERVAL_SECS")? {
            if interval.is_zero() {
                bail!("LOCALDB_SYNC_INTERVAL_SECS must be at least 1");
            }
            core.sync_interval = interval;
        }
        if let Some(timeout) = secs_var(&var, "LOCALDB_STOP_TIMEOUT_SECS")? {
            core.stop_timeout = timeout;
        }
        if let Some(retention) = secs_var(&var, "LOCALDB_TASK_RETENTION_SECS")? {
            core.task_retention = retention;
        }
        core.binary_source = var("LOCALDB_BINARY_SOURCE").map(PathBuf::from);

        let autostart = match var("LOCALDB_AUTOSTART") {
            Some(raw) => {
                parse_bool(&raw).ok_or_else(|| anyhow!("invalid LOCALDB_AUTOSTART '{raw}'"))?
            }
            None => true,
        };

        Ok(Self {
            listen_addr,
            home,
            db_url,
            autostart,
            core,
        })
    }
}

fn default_home(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("HOME")
        .or_else(|| var("USERPROFILE"))
        .map(|dir| PathBuf::from(dir).join(".local-db"))
        .unwrap_or_else(|| PathBuf::from(".local-db"))
}

fn secs_var(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("invalid {key} '{raw}'"))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub mod docs {
    use utoipa::OpenApi;

    #[derive(OpenApi)]
    #[openapi(
        info(
            title = "localdb-daemon API",
            version = "0.1.0",
            description = "Install, run and supervise local database engines."
        ),
        paths(
            super::healthz,
            super::list_engines,
            super::get_engine_instance,
            super::list_instances,
            super::get_instance,
            super::start_instance,
            super::stop_instance,
            super::restart_instance,
            super::delete_instance,
            super::set_auto_start,
            super::install,
            super::uninstall,
            super::list_tasks,
            super::get_task,
            super::sync_status,
            super::events
        ),
        components(schemas(
            super::HealthResponse,
            super::InstanceResponse,
            super::EngineResponse,
            super::TaskResponse,
            super::TaskAccepted,
            super::InstallBody,
            super::AutoStartBody,
            super::ErrorBody
        ))
    )]
    pub struct ApiDoc;
}
