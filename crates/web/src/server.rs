//! HTTP server: router, handlers, auth middleware, error mapping.

use crate::auth::{AuthResolver, RequestMeta, SessionManager, SESSION_COOKIE, SESSION_TTL};
use crate::config::AppConfig;
use crate::docker::ContainerInspector;
use crate::mesh::MeshClient;
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use funneldeck_common::{Container, Error, FunnelConfig, ServiceStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared server state. Config is immutable after boot; the component
/// handles are stateless, so cloning the Arc is the whole story.
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub mesh: Arc<MeshClient>,
    pub docker: Arc<ContainerInspector>,
    pub auth: AuthResolver,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(cfg: AppConfig) -> Self {
        let cfg = Arc::new(cfg);
        let mesh = Arc::new(MeshClient::new(&cfg.mesh));
        let docker = Arc::new(ContainerInspector::new(&cfg.runtime));
        let sessions = SessionManager::new();
        let auth = AuthResolver::new(&cfg, mesh.clone(), docker.clone(), sessions);
        Self {
            cfg,
            mesh,
            docker,
            auth,
            sessions,
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Error response for API handlers. Validation detail goes back to the
/// caller; subprocess detail is logged and replaced with a generic message.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn internal(detail: &str) -> Self {
        error!("internal error: {}", detail);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(msg) => Self::bad_request(msg.clone()),
            Error::InvalidConfig(msg) => Self::bad_request(msg.clone()),
            Error::Auth(msg) => Self::unauthorized(msg.clone()),
            _ => Self::internal(&err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ============================================================================
// Auth middleware
// ============================================================================

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let meta = RequestMeta::from_headers(request.headers());
    let result = state.auth.resolve(&meta).await;
    if result.authenticated {
        return next.run(request).await;
    }
    warn!(
        "unauthenticated request to {}: {}",
        request.uri().path(),
        result.error.as_deref().unwrap_or("no detail")
    );
    ApiError::unauthorized(
        result
            .error
            .unwrap_or_else(|| "authentication required".to_string()),
    )
    .into_response()
}

// ============================================================================
// Handlers: health and status
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn mesh_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.mesh.status().await;
    Json(json!(status))
}

async fn funnel_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let services = state.mesh.funnel_services().await;
    let active = services
        .iter()
        .filter(|s| s.status == ServiceStatus::Active)
        .count();
    Json(json!({
        "enabled": !services.is_empty(),
        "active_services": active,
        "services": services,
    }))
}

async fn funnel_services(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let services = state.mesh.funnel_services().await;
    let serve = state.mesh.serve_status().await;
    Json(json!({
        "services": services,
        "serve_detail": serve.output,
    }))
}

// ============================================================================
// Handlers: funnel mutations
// ============================================================================

async fn funnel_start(
    State(state): State<Arc<AppState>>,
    Json(config): Json<FunnelConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.mesh.start_funnel(&config).await?;
    if !result.success {
        return Err(ApiError::internal(&format!(
            "funnel start on port {} failed: {}",
            config.port,
            result.error.as_deref().unwrap_or("unknown")
        )));
    }
    info!(port = config.port, path = %config.path, "funnel started");
    Ok(Json(json!({
        "success": true,
        "port": config.port,
        "path": config.path,
        "protocol": config.protocol,
    })))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    port: u16,
}

async fn funnel_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.mesh.stop_funnel(req.port).await;
    if !result.success {
        return Err(ApiError::internal(&format!(
            "funnel stop on port {} failed: {}",
            req.port,
            result.error.as_deref().unwrap_or("unknown")
        )));
    }
    info!(port = req.port, "funnel stopped");
    Ok(Json(json!({ "success": true, "port": req.port })))
}

// ============================================================================
// Handlers: containers and derived views
// ============================================================================

async fn containers(State(state): State<Arc<AppState>>) -> Json<Vec<Container>> {
    let containers = state
        .docker
        .list_containers()
        .await
        .into_iter()
        .filter(|c| c.is_running())
        .collect();
    Json(containers)
}

async fn container_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    container_action(state.docker.start_container(&id).await, &id, "start")
}

async fn container_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    container_action(state.docker.stop_container(&id).await, &id, "stop")
}

async fn container_restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    container_action(state.docker.restart_container(&id).await, &id, "restart")
}

fn container_action(
    result: funneldeck_common::CommandResult,
    id: &str,
    verb: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !result.success {
        return Err(ApiError::internal(&format!(
            "container {} {} failed: {}",
            id,
            verb,
            result.error.as_deref().unwrap_or("unknown")
        )));
    }
    info!(container = id, action = verb, "container action completed");
    Ok(Json(json!({ "success": true, "id": id })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

async fn container_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.docker.logs(&id, query.tail.unwrap_or(100)).await;
    if !result.success {
        return Err(ApiError::internal(&format!(
            "logs for container {} failed: {}",
            id,
            result.error.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(Json(json!({ "id": id, "logs": result.combined_text() })))
}

/// Coarse classification of a listening port, for the services view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Ssh,
    Http,
    Https,
    Dns,
    Other,
}

pub fn classify_port(port: u16) -> ServiceType {
    match port {
        22 => ServiceType::Ssh,
        80 | 8080 | 3000 | 5000 | 9000 => ServiceType::Http,
        443 | 8443 => ServiceType::Https,
        53 => ServiceType::Dns,
        _ => ServiceType::Other,
    }
}

#[derive(Debug, Serialize)]
pub struct NetworkService {
    pub name: String,
    pub port: u16,
    pub service_type: ServiceType,
    pub container: String,
}

/// Flatten running containers' published ports into a typed service list.
pub fn network_services(containers: &[Container]) -> Vec<NetworkService> {
    let mut services: Vec<NetworkService> = containers
        .iter()
        .filter(|c| c.is_running())
        .flat_map(|c| {
            c.ports
                .iter()
                .filter_map(move |p| p.external_port.map(|external| (c, external)))
                .map(|(c, external)| NetworkService {
                    name: format!("{}:{}", c.name.trim_start_matches('/'), external),
                    port: external,
                    service_type: classify_port(external),
                    container: c.name.trim_start_matches('/').to_string(),
                })
        })
        .collect();
    services.sort_by_key(|s| (s.service_type, s.port));
    services
}

async fn services(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let containers = state.docker.list_containers().await;
    let services = network_services(&containers);
    Json(json!({ "total": services.len(), "services": services }))
}

async fn apps(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let apps = state.docker.managed_apps().await;
    Json(json!({ "total": apps.len(), "apps": apps }))
}

/// Aggregate dashboard status, assembled from the components directly rather
/// than by calling back into our own HTTP surface.
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let node = state.mesh.status().await;
    let funnel = state.mesh.funnel_services().await;
    let containers = state.docker.list_containers().await;
    let running = containers.iter().filter(|c| c.is_running()).count();
    let apps = state.docker.managed_apps().await;
    let runtime_version = state.docker.version().await;

    Json(json!({
        "timestamp": Utc::now(),
        "mesh": node,
        "funnel": {
            "enabled": !funnel.is_empty(),
            "services": funnel,
        },
        "containers": {
            "total": containers.len(),
            "running": running,
        },
        "apps": apps.len(),
        "runtime_version": runtime_version,
    }))
}

// ============================================================================
// Handlers: auth endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.cfg.auth.cookie_secure)
        .max_age(time::Duration::seconds(SESSION_TTL.as_secs() as i64))
        .build()
}

async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    if !state.auth.enabled() {
        return Err(ApiError::bad_request("authentication is disabled"));
    }
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    if !state.auth.credentials_match(&req.username, &req.password) {
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    let token = state.sessions.issue(&req.username);
    info!(username = %req.username, "login succeeded");
    Ok((
        jar.add(session_cookie(&state, token)),
        Json(json!({ "success": true, "username": req.username })),
    ))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, Json<serde_json::Value>) {
    let mut cookie = session_cookie(&state, String::new());
    cookie.set_max_age(time::Duration::ZERO);
    (jar.add(cookie), Json(json!({ "success": true })))
}

async fn auth_status(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Json<serde_json::Value> {
    let meta = RequestMeta::from_headers(&headers);
    let result = state.auth.resolve(&meta).await;
    Json(json!({
        "auth_enabled": state.auth.enabled(),
        "authenticated": result.authenticated,
        "username": result.user.map(|u| u.username),
    }))
}

// ============================================================================
// Handlers: setup flow
// ============================================================================

async fn setup_check_login(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.mesh.is_available().await {
        return Err(ApiError::internal("mesh CLI is not available"));
    }

    let status = state.mesh.status().await;
    if status.running && status.logged_in {
        return Ok(Json(json!({
            "requires_login": false,
            "hostname": status.hostname,
        })));
    }

    match state.mesh.check_login().await {
        Some(url) => Ok(Json(json!({
            "requires_login": true,
            "login_url": url,
        }))),
        None => Err(ApiError::internal("login probe produced no URL")),
    }
}

#[derive(Debug, Deserialize)]
struct AuthKeyRequest {
    auth_key: String,
}

/// Pre-authorized keys carry a fixed prefix; anything else is rejected
/// before any subprocess runs.
pub fn is_valid_auth_key(key: &str) -> bool {
    key.starts_with("tskey-") && key.len() > "tskey-".len()
}

async fn setup_auth_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthKeyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !is_valid_auth_key(req.auth_key.trim()) {
        return Err(ApiError::bad_request(
            "auth key must start with the tskey- prefix",
        ));
    }

    state.mesh.down().await;
    let result = state.mesh.up(Some(req.auth_key.trim())).await;

    // The daemon takes a moment to settle after `up` before status reflects
    // the new login state.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = state.mesh.status().await;

    if status.logged_in {
        info!(hostname = ?status.hostname, "node joined mesh with auth key");
        return Ok(Json(json!({
            "success": true,
            "hostname": status.hostname,
        })));
    }

    // The key may have been rejected with an interactive-login fallback URL
    // in the output.
    if let Some(url) = crate::exec::extract_login_url(&result.combined_text()) {
        return Ok(Json(json!({
            "success": false,
            "login_url": url,
        })));
    }

    Err(ApiError::internal(&format!(
        "auth key login failed: {}",
        result.error.as_deref().unwrap_or("status still logged out")
    )))
}

// ============================================================================
// Router and entrypoint
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/mesh/status", get(mesh_status))
        .route("/api/funnel/status", get(funnel_status))
        .route("/api/funnel/services", get(funnel_services))
        .route("/api/funnel/start", post(funnel_start))
        .route("/api/funnel/stop", post(funnel_stop))
        .route("/api/containers", get(containers))
        .route("/api/containers/:id/start", post(container_start))
        .route("/api/containers/:id/stop", post(container_stop))
        .route("/api/containers/:id/restart", post(container_restart))
        .route("/api/containers/:id/logs", get(container_logs))
        .route("/api/services", get(services))
        .route("/api/apps", get(apps))
        .route("/api/status", get(status))
        .route("/api/setup/check-login", post(setup_check_login))
        .route("/api/setup/auth-key", post(setup_auth_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/status", get(auth_status));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    protected
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(cfg: AppConfig) -> anyhow::Result<()> {
    let listen = cfg.listen.clone();
    let state = Arc::new(AppState::new(cfg));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("listening on http://{}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use funneldeck_common::PortMapping;

    fn container(name: &str, state: &str, ports: &[(u16, Option<u16>)]) -> Container {
        Container {
            id: "id".to_string(),
            name: name.to_string(),
            image: "img".to_string(),
            status: String::new(),
            state: state.to_string(),
            ports: ports
                .iter()
                .map(|(internal, external)| PortMapping {
                    internal_port: *internal,
                    external_port: *external,
                    transport: "tcp".to_string(),
                })
                .collect(),
            labels: Default::default(),
            created_at: String::new(),
        }
    }

    #[test]
    fn ports_classify_by_well_known_number() {
        assert_eq!(classify_port(22), ServiceType::Ssh);
        assert_eq!(classify_port(80), ServiceType::Http);
        assert_eq!(classify_port(3000), ServiceType::Http);
        assert_eq!(classify_port(443), ServiceType::Https);
        assert_eq!(classify_port(8443), ServiceType::Https);
        assert_eq!(classify_port(53), ServiceType::Dns);
        assert_eq!(classify_port(12345), ServiceType::Other);
    }

    #[test]
    fn services_sorted_by_type_then_port() {
        let containers = vec![
            container("a", "running", &[(80, Some(9999)), (80, Some(8080))]),
            container("b", "running", &[(22, Some(22))]),
            container("c", "exited", &[(443, Some(443))]),
        ];
        let services = network_services(&containers);
        let keys: Vec<(ServiceType, u16)> =
            services.iter().map(|s| (s.service_type, s.port)).collect();
        assert_eq!(
            keys,
            vec![
                (ServiceType::Ssh, 22),
                (ServiceType::Http, 8080),
                (ServiceType::Other, 9999),
            ]
        );
    }

    #[test]
    fn unpublished_ports_are_not_services() {
        let containers = vec![container("a", "running", &[(80, None)])];
        assert!(network_services(&containers).is_empty());
    }

    #[test]
    fn auth_key_prefix_validation() {
        assert!(is_valid_auth_key("tskey-auth-abc123"));
        assert!(!is_valid_auth_key("tskey-"));
        assert!(!is_valid_auth_key("key-abc"));
        assert!(!is_valid_auth_key(""));
    }

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = ApiError::from(Error::Validation("bad port".to_string()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "bad port");

        let err = ApiError::from(Error::Auth("denied".to_string()));
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        // Subprocess detail never reaches the client body.
        let err = ApiError::from(Error::CommandFailed("secret detail".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal server error");
    }
}
