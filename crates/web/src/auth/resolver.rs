//! Authentication strategy resolution.
//!
//! One strategy is selected by configuration and runs per request; the only
//! cross-strategy transition is the platform→mesh fallback documented in the
//! module table. Every path produces an [`AuthResult`]; failures are data,
//! surfaced as 401 by the HTTP layer.

use crate::auth::session::SessionManager;
use crate::config::AppConfig;
use crate::docker::ContainerInspector;
use crate::mesh::{self, MeshClient};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use funneldeck_common::{AuthResult, AuthUser, Error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cookie name the host platform uses for its own sessions.
const PLATFORM_COOKIE: &str = "casaos-session";

/// Configured authentication strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStrategy {
    Disabled,
    PlatformSession,
    MeshIdentity,
    StaticCredential,
}

impl Default for AuthStrategy {
    fn default() -> Self {
        Self::MeshIdentity
    }
}

impl std::str::FromStr for AuthStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "platform-session" => Ok(Self::PlatformSession),
            "mesh-identity" => Ok(Self::MeshIdentity),
            "static-credential" => Ok(Self::StaticCredential),
            other => Err(Error::InvalidConfig(format!(
                "unknown auth strategy '{}'",
                other
            ))),
        }
    }
}

/// The request metadata authentication needs, detached from the framework
/// request so strategies stay testable.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub remote_addr: Option<String>,
    pub authorization: Option<String>,
    pub platform_session: Option<String>,
    pub session_token: Option<String>,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            forwarded_for: header("x-forwarded-for"),
            real_ip: header("x-real-ip"),
            remote_addr: header("remote-addr"),
            authorization: header("authorization"),
            platform_session: cookie_value(headers, PLATFORM_COOKIE),
            session_token: cookie_value(headers, crate::auth::session::SESSION_COOKIE),
        }
    }
}

/// Read one cookie out of the Cookie header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Resolve the caller's network address from request headers.
///
/// Precedence: first forwarded-for entry, then the real-IP header, then a
/// literal remote-addr header, defaulting to loopback.
pub fn client_address(meta: &RequestMeta) -> String {
    if let Some(forwarded) = &meta.forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    meta.real_ip
        .clone()
        .or_else(|| meta.remote_addr.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Whether an address counts as trusted local access: loopback or an
/// RFC1918-style private range. Deliberate trust boundary: "came from a
/// private network" is treated as authorized local use.
pub fn is_trusted_local(addr: &str) -> bool {
    matches!(addr, "127.0.0.1" | "::1" | "localhost")
        || addr.starts_with("192.168.")
        || addr.starts_with("10.")
        || addr.starts_with("172.")
}

/// Decode an HTTP Basic Authorization header into (username, password).
pub fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Decide mesh-identity access from a status document and a caller address.
/// Pure so the policy is testable without a live mesh client.
pub fn mesh_identity_decision(status_json: Option<&str>, addr: &str) -> AuthResult {
    if let Some(json) = status_json {
        if let Some(peer) = mesh::find_peer_by_address(json, addr) {
            let role = if peer.is_self { "admin" } else { "user" };
            return AuthResult::allowed(Some(AuthUser {
                id: peer.id,
                username: peer.username,
                role: role.to_string(),
            }));
        }
    }

    if is_trusted_local(addr) {
        return AuthResult::allowed(Some(AuthUser {
            id: "local-user".to_string(),
            username: "Local User".to_string(),
            role: "admin".to_string(),
        }));
    }

    AuthResult::denied("access denied: not a mesh peer or local network")
}

/// Per-request authentication resolver.
#[derive(Clone)]
pub struct AuthResolver {
    strategy: AuthStrategy,
    platform_url: String,
    platform_container: String,
    username: String,
    password: String,
    mesh: Arc<MeshClient>,
    docker: Arc<ContainerInspector>,
    sessions: SessionManager,
    http: reqwest::Client,
}

impl AuthResolver {
    pub fn new(
        cfg: &AppConfig,
        mesh: Arc<MeshClient>,
        docker: Arc<ContainerInspector>,
        sessions: SessionManager,
    ) -> Self {
        let strategy = if cfg.auth.enabled {
            cfg.auth.strategy
        } else {
            AuthStrategy::Disabled
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            strategy,
            platform_url: cfg.auth.platform_url.clone(),
            platform_container: cfg.auth.platform_container.clone(),
            username: cfg.auth.username.clone(),
            password: cfg.auth.password.clone(),
            mesh,
            docker,
            sessions,
            http,
        }
    }

    pub fn strategy(&self) -> AuthStrategy {
        self.strategy
    }

    pub fn enabled(&self) -> bool {
        self.strategy != AuthStrategy::Disabled
    }

    /// Resolve authentication for one request. Runs exactly the configured
    /// strategy; disabled short-circuits without touching any subprocess.
    pub async fn resolve(&self, meta: &RequestMeta) -> AuthResult {
        match self.strategy {
            AuthStrategy::Disabled => AuthResult::allowed(None),
            AuthStrategy::PlatformSession => self.resolve_platform(meta).await,
            AuthStrategy::MeshIdentity => self.resolve_mesh(meta).await,
            AuthStrategy::StaticCredential => self.resolve_static(meta),
        }
    }

    /// Platform-session strategy. A request with no platform credentials at
    /// all is denied outright; the mesh fallback fires only for presented
    /// credentials the platform cannot confirm (container not up, API
    /// unreachable, or API says no).
    async fn resolve_platform(&self, meta: &RequestMeta) -> AuthResult {
        let bearer = meta
            .authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "));

        if meta.platform_session.is_none() && bearer.is_none() {
            return AuthResult::denied("no authentication provided");
        }

        if !self.docker.is_container_up(&self.platform_container).await {
            debug!("platform auth: platform container not up, falling back to mesh");
            return self.resolve_mesh(meta).await;
        }

        if let Some(session) = &meta.platform_session {
            let cookie = format!("{}={}", PLATFORM_COOKIE, session);
            if let Some(user) = self.platform_user_info(|req| req.header("Cookie", cookie)).await {
                return AuthResult::allowed(Some(user));
            }
        }

        if let Some(token) = bearer {
            let bearer_header = format!("Bearer {}", token);
            if let Some(user) = self
                .platform_user_info(|req| req.header("Authorization", bearer_header))
                .await
            {
                return AuthResult::allowed(Some(user));
            }
        }

        debug!("platform auth: platform rejected credentials, falling back to mesh");
        self.resolve_mesh(meta).await
    }

    /// Ask the platform's own API who this session belongs to.
    async fn platform_user_info<F>(&self, decorate: F) -> Option<AuthUser>
    where
        F: FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        let url = format!("{}/v1/user/info", self.platform_url.trim_end_matches('/'));
        let response = decorate(self.http.get(&url)).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        Some(AuthUser {
            id: data
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("platform-user")
                .to_string(),
            username: data
                .get("username")
                .and_then(|v| v.as_str())
                .unwrap_or("Platform User")
                .to_string(),
            role: data
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("user")
                .to_string(),
        })
    }

    async fn resolve_mesh(&self, meta: &RequestMeta) -> AuthResult {
        let addr = client_address(meta);
        let status_json = self.mesh.status_json().await;
        mesh_identity_decision(status_json.as_deref(), &addr)
    }

    fn resolve_static(&self, meta: &RequestMeta) -> AuthResult {
        // A session issued by the login endpoint stands in for credentials.
        if let Some(token) = &meta.session_token {
            let check = self.sessions.verify(token);
            if check.valid {
                let username = check.username.unwrap_or_default();
                return AuthResult::allowed(Some(AuthUser {
                    id: format!("session-{}", username),
                    username,
                    role: "admin".to_string(),
                }));
            }
        }

        match meta.authorization.as_deref().and_then(parse_basic_credentials) {
            Some((username, password)) => {
                if username == self.username && password == self.password {
                    AuthResult::allowed(Some(AuthUser {
                        id: format!("static-{}", username),
                        username,
                        role: "admin".to_string(),
                    }))
                } else {
                    AuthResult::denied("invalid credentials")
                }
            }
            None => AuthResult::denied("basic authentication required"),
        }
    }

    /// Exact-match check for the login endpoint.
    pub fn credentials_match(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn resolver(strategy: AuthStrategy, enabled: bool) -> AuthResolver {
        let mut cfg = AppConfig::default();
        cfg.auth.enabled = enabled;
        cfg.auth.strategy = strategy;
        cfg.auth.username = "admin".to_string();
        cfg.auth.password = "changeme".to_string();
        let mesh = Arc::new(MeshClient::new(&cfg.mesh));
        let docker = Arc::new(ContainerInspector::new(&cfg.runtime));
        AuthResolver::new(&cfg, mesh, docker, SessionManager::new())
    }

    #[tokio::test]
    async fn disabled_auth_allows_everything_without_subprocess() {
        let resolver = resolver(AuthStrategy::MeshIdentity, false);
        assert_eq!(resolver.strategy(), AuthStrategy::Disabled);
        let result = resolver.resolve(&RequestMeta::default()).await;
        assert!(result.authenticated);
        assert!(result.user.is_none());
    }

    #[tokio::test]
    async fn platform_strategy_denies_when_no_credentials_presented() {
        // No platform cookie and no bearer token: denied outright, with no
        // fallback to the mesh (which would grant local callers admin).
        let resolver = resolver(AuthStrategy::PlatformSession, true);
        let result = resolver.resolve(&RequestMeta::default()).await;
        assert!(!result.authenticated);
        assert!(result.user.is_none());
        assert_eq!(result.error.as_deref(), Some("no authentication provided"));
    }

    #[tokio::test]
    async fn static_credentials_exact_match_only() {
        let resolver = resolver(AuthStrategy::StaticCredential, true);

        let good = RequestMeta {
            authorization: Some(format!("Basic {}", BASE64.encode("admin:changeme"))),
            ..Default::default()
        };
        let result = resolver.resolve(&good).await;
        assert!(result.authenticated);
        assert_eq!(result.user.unwrap().role, "admin");

        let bad = RequestMeta {
            authorization: Some(format!("Basic {}", BASE64.encode("admin:wrong"))),
            ..Default::default()
        };
        assert!(!resolver.resolve(&bad).await.authenticated);

        let missing = RequestMeta::default();
        assert!(!resolver.resolve(&missing).await.authenticated);
    }

    #[tokio::test]
    async fn static_strategy_accepts_issued_session_cookie() {
        let resolver = resolver(AuthStrategy::StaticCredential, true);
        let sessions = SessionManager::new();
        let meta = RequestMeta {
            session_token: Some(sessions.issue("admin")),
            ..Default::default()
        };
        let result = resolver.resolve(&meta).await;
        assert!(result.authenticated);
        assert_eq!(result.user.unwrap().username, "admin");
    }

    const STATUS_JSON: &str = r#"{
        "BackendState": "Running",
        "Self": {
            "HostName": "deck-host",
            "TailscaleIPs": ["100.100.1.1"],
            "Online": true,
            "PublicKey": "nodekey:self"
        },
        "Peer": {
            "nodekey:peer1": {
                "HostName": "laptop",
                "TailscaleIPs": ["100.64.0.5"],
                "Online": true
            }
        }
    }"#;

    #[test]
    fn mesh_decision_peer_gets_user_role() {
        let result = mesh_identity_decision(Some(STATUS_JSON), "100.64.0.5");
        assert!(result.authenticated);
        let user = result.user.unwrap();
        assert_eq!(user.role, "user");
        assert_eq!(user.username, "laptop");
    }

    #[test]
    fn mesh_decision_own_address_gets_admin_role() {
        let result = mesh_identity_decision(Some(STATUS_JSON), "100.100.1.1");
        assert!(result.authenticated);
        assert_eq!(result.user.unwrap().role, "admin");
    }

    #[test]
    fn mesh_decision_private_range_is_trusted_local_access() {
        // Security-relevant: a private-range caller outside the peer list is
        // treated as trusted local access and granted admin.
        for addr in ["127.0.0.1", "192.168.1.50", "10.0.0.9", "172.16.0.2"] {
            let result = mesh_identity_decision(Some(STATUS_JSON), addr);
            assert!(result.authenticated, "{} should pass", addr);
            assert_eq!(result.user.unwrap().role, "admin");
        }
    }

    #[test]
    fn mesh_decision_public_stranger_is_denied() {
        let result = mesh_identity_decision(Some(STATUS_JSON), "203.0.113.7");
        assert!(!result.authenticated);
        assert!(result.error.is_some());

        // Mesh status unavailable: private callers still pass, others do not.
        assert!(mesh_identity_decision(None, "192.168.0.2").authenticated);
        assert!(!mesh_identity_decision(None, "203.0.113.7").authenticated);
    }

    #[test]
    fn client_address_header_precedence() {
        let meta = RequestMeta {
            forwarded_for: Some("100.64.0.5, 10.0.0.1".to_string()),
            real_ip: Some("9.9.9.9".to_string()),
            remote_addr: Some("8.8.8.8".to_string()),
            ..Default::default()
        };
        assert_eq!(client_address(&meta), "100.64.0.5");

        let meta = RequestMeta {
            real_ip: Some("9.9.9.9".to_string()),
            remote_addr: Some("8.8.8.8".to_string()),
            ..Default::default()
        };
        assert_eq!(client_address(&meta), "9.9.9.9");

        let meta = RequestMeta {
            remote_addr: Some("8.8.8.8".to_string()),
            ..Default::default()
        };
        assert_eq!(client_address(&meta), "8.8.8.8");

        assert_eq!(client_address(&RequestMeta::default()), "127.0.0.1");
    }

    #[test]
    fn basic_credentials_decode() {
        let header = format!("Basic {}", BASE64.encode("user:pa:ss"));
        let (user, pass) = parse_basic_credentials(&header).unwrap();
        assert_eq!(user, "user");
        assert_eq!(pass, "pa:ss");

        assert!(parse_basic_credentials("Bearer abc").is_none());
        assert!(parse_basic_credentials("Basic !!!").is_none());
    }

    #[test]
    fn strategy_parses_from_config_strings() {
        use std::str::FromStr;
        assert_eq!(
            AuthStrategy::from_str("mesh-identity").unwrap(),
            AuthStrategy::MeshIdentity
        );
        assert_eq!(
            AuthStrategy::from_str("platform-session").unwrap(),
            AuthStrategy::PlatformSession
        );
        assert!(AuthStrategy::from_str("totp").is_err());
    }

    #[test]
    fn cookie_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            "a=1; funneldeck-auth=tok en".parse().unwrap(),
        );
        // Cookie values are taken verbatim up to the next separator.
        assert_eq!(
            cookie_value(&headers, "funneldeck-auth").as_deref(),
            Some("tok en")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
