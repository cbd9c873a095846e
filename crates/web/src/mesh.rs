//! Mesh client orchestration.
//!
//! Wraps the mesh-networking CLI: node status, funnel publish/unpublish,
//! serve configuration, and login flows. Parsing is split into pure functions
//! over captured output so it can be tested without a live tool. All parsing
//! is tolerant by design: the text formats are version-sensitive, and a line
//! we do not recognize is ignored rather than fatal.

use crate::config::MeshConfig;
use crate::exec;
use chrono::Utc;
use funneldeck_common::{
    is_valid_funnel_port, CommandResult, Error, FunnelConfig, NodeStatus, PublishedService,
    Result, ServeMode, ServiceProtocol, ServiceStatus, DEFAULT_FUNNEL_PORT, FUNNEL_PORTS,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle on the mesh-networking CLI.
#[derive(Debug, Clone)]
pub struct MeshClient {
    binary: String,
    timeout: Duration,
}

impl MeshClient {
    pub fn new(cfg: &MeshConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    async fn cli(&self, args: &[&str]) -> CommandResult {
        exec::run(&self.binary, args, self.timeout).await
    }

    /// Whether the CLI is installed and answering at all.
    pub async fn is_available(&self) -> bool {
        self.cli(&["version"]).await.success
    }

    pub async fn version(&self) -> CommandResult {
        self.cli(&["version"]).await
    }

    /// Current node status. Any failure degrades to the all-defaults status
    /// (not running, not logged in) rather than an error.
    pub async fn status(&self) -> NodeStatus {
        let result = self.cli(&["status", "--json"]).await;
        if !result.success {
            return NodeStatus::default();
        }
        parse_node_status(result.output.as_deref().unwrap_or(""))
    }

    /// Raw status JSON, for callers that need the peer list.
    pub async fn status_json(&self) -> Option<String> {
        let result = self.cli(&["status", "--json"]).await;
        if result.success {
            result.output
        } else {
            None
        }
    }

    /// Currently published funnel services. Failures and unparseable output
    /// both degrade to an empty list.
    pub async fn funnel_services(&self) -> Vec<PublishedService> {
        let result = self.cli(&["funnel", "status"]).await;
        if !result.success {
            return Vec::new();
        }
        parse_funnel_services(result.output.as_deref().unwrap_or(""))
    }

    pub async fn serve_status(&self) -> CommandResult {
        self.cli(&["serve", "status"]).await
    }

    /// Publish a service through the funnel.
    ///
    /// Validation happens locally before any subprocess runs: the port must
    /// be on the fixed allow-list, and a proxy target must carry a usable
    /// port. Proxy targets are rewritten to loopback; whatever host the
    /// caller supplied is deliberately discarded, because proxied targets
    /// are always same-host container ports.
    pub async fn start_funnel(&self, config: &FunnelConfig) -> Result<CommandResult> {
        let args = start_funnel_args(config)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.cli(&args).await)
    }

    /// Unpublish a funnel. The default port resets the whole funnel
    /// configuration; any other port turns off only that port. The two forms
    /// are not interchangeable.
    pub async fn stop_funnel(&self, port: u16) -> CommandResult {
        let args = stop_funnel_args(port);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cli(&args).await
    }

    /// Serve a path on the private network (no public funnel).
    pub async fn serve_path(&self, port: u16, path: &str, target: &str) -> CommandResult {
        self.cli(&["serve", &port.to_string(), path, target]).await
    }

    pub async fn serve_off(&self, port: u16) -> CommandResult {
        self.cli(&["serve", "off", &port.to_string()]).await
    }

    /// Bring the node up, optionally with a pre-authorized key.
    pub async fn up(&self, auth_key: Option<&str>) -> CommandResult {
        let key_arg;
        let mut args = vec!["up", "--accept-routes", "--accept-dns"];
        if let Some(key) = auth_key {
            key_arg = format!("--authkey={}", key);
            args.push(&key_arg);
        }
        self.cli(&args).await
    }

    pub async fn down(&self) -> CommandResult {
        self.cli(&["down"]).await
    }

    /// Probe the interactive login flow under a short timeout.
    ///
    /// `up` prints a login URL and then blocks until the browser flow
    /// completes, so this call is expected to time out; the URL is pulled
    /// out of the partial output afterwards.
    pub async fn check_login(&self) -> Option<String> {
        let result = exec::run(
            &self.binary,
            &["up", "--accept-routes", "--accept-dns"],
            exec::PROBE_TIMEOUT,
        )
        .await;
        let url = exec::extract_login_url(&result.combined_text());
        if url.is_none() {
            debug!("login probe produced no URL (exit {})", result.exit_code);
        }
        url
    }
}

/// Build the argument list for a funnel start, or a validation error.
/// Exposed for tests; no subprocess involvement.
pub fn start_funnel_args(config: &FunnelConfig) -> Result<Vec<String>> {
    if !is_valid_funnel_port(config.port) {
        return Err(Error::Validation(format!(
            "invalid port {}; funnel only supports ports {}",
            config.port,
            FUNNEL_PORTS.map(|p| p.to_string()).join(", ")
        )));
    }

    let args = match (config.serve_mode, config.target.as_deref()) {
        (ServeMode::Proxy, Some(target)) => {
            let target = normalize_proxy_target(target).ok_or_else(|| {
                Error::Validation(format!("proxy target '{}' has no usable port", target))
            })?;
            vec![
                "funnel".to_string(),
                format!("{}:/{}={}", config.protocol, config.path, target),
            ]
        }
        (ServeMode::Proxy, None) => {
            return Err(Error::Validation(
                "proxy mode requires a target".to_string(),
            ))
        }
        (ServeMode::Files, Some(target)) => vec![
            "funnel".to_string(),
            format!("{}={}", config.path, target),
        ],
        _ => vec!["funnel".to_string(), config.port.to_string()],
    };

    Ok(args)
}

/// Build the argument list for a funnel stop. The default port uses the
/// reset-all form; any other port uses the per-port off form.
pub fn stop_funnel_args(port: u16) -> Vec<String> {
    if port == DEFAULT_FUNNEL_PORT {
        vec!["funnel".to_string(), "reset".to_string()]
    } else {
        vec!["funnel".to_string(), "off".to_string(), port.to_string()]
    }
}

/// Rewrite a proxy target to loopback, trusting only its port component.
///
/// Accepts `host:port`, `localhost:port`, or a bare port. Returns `None`
/// when no port can be extracted.
pub fn normalize_proxy_target(target: &str) -> Option<String> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", target),
    };
    let port: u16 = port.parse().ok()?;

    if matches!(host, "127.0.0.1" | "localhost" | "[::1]" | "::1") {
        return Some(target.to_string());
    }
    Some(format!("127.0.0.1:{}", port))
}

// Status JSON documents, parsed leniently (every field optional).
#[derive(Debug, Default, Deserialize)]
#[allow(non_snake_case)]
struct StatusJson {
    BackendState: Option<String>,
    Version: Option<String>,
    #[serde(rename = "Self")]
    SelfNode: Option<NodeJson>,
    Peer: Option<HashMap<String, NodeJson>>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(non_snake_case)]
struct NodeJson {
    HostName: Option<String>,
    DNSName: Option<String>,
    TailscaleIPs: Option<Vec<String>>,
    Online: Option<bool>,
    Capabilities: Option<Vec<String>>,
    PublicKey: Option<String>,
}

/// The backend-state sentinel meaning "daemon up, nothing configured".
const NO_STATE: &str = "NoState";

/// Parse `status --json` output into a [`NodeStatus`].
///
/// Missing fields resolve to defaults. Being logged in requires both a
/// "Running" backend state and an explicit online flag on the self record;
/// a running daemon that lost its session reports `running` but not
/// `logged_in`. Malformed JSON degrades to the all-defaults status.
pub fn parse_node_status(json: &str) -> NodeStatus {
    let status: StatusJson = match serde_json::from_str(json) {
        Ok(status) => status,
        Err(e) => {
            warn!("unparseable mesh status JSON: {}", e);
            return NodeStatus::default();
        }
    };

    let backend = status.BackendState.as_deref();
    let node = status.SelfNode.unwrap_or_default();
    let online = node.Online.unwrap_or(false);

    NodeStatus {
        running: matches!(backend, Some(state) if state != NO_STATE),
        logged_in: backend == Some("Running") && online,
        hostname: node.HostName,
        ip_address: node
            .TailscaleIPs
            .as_ref()
            .and_then(|ips| ips.first().cloned()),
        magic_dns_name: node.DNSName,
        version: status.Version,
        funnel_capable: node
            .Capabilities
            .map(|caps| caps.iter().any(|c| c == "funnel"))
            .unwrap_or(false),
    }
}

/// A peer (or the node itself) matched by mesh address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: String,
    pub username: String,
    pub is_self: bool,
}

/// Look up which mesh node owns `addr` in a `status --json` document.
///
/// Returns the matching peer, the node itself (`is_self`), or `None` when
/// the address is not part of the mesh. Malformed JSON is a non-match.
pub fn find_peer_by_address(json: &str, addr: &str) -> Option<PeerIdentity> {
    let status: StatusJson = serde_json::from_str(json).ok()?;

    if let Some(peers) = &status.Peer {
        for (node_key, peer) in peers {
            let ips = peer.TailscaleIPs.as_deref().unwrap_or_default();
            if ips.iter().any(|ip| ip == addr) {
                return Some(PeerIdentity {
                    id: node_key.clone(),
                    username: peer
                        .DNSName
                        .clone()
                        .or_else(|| peer.HostName.clone())
                        .unwrap_or_else(|| "Mesh User".to_string()),
                    is_self: false,
                });
            }
        }
    }

    let node = status.SelfNode?;
    let ips = node.TailscaleIPs.as_deref().unwrap_or_default();
    if ips.iter().any(|ip| ip == addr) {
        return Some(PeerIdentity {
            id: node.PublicKey.unwrap_or_else(|| "self".to_string()),
            username: node
                .DNSName
                .or(node.HostName)
                .unwrap_or_else(|| "Local User".to_string()),
            is_self: true,
        });
    }

    None
}

// Line-oriented funnel status parsing: a two-state scanner over classified
// lines. "Port:" opens a record (flushing any open one), "Path:" and URL
// lines attach to the open record, anything else is ignored.

enum LineClass<'a> {
    Url(&'a str),
    KeyValue(&'a str, &'a str),
    Other,
}

fn classify_line(line: &str) -> LineClass<'_> {
    if let Some(idx) = line.find("https://") {
        let url = &line[idx..];
        let end = url
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '/')))
            .map(|(i, _)| i)
            .unwrap_or(url.len());
        return LineClass::Url(&url[..end]);
    }
    if let Some((key, value)) = line.split_once(':') {
        return LineClass::KeyValue(key.trim(), value.trim());
    }
    LineClass::Other
}

fn new_service(port: u16) -> PublishedService {
    PublishedService {
        id: format!("funnel-{}-{}", port, Uuid::new_v4().simple()),
        name: format!("Service on port {}", port),
        port,
        path: None,
        url: None,
        status: ServiceStatus::Active,
        protocol: ServiceProtocol::Https,
        created_at: Utc::now(),
        metrics: None,
    }
}

/// Parse `funnel status` text into published services.
///
/// The format is inherently fragile (it tracks the tool's human-readable
/// layout), so the scanner never errors: unknown lines are skipped, a
/// non-numeric port drops that line, and worst case the result is an empty
/// or partial list. Identical input always yields structurally equal output.
pub fn parse_funnel_services(text: &str) -> Vec<PublishedService> {
    let mut services = Vec::new();
    let mut open: Option<PublishedService> = None;

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match classify_line(line) {
            LineClass::Url(url) => {
                if let Some(service) = open.as_mut() {
                    service.url = Some(url.to_string());
                }
            }
            LineClass::KeyValue("Port", value) => {
                // Non-numeric port: drop this line, keep scanning.
                if let Ok(port) = value.parse::<u16>() {
                    if let Some(done) = open.take() {
                        services.push(done);
                    }
                    open = Some(new_service(port));
                }
            }
            LineClass::KeyValue("Path", value) => {
                if let Some(service) = open.as_mut() {
                    service.path = Some(value.to_string());
                }
            }
            LineClass::KeyValue(..) | LineClass::Other => {}
        }
    }

    if let Some(done) = open.take() {
        services.push(done);
    }

    services
}
