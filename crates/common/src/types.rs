//! Core domain types for FunnelDeck
//!
//! Everything here is derived fresh from the external tools on each request.
//! Nothing is persisted; the mesh client and container runtime are the source
//! of truth for published services and containers respectively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ports the mesh client accepts for public funnels.
pub const FUNNEL_PORTS: [u16; 3] = [443, 8443, 10000];

/// The reserved default funnel port. Stopping this port resets the whole
/// funnel configuration instead of turning off a single port.
pub const DEFAULT_FUNNEL_PORT: u16 = 443;

/// Check a port against the fixed funnel allow-list.
pub fn is_valid_funnel_port(port: u16) -> bool {
    FUNNEL_PORTS.contains(&port)
}

/// Outcome of a single external command invocation.
///
/// Produced once per invocation and never retained beyond the calling
/// operation. All subprocess failure is encoded here; the executor never
/// returns an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    /// Captured stdout, trimmed. Present even on failure or timeout when the
    /// tool printed something before dying (login flows print a URL before
    /// blocking).
    pub output: Option<String>,
    /// Captured stderr or a spawn/timeout description.
    pub error: Option<String>,
    pub exit_code: i32,
}

impl CommandResult {
    /// Combined stdout and error text, for scanning output that tools split
    /// inconsistently across both streams.
    pub fn combined_text(&self) -> String {
        let mut text = String::new();
        if let Some(out) = &self.output {
            text.push_str(out);
        }
        if let Some(err) = &self.error {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Mesh node status, derived fresh on every query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub running: bool,
    pub logged_in: bool,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub magic_dns_name: Option<String>,
    pub version: Option<String>,
    pub funnel_capable: bool,
}

/// Status of a published service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Error,
}

/// Protocol a published service fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    Http,
    Https,
}

impl std::fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// Traffic counters the mesh client may report for a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub bytes_transferred: u64,
    pub request_count: u64,
}

/// A funnel service published through the mesh client.
///
/// Synthesized when parsing status output. IDs are per-parse only; a process
/// restart loses them while the underlying published state lives on in the
/// mesh client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedService {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub path: Option<String>,
    pub url: Option<String>,
    pub status: ServiceStatus,
    pub protocol: ServiceProtocol,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ServiceMetrics>,
}

/// How a funnel forwards traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    /// Reverse-proxy to a local port (the common case for container apps).
    Proxy,
    /// Serve files from a path.
    Files,
    /// Serve a fixed text response.
    Text,
}

impl Default for ServeMode {
    fn default() -> Self {
        Self::Proxy
    }
}

/// Request to publish a service through the funnel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelConfig {
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_protocol")]
    pub protocol: ServiceProtocol,
    #[serde(default)]
    pub serve_mode: ServeMode,
    #[serde(default)]
    pub target: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_protocol() -> ServiceProtocol {
    ServiceProtocol::Https
}

/// A container port binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub internal_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    pub transport: String,
}

/// A container as reported by the container runtime. Derived fresh per
/// request and never mutated locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Human-readable status text ("Up 2 hours").
    pub status: String,
    /// Machine state ("running", "exited", "paused", ...). The runtime owns
    /// this vocabulary, so it stays a string.
    pub state: String,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub created_at: String,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// An installed application derived from container labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedApp {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub role: String,
}

/// Result of resolving authentication for one request. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResult {
    pub fn allowed(user: Option<AuthUser>) -> Self {
        Self {
            authenticated: true,
            user,
            error: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            user: None,
            error: Some(reason.into()),
        }
    }
}
