//! Container runtime inspection.
//!
//! Lists containers and their port mappings by shelling out to the container
//! runtime CLI, and derives installed-application metadata from container
//! labels. One listing call plus one inspect call per container: O(n)
//! subprocess invocations, acceptable for a single host's container count.

use crate::config::RuntimeConfig;
use crate::exec;
use funneldeck_common::{CommandResult, Container, ManagedApp, PortMapping};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Container runtime detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Detect available container runtime
    pub fn detect() -> Option<Self> {
        // Check podman first (rootless friendly)
        if Command::new("podman").arg("--version").output().is_ok() {
            return Some(Self::Podman);
        }
        // Then docker
        if Command::new("docker").arg("--version").output().is_ok() {
            return Some(Self::Docker);
        }
        None
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Label keys and name heuristics marking a container as a platform-managed
/// application.
const MANAGED_NAME_LABELS: [&str; 4] = [
    "casa.app.name",
    "casa.app.title",
    "casaos.app.name",
    "org.opencontainers.image.title",
];
const MANAGED_FLAG_LABEL: &str = "io.casaos.app";
const MANAGED_NAME_PREFIX: &str = "casaos-";

/// Ports preferred when picking an app's primary port.
const COMMON_HTTP_PORTS: [u16; 7] = [80, 443, 8080, 8443, 3000, 5000, 9000];

/// Counts derived from a container listing.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ContainerStats {
    pub total: usize,
    pub running: usize,
}

/// Handle on the container runtime CLI.
#[derive(Debug, Clone)]
pub struct ContainerInspector {
    binary: Option<String>,
    timeout: Duration,
}

impl ContainerInspector {
    /// Build an inspector. An explicit binary from config wins; otherwise
    /// the runtime is auto-detected per call so a runtime installed after
    /// startup is still picked up.
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    fn command(&self) -> Option<String> {
        if let Some(binary) = &self.binary {
            return Some(binary.clone());
        }
        ContainerRuntime::detect().map(|r| r.command().to_string())
    }

    async fn cli(&self, args: &[&str]) -> CommandResult {
        match self.command() {
            Some(binary) => exec::run(&binary, args, self.timeout).await,
            None => CommandResult {
                success: false,
                output: None,
                error: Some("no container runtime available".to_string()),
                exit_code: -1,
            },
        }
    }

    /// List all containers (running and stopped) with port bindings and
    /// labels. Per-container parse failures are logged and skipped; a
    /// failed listing degrades to an empty list.
    pub async fn list_containers(&self) -> Vec<Container> {
        let listing = self.cli(&["ps", "-a", "--format", "{{json .}}"]).await;
        if !listing.success {
            warn!(
                "container listing failed: {}",
                listing.error.as_deref().unwrap_or("unknown")
            );
            return Vec::new();
        }

        let stdout = listing.output.unwrap_or_default();
        let mut containers = Vec::new();

        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let summary: PsJson = match serde_json::from_str(line) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("skipping unparseable container line: {}", e);
                    continue;
                }
            };
            let id = match summary.ID.clone() {
                Some(id) if !id.is_empty() => id,
                _ => continue,
            };

            // One inspect per container for ports and labels. Failure skips
            // just this container, never the whole listing.
            let detail = self.cli(&["inspect", &id]).await;
            let inspect_json = detail.output.as_deref().unwrap_or("[]");
            let (ports, labels) = match parse_inspect_detail(inspect_json) {
                Some(detail) => detail,
                None => {
                    warn!("skipping container {}: unparseable inspect output", id);
                    continue;
                }
            };

            containers.push(Container {
                id,
                name: summary.Names.unwrap_or_default(),
                image: summary.Image.unwrap_or_default(),
                status: summary.Status.unwrap_or_default(),
                state: summary.State.unwrap_or_default(),
                ports,
                labels,
                created_at: summary.CreatedAt.unwrap_or_default(),
            });
        }

        debug!("listed {} containers", containers.len());
        containers
    }

    /// Applications the host platform manages, derived from labels on the
    /// current container set.
    pub async fn managed_apps(&self) -> Vec<ManagedApp> {
        self.list_containers()
            .await
            .iter()
            .filter(|c| is_managed_application(c))
            .map(|c| ManagedApp {
                id: c.id.clone(),
                name: app_display_name(c),
                description: c
                    .labels
                    .get("casa.app.description")
                    .cloned()
                    .or_else(|| Some(c.image.clone())),
                category: c.labels.get("casa.app.category").cloned(),
                port: primary_port(c),
                state: c.state.clone(),
                icon: c.labels.get("casa.app.icon").cloned(),
                url: c.labels.get("casa.app.url").cloned(),
            })
            .collect()
    }

    pub async fn stats(&self) -> ContainerStats {
        let containers = self.list_containers().await;
        ContainerStats {
            total: containers.len(),
            running: containers.iter().filter(|c| c.is_running()).count(),
        }
    }

    pub async fn version(&self) -> Option<String> {
        let result = self.cli(&["--version"]).await;
        if result.success {
            result.output
        } else {
            None
        }
    }

    /// Whether a container with the given name fragment is currently up.
    /// Used to probe the host platform's own container before trusting it
    /// for authentication.
    pub async fn is_container_up(&self, name: &str) -> bool {
        let filter = format!("name={}", name);
        let result = self
            .cli(&["ps", "--filter", &filter, "--format", "{{.Status}}"])
            .await;
        result.success
            && result
                .output
                .map(|out| out.contains("Up"))
                .unwrap_or(false)
    }

    pub async fn start_container(&self, id: &str) -> CommandResult {
        self.cli(&["start", id]).await
    }

    pub async fn stop_container(&self, id: &str) -> CommandResult {
        self.cli(&["stop", id]).await
    }

    pub async fn restart_container(&self, id: &str) -> CommandResult {
        self.cli(&["restart", id]).await
    }

    pub async fn logs(&self, id: &str, tail: u32) -> CommandResult {
        self.cli(&["logs", "--tail", &tail.to_string(), id]).await
    }
}

// Internal JSON parsing structs (docker/podman `ps` output)
#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct PsJson {
    ID: Option<String>,
    Names: Option<String>,
    Image: Option<String>,
    Status: Option<String>,
    State: Option<String>,
    CreatedAt: Option<String>,
}

/// Pull port bindings and labels out of `inspect` output (an array with one
/// document). Returns `None` when the shape is unrecognizable.
fn parse_inspect_detail(json: &str) -> Option<(Vec<PortMapping>, HashMap<String, String>)> {
    let docs: serde_json::Value = serde_json::from_str(json).ok()?;
    let doc = docs.as_array()?.first()?;

    let mut ports = Vec::new();
    if let Some(port_map) = doc
        .pointer("/NetworkSettings/Ports")
        .and_then(|v| v.as_object())
    {
        for (key, bindings) in port_map {
            // Keys look like "80/tcp".
            let (port_str, transport) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let internal_port: u16 = match port_str.parse() {
                Ok(port) => port,
                Err(_) => continue,
            };

            let host_ports: Vec<Option<u16>> = bindings
                .as_array()
                .map(|binds| {
                    binds
                        .iter()
                        .map(|b| {
                            b.get("HostPort")
                                .and_then(|p| p.as_str())
                                .and_then(|p| p.parse().ok())
                        })
                        .collect()
                })
                .unwrap_or_default();

            if host_ports.is_empty() {
                ports.push(PortMapping {
                    internal_port,
                    external_port: None,
                    transport: transport.to_string(),
                });
            } else {
                for external_port in host_ports {
                    ports.push(PortMapping {
                        internal_port,
                        external_port,
                        transport: transport.to_string(),
                    });
                }
            }
        }
    }
    ports.sort_by_key(|p| (p.internal_port, p.external_port));

    let labels = doc
        .pointer("/Config/Labels")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some((ports, labels))
}

/// Whether a container is a platform-managed application: any of the known
/// name labels, the explicit managed flag, or the managed name prefix.
pub fn is_managed_application(container: &Container) -> bool {
    MANAGED_NAME_LABELS
        .iter()
        .any(|label| container.labels.contains_key(*label))
        || container.labels.get(MANAGED_FLAG_LABEL).map(String::as_str) == Some("true")
        || container.name.contains(MANAGED_NAME_PREFIX)
}

/// Display name precedence: explicit name label, title label, alternate
/// platform label, generic image-title label, then the container's own name
/// with the managed prefix stripped.
pub fn app_display_name(container: &Container) -> String {
    for label in MANAGED_NAME_LABELS {
        if let Some(name) = container.labels.get(label) {
            return name.clone();
        }
    }
    container
        .name
        .trim_start_matches('/')
        .trim_start_matches(MANAGED_NAME_PREFIX)
        .to_string()
}

/// Pick an app's primary port: prefer well-known HTTP ports, else the first
/// mapping.
pub fn primary_port(container: &Container) -> Option<u16> {
    for port in COMMON_HTTP_PORTS {
        if container.ports.iter().any(|p| p.internal_port == port) {
            return Some(port);
        }
    }
    container.ports.first().map(|p| p.internal_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, labels: &[(&str, &str)], ports: &[(u16, Option<u16>)]) -> Container {
        Container {
            id: "abc123".to_string(),
            name: name.to_string(),
            image: "example/image:latest".to_string(),
            status: "Up 2 hours".to_string(),
            state: "running".to_string(),
            ports: ports
                .iter()
                .map(|(internal, external)| PortMapping {
                    internal_port: *internal,
                    external_port: *external,
                    transport: "tcp".to_string(),
                })
                .collect(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn managed_detection_by_label_flag_and_prefix() {
        assert!(is_managed_application(&container(
            "web",
            &[("casa.app.name", "Files")],
            &[]
        )));
        assert!(is_managed_application(&container(
            "web",
            &[("io.casaos.app", "true")],
            &[]
        )));
        assert!(is_managed_application(&container("casaos-files", &[], &[])));
        assert!(!is_managed_application(&container(
            "plain-nginx",
            &[("maintainer", "someone")],
            &[]
        )));
    }

    #[test]
    fn display_name_precedence_order() {
        let c = container(
            "casaos-files",
            &[
                ("org.opencontainers.image.title", "Image Title"),
                ("casa.app.title", "App Title"),
                ("casa.app.name", "App Name"),
            ],
            &[],
        );
        assert_eq!(app_display_name(&c), "App Name");

        let c = container(
            "casaos-files",
            &[("org.opencontainers.image.title", "Image Title")],
            &[],
        );
        assert_eq!(app_display_name(&c), "Image Title");

        let c = container("/casaos-files", &[], &[]);
        assert_eq!(app_display_name(&c), "files");
    }

    #[test]
    fn primary_port_prefers_common_http_ports() {
        let c = container("app", &[], &[(5432, Some(5432)), (8080, Some(18080))]);
        assert_eq!(primary_port(&c), Some(8080));

        let c = container("app", &[], &[(5432, None)]);
        assert_eq!(primary_port(&c), Some(5432));

        let c = container("app", &[], &[]);
        assert_eq!(primary_port(&c), None);
    }

    #[test]
    fn inspect_detail_extracts_ports_and_labels() {
        let json = r#"[{
            "NetworkSettings": {
                "Ports": {
                    "80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}],
                    "443/tcp": null,
                    "53/udp": [{"HostPort": "53"}]
                }
            },
            "Config": {"Labels": {"casa.app.name": "Files", "ignored": null}}
        }]"#;
        let (ports, labels) = parse_inspect_detail(json).unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].internal_port, 53);
        assert_eq!(ports[0].transport, "udp");
        assert_eq!(ports[0].external_port, Some(53));
        assert_eq!(ports[1].internal_port, 80);
        assert_eq!(ports[1].external_port, Some(8080));
        assert_eq!(ports[2].internal_port, 443);
        assert_eq!(ports[2].external_port, None);
        assert_eq!(labels.get("casa.app.name").map(String::as_str), Some("Files"));
    }

    #[tokio::test]
    async fn unavailable_runtime_degrades_to_empty_results() {
        let inspector = ContainerInspector::new(&crate::config::RuntimeConfig {
            binary: Some("definitely-not-a-container-runtime".to_string()),
            timeout_secs: 5,
        });
        assert!(inspector.list_containers().await.is_empty());
        assert!(inspector.managed_apps().await.is_empty());
        let stats = inspector.stats().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.running, 0);
        assert!(!inspector.is_container_up("casaos").await);
    }

    #[test]
    fn inspect_detail_rejects_garbage_shapes() {
        assert!(parse_inspect_detail("not json").is_none());
        assert!(parse_inspect_detail("{}").is_none());
        assert!(parse_inspect_detail("[]").is_none());
        // Missing sections are tolerated, not fatal.
        let (ports, labels) = parse_inspect_detail("[{}]").unwrap();
        assert!(ports.is_empty());
        assert!(labels.is_empty());
    }
}
