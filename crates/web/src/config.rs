//! Application configuration.
//!
//! Built once at startup and passed by reference; no component reads the
//! environment after boot.

use crate::auth::AuthStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the funneldeck server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listen address
    pub listen: String,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Mesh CLI configuration
    pub mesh: MeshConfig,

    /// Container runtime CLI configuration
    pub runtime: RuntimeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3080".to_string(),
            auth: AuthConfig::default(),
            mesh: MeshConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Master switch; off means every request passes
    pub enabled: bool,

    /// Strategy used when enabled
    pub strategy: AuthStrategy,

    /// Base URL of the host platform's API (platform-session strategy)
    pub platform_url: String,

    /// Container name whose liveness gates platform validation
    pub platform_container: String,

    /// Static credentials (static-credential strategy)
    pub username: String,
    pub password: String,

    /// Mark the session cookie Secure (behind TLS)
    pub cookie_secure: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: AuthStrategy::default(),
            platform_url: "http://127.0.0.1:81".to_string(),
            platform_container: "casaos".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            cookie_secure: false,
        }
    }
}

/// Mesh CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Mesh CLI binary name or path
    pub binary: String,

    /// Per-invocation timeout in seconds
    pub timeout_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            binary: "tailscale".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Container runtime CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime binary override; None auto-detects podman then docker
    pub binary: Option<String>,

    /// Per-invocation timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Build configuration from the process environment, starting from the
    /// config file named by `FUNNELDECK_CONFIG` (if any) and applying
    /// `FUNNELDECK_*` overrides on top.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("FUNNELDECK_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var("FUNNELDECK_LISTEN") {
            config.listen = listen;
        }
        if let Ok(enabled) = std::env::var("FUNNELDECK_AUTH_ENABLED") {
            config.auth.enabled = enabled != "false" && enabled != "0";
        }
        if let Ok(strategy) = std::env::var("FUNNELDECK_AUTH_STRATEGY") {
            config.auth.strategy = strategy.parse()?;
        }
        if let Ok(url) = std::env::var("FUNNELDECK_PLATFORM_URL") {
            config.auth.platform_url = url;
        }
        if let Ok(username) = std::env::var("FUNNELDECK_AUTH_USERNAME") {
            config.auth.username = username;
        }
        if let Ok(password) = std::env::var("FUNNELDECK_AUTH_PASSWORD") {
            config.auth.password = password;
        }
        if let Ok(secure) = std::env::var("FUNNELDECK_COOKIE_SECURE") {
            config.auth.cookie_secure = secure == "true" || secure == "1";
        }
        if let Ok(binary) = std::env::var("FUNNELDECK_MESH_BINARY") {
            config.mesh.binary = binary;
        }
        if let Ok(binary) = std::env::var("FUNNELDECK_RUNTIME_BINARY") {
            config.runtime.binary = Some(binary);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.mesh.binary, "tailscale");
        assert!(config.runtime.binary.is_none());
        assert!(config.auth.enabled);
        assert_eq!(config.auth.strategy, AuthStrategy::MeshIdentity);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9000"

            [auth]
            strategy = "static-credential"
            password = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.auth.strategy, AuthStrategy::StaticCredential);
        assert_eq!(config.auth.password, "s3cret");
        assert_eq!(config.auth.username, "admin");
        assert_eq!(config.mesh.timeout_secs, 30);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.listen, config.listen);
        assert_eq!(back.auth.platform_container, "casaos");
    }
}
