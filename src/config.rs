use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control API configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Lifecycle timing knobs
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_control_bind")]
    pub bind: String,

    /// Port for the control API
    #[serde(default = "default_control_port")]
    pub port: u16,

    /// Authentication token for control API write operations.
    /// If not set, a random token is generated at startup and logged.
    pub auth_token: Option<String>,

    /// Path to the directory-config store file (JSON).
    /// Defaults to the platform config dir.
    pub store_path: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_control_bind(),
            port: default_control_port(),
            auth_token: None,
            store_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds to wait for a listener to close voluntarily before escalating
    #[serde(default = "default_graceful_close")]
    pub graceful_close_secs: u64,

    /// Milliseconds to wait for the OS to release a port after a close or kill
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Seconds to wait for a new listener to report listening
    #[serde(default = "default_bind_wait")]
    pub bind_wait_secs: u64,

    /// Seconds to wait for an upstream proxy target to respond
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            graceful_close_secs: default_graceful_close(),
            settle_delay_ms: default_settle_delay(),
            bind_wait_secs: default_bind_wait(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

impl LifecycleConfig {
    pub fn graceful_close(&self) -> Duration {
        Duration::from_secs(self.graceful_close_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn bind_wait(&self) -> Duration {
        Duration::from_secs(self.bind_wait_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Lowest port a directory may claim; everything below is privileged.
pub const MIN_PORT: u16 = 1024;

/// One reverse-proxy rule: requests whose path starts with `path_prefix`
/// are forwarded to `target_origin` instead of being resolved statically.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
    /// Path prefix to match, e.g. "/api"
    pub path_prefix: String,

    /// Upstream origin, e.g. "http://localhost:8080"
    pub target_origin: String,

    /// Rewrite the Host/Origin headers to the target origin (default: true)
    #[serde(default = "default_rewrite_origin")]
    pub rewrite_origin: bool,

    /// Verify the upstream TLS certificate (default: false)
    #[serde(default)]
    pub verify_tls: bool,
}

/// A user-registered servable directory: one root, one port, ordered proxy
/// rules. Owned by the store; the lifecycle manager only ever reads it.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    /// Opaque unique id, stable identity key
    pub id: String,

    /// Display label, no uniqueness constraint
    pub name: String,

    /// Absolute filesystem root to serve
    pub path: String,

    /// Port to bind, in [1024, 65535]
    pub port: u16,

    /// Ordered proxy rules, first matching prefix wins
    #[serde(default)]
    pub proxy_rules: Vec<ProxyRule>,

    /// Last-known running flag, persisted for display only.
    /// Never consulted as liveness truth; the registry is.
    #[serde(default)]
    pub is_active: bool,

    /// Epoch millis, maintained by the store
    #[serde(default)]
    pub created_at: u64,

    /// Epoch millis, maintained by the store
    #[serde(default)]
    pub updated_at: u64,
}

impl DirectoryConfig {
    /// Validate the parts of the config that `start` depends on
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("directory config requires a non-empty 'id'".to_string());
        }

        if self.port < MIN_PORT {
            return Err(format!(
                "directory '{}': port {} is below the allowed minimum {}",
                self.id, self.port, MIN_PORT
            ));
        }

        if !Path::new(&self.path).is_absolute() {
            return Err(format!(
                "directory '{}': path '{}' must be absolute",
                self.id, self.path
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

// Default value functions
fn default_control_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    7700
}

fn default_graceful_close() -> u64 {
    30 // a timeout only triggers escalation, never failure
}

fn default_settle_delay() -> u64 {
    1000 // 1 second for the OS to release the port
}

fn default_bind_wait() -> u64 {
    5 // 5 seconds for the listener to come up
}

fn default_upstream_timeout() -> u64 {
    30 // 30 seconds max for a proxied upstream to respond
}

fn default_rewrite_origin() -> bool {
    true
}
