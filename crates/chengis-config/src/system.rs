//! System-wide configuration.
//!
//! Loaded from an optional TOML file, then every key can be overridden with
//! an environment variable named `CHENGIS_` plus the underscore-separated
//! path, e.g. `CHENGIS_DISTRIBUTED_DISPATCH_FALLBACK_LOCAL=true`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub r#type: DatabaseType,
    /// Connection string for the production store.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            r#type: DatabaseType::Development,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bound on concurrent local builds at the master.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_builds: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_concurrent_builds: default_max_concurrent(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Keep failed build workspaces around for debugging.
    #[serde(default)]
    pub retain_on_failure: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            retain_on_failure: false,
        }
    }
}

fn default_workspace_root() -> String {
    "/var/lib/chengis/workspaces".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Agents silent this long past offline are deregistered.
    #[serde(default = "default_agent_ttl")]
    pub agent_ttl_ms: u64,
    /// Shared secret between master and agents.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            agent_ttl_ms: default_agent_ttl(),
            auth_token: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    90_000
}

fn default_agent_ttl() -> u64 {
    24 * 60 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Fail-fast by default so misconfigured clusters surface quickly.
    #[serde(default)]
    pub fallback_local: bool,
    #[serde(default)]
    pub queue_enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_reset")]
    pub circuit_breaker_reset_ms: u64,
    /// Queue processor poll interval.
    #[serde(default = "default_queue_poll")]
    pub poll_interval_ms: u64,
    /// Items stuck in dispatching longer than this are swept back to pending.
    #[serde(default = "default_dispatching_timeout")]
    pub dispatching_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fallback_local: false,
            queue_enabled: false,
            max_retries: default_max_retries(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_ms: default_breaker_reset(),
            poll_interval_ms: default_queue_poll(),
            dispatching_timeout_ms: default_dispatching_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset() -> u64 {
    60_000
}

fn default_queue_poll() -> u64 {
    2_000
}

fn default_dispatching_timeout() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub distributed_dispatch: bool,
    #[serde(default)]
    pub resource_aware_scheduling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default = "default_max_combinations")]
    pub max_combinations: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            max_combinations: default_max_combinations(),
        }
    }
}

fn default_max_combinations() -> usize {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Hex-encoded 32-byte key for AES-256-GCM at-rest encryption.
    #[serde(default)]
    pub master_key: Option<String>,
    #[serde(default)]
    pub backend: SecretBackendKind,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            backend: SecretBackendKind::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretBackendKind {
    #[default]
    Local,
    Vault,
    AwsSm,
    AzureKv,
    GcpSm,
}

impl SystemConfig {
    /// Load configuration: defaults, then the TOML file when present, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                    path: p.display().to_string(),
                    source: e,
                })?;
                toml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: p.display().to_string(),
                    message: e.to_string(),
                })?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CHENGIS_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Some(v) = env("CHENGIS_DATABASE_TYPE") {
            self.database.r#type = match v.as_str() {
                "development" => DatabaseType::Development,
                "production" => DatabaseType::Production,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "database.type".to_string(),
                        message: format!("unknown database type {other:?}"),
                    });
                }
            };
        }
        if let Some(v) = env("CHENGIS_DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Some(v) = env("CHENGIS_SERVER_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env("CHENGIS_SERVER_MAX_CONCURRENT_BUILDS") {
            self.server.max_concurrent_builds = parse(&v, "server.max_concurrent_builds")?;
        }
        if let Some(v) = env("CHENGIS_WORKSPACE_ROOT") {
            self.workspace.root = v;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_ENABLED") {
            self.distributed.enabled = parse_bool(&v, "distributed.enabled")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_HEARTBEAT_TIMEOUT_MS") {
            self.distributed.heartbeat_timeout_ms = parse(&v, "distributed.heartbeat_timeout_ms")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_AGENT_TTL_MS") {
            self.distributed.agent_ttl_ms = parse(&v, "distributed.agent_ttl_ms")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_AUTH_TOKEN") {
            self.distributed.auth_token = Some(v);
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_FALLBACK_LOCAL") {
            self.distributed.dispatch.fallback_local =
                parse_bool(&v, "distributed.dispatch.fallback_local")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_QUEUE_ENABLED") {
            self.distributed.dispatch.queue_enabled =
                parse_bool(&v, "distributed.dispatch.queue_enabled")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_MAX_RETRIES") {
            self.distributed.dispatch.max_retries = parse(&v, "distributed.dispatch.max_retries")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_CIRCUIT_BREAKER_THRESHOLD") {
            self.distributed.dispatch.circuit_breaker_threshold =
                parse(&v, "distributed.dispatch.circuit_breaker_threshold")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_CIRCUIT_BREAKER_RESET_MS") {
            self.distributed.dispatch.circuit_breaker_reset_ms =
                parse(&v, "distributed.dispatch.circuit_breaker_reset_ms")?;
        }
        if let Some(v) = env("CHENGIS_DISTRIBUTED_DISPATCH_POLL_INTERVAL_MS") {
            self.distributed.dispatch.poll_interval_ms =
                parse(&v, "distributed.dispatch.poll_interval_ms")?;
        }
        if let Some(v) = env("CHENGIS_FEATURE_FLAGS_DISTRIBUTED_DISPATCH") {
            self.feature_flags.distributed_dispatch =
                parse_bool(&v, "feature_flags.distributed_dispatch")?;
        }
        if let Some(v) = env("CHENGIS_FEATURE_FLAGS_RESOURCE_AWARE_SCHEDULING") {
            self.feature_flags.resource_aware_scheduling =
                parse_bool(&v, "feature_flags.resource_aware_scheduling")?;
        }
        if let Some(v) = env("CHENGIS_MATRIX_MAX_COMBINATIONS") {
            self.matrix.max_combinations = parse(&v, "matrix.max_combinations")?;
        }
        if let Some(v) = env("CHENGIS_SECRETS_MASTER_KEY") {
            self.secrets.master_key = Some(v);
        }
        if let Some(v) = env("CHENGIS_SECRETS_BACKEND") {
            self.secrets.backend = match v.as_str() {
                "local" => SecretBackendKind::Local,
                "vault" => SecretBackendKind::Vault,
                "aws-sm" => SecretBackendKind::AwsSm,
                "azure-kv" => SecretBackendKind::AzureKv,
                "gcp-sm" => SecretBackendKind::GcpSm,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "secrets.backend".to_string(),
                        message: format!("unknown secrets backend {other:?}"),
                    });
                }
            };
        }
        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> ConfigResult<T> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse {value:?}"),
    })
}

fn parse_bool(value: &str, key: &str) -> ConfigResult<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_fail_fast() {
        let config = SystemConfig::default();
        assert!(!config.distributed.dispatch.fallback_local);
        assert!(!config.distributed.dispatch.queue_enabled);
        assert_eq!(config.distributed.heartbeat_timeout_ms, 90_000);
        assert_eq!(config.matrix.max_combinations, 25);
        assert_eq!(config.database.r#type, DatabaseType::Development);
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[distributed]
enabled = true

[distributed.dispatch]
queue_enabled = true
max_retries = 7

[feature_flags]
distributed_dispatch = true
"#
        )
        .unwrap();

        let config = SystemConfig::load(Some(file.path())).unwrap();
        assert!(config.distributed.enabled);
        assert!(config.distributed.dispatch.queue_enabled);
        assert_eq!(config.distributed.dispatch.max_retries, 7);
        assert!(config.feature_flags.distributed_dispatch);
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("true", "k").unwrap());
        assert!(parse_bool("1", "k").unwrap());
        assert!(!parse_bool("no", "k").unwrap());
        assert!(parse_bool("maybe", "k").is_err());
    }
}
