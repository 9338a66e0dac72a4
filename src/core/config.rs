use crate::auth::Permission;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const LISTENER_BIND_DEFAULT: &str = "0.0.0.0:1883";

/// Top-level configuration for a Tessera node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub partitions: PartitionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Routing metadata stamped on every message this node emits.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            cluster: default_cluster(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound on a single frame's remaining length.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Keep-alive applied before CONNECT negotiates one.
    #[serde(default = "default_keep_alive_secs")]
    pub default_keep_alive_secs: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_frame_bytes: default_max_frame_bytes(),
            default_keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Characters a non-empty client id may use.
    #[serde(default = "default_client_id_pattern")]
    pub client_id_pattern: String,
    /// Highest QoS a subscription may be granted.
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    #[serde(default = "default_assigned_prefix")]
    pub assigned_client_id_prefix: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_id_pattern: default_client_id_pattern(),
            max_qos: default_max_qos(),
            assigned_client_id_prefix: default_assigned_prefix(),
        }
    }
}

/// How a connecting client is mapped to its partition.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_partition")]
    pub default_partition: String,
    /// `user@partition` style usernames carry their partition after this separator.
    #[serde(default = "default_username_separator")]
    pub username_separator: Option<String>,
    /// Regex with a named `partition` group applied to the client id.
    #[serde(default)]
    pub client_id_pattern: Option<String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            default_partition: default_partition(),
            username_separator: default_username_separator(),
            client_id_pattern: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub anonymous_permissions: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub partition: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via TESSERA_CONFIG or defaults to `config/tessera.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate schema-level invariants before the broker is assembled.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            bail!("node.node_id must be non-empty");
        }
        if self.node.cluster.trim().is_empty() {
            bail!("node.cluster must be non-empty");
        }
        if self.listener.max_frame_bytes == 0 {
            bail!("listener.max_frame_bytes must be > 0");
        }
        if self.protocol.max_qos > 2 {
            bail!("protocol.max_qos must be 0, 1 or 2");
        }
        Regex::new(&self.protocol.client_id_pattern)
            .with_context(|| "protocol.client_id_pattern is not a valid regex")?;
        if self.partitions.default_partition.is_empty() {
            bail!("partitions.default_partition must be non-empty");
        }
        if let Some(sep) = &self.partitions.username_separator {
            if sep.is_empty() {
                bail!("partitions.username_separator must not be empty when set");
            }
        }
        if let Some(pattern) = &self.partitions.client_id_pattern {
            let re = Regex::new(pattern)
                .with_context(|| "partitions.client_id_pattern is not a valid regex")?;
            if !re.capture_names().flatten().any(|name| name == "partition") {
                bail!("partitions.client_id_pattern needs a named `partition` group");
            }
        }
        let mut seen = HashSet::new();
        for account in &self.identity.accounts {
            if account.username.is_empty() {
                bail!("identity account in partition {} has empty username", account.partition);
            }
            if !seen.insert((account.partition.as_str(), account.username.as_str())) {
                bail!(
                    "duplicate identity account {}@{}",
                    account.username,
                    account.partition
                );
            }
            for permission in &account.permissions {
                permission.parse::<Permission>().with_context(|| {
                    format!(
                        "identity account {}@{} has invalid permission {:?}",
                        account.username, account.partition, permission
                    )
                })?;
            }
        }
        for permission in &self.identity.anonymous_permissions {
            permission
                .parse::<Permission>()
                .with_context(|| format!("invalid anonymous permission {:?}", permission))?;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TESSERA_BIND") {
            self.listener.bind = bind;
        }
        if let Ok(node_id) = std::env::var("TESSERA_NODE_ID") {
            self.node.node_id = node_id;
        }
        if let Ok(level) = std::env::var("TESSERA_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TESSERA_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/tessera.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_node_id() -> String {
    "node-0".to_string()
}

fn default_cluster() -> String {
    "local".to_string()
}

fn default_bind() -> String {
    LISTENER_BIND_DEFAULT.to_string()
}

fn default_max_frame_bytes() -> usize {
    256 * 1024
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_client_id_pattern() -> String {
    r"^[0-9A-Za-z_\-.:]{1,128}$".to_string()
}

fn default_max_qos() -> u8 {
    2
}

fn default_assigned_prefix() -> String {
    "auto".to_string()
}

fn default_partition() -> String {
    "default".to_string()
}

fn default_username_separator() -> Option<String> {
    Some("@".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PartitionResolver;
    use tempfile::tempdir;

    fn base_config(extra: &str) -> Config {
        let doc = format!(
            r#"
[node]
node_id = "node-a"
cluster = "eu-1"

[listener]
bind = "127.0.0.1:0"

[partitions]
default_partition = "p0"
username_separator = "@"

[[identity.accounts]]
partition = "p1"
username = "dev1"
password = "secret"
permissions = ["PUBLISH:sensors/#", "SUBSCRIBE:%p/%c/#"]
{extra}
"#
        );
        toml::from_str(&doc).unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.listener.bind, "0.0.0.0:1883");
        assert_eq!(cfg.protocol.max_qos, 2);
        assert_eq!(cfg.partitions.default_partition, "default");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parsed_config_validates() {
        let cfg = base_config("");
        assert_eq!(cfg.node.cluster, "eu-1");
        assert_eq!(cfg.identity.accounts.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_accounts_rejected() {
        let cfg = base_config(
            r#"
[[identity.accounts]]
partition = "p1"
username = "dev1"
password = "other"
"#,
        );
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("duplicate identity account"));
    }

    #[test]
    fn partition_pattern_requires_named_group() {
        let mut cfg = base_config("");
        cfg.partitions.client_id_pattern = Some("^([a-z]+)-.*$".into());
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("named `partition` group"));
        cfg.partitions.client_id_pattern = Some("^(?P<partition>[a-z]+)-.*$".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn malformed_permission_rejected() {
        let mut cfg = base_config("");
        cfg.identity.anonymous_permissions = vec!["sensors/#".into()];
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("invalid anonymous permission"));
    }

    #[test]
    fn partitions_table_keeps_default_separator() {
        let cfg: Config = toml::from_str(
            r#"
[partitions]
default_partition = "p0"
"#,
        )
        .unwrap();
        assert_eq!(cfg.partitions.username_separator.as_deref(), Some("@"));
        let resolver = PartitionResolver::from_config(&cfg.partitions).unwrap();
        let resolved = resolver.resolve(Some("alice@p1"), "dev1");
        assert_eq!(resolved.partition, "p1");
        assert_eq!(resolved.username.as_deref(), Some("alice"));
    }

    #[test]
    fn max_qos_above_two_rejected() {
        let mut cfg = base_config("");
        cfg.protocol.max_qos = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_config_loads_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tessera.json");
        fs::write(
            &path,
            r#"{"node": {"node_id": "n1", "cluster": "c1"}, "protocol": {"max_qos": 1}}"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.node.node_id, "n1");
        assert_eq!(cfg.protocol.max_qos, 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load("/nonexistent/tessera.toml").unwrap_err();
        assert!(format!("{err:?}").contains("/nonexistent/tessera.toml"));
    }
}
