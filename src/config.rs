use crate::core::error::{Error, Result};
use crate::core::sync::{DEFAULT_TARGET, RepopulatePolicy, SyncSettings};
use crate::elevation::ElevationMethod;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, stored as `config.json` in the config directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Managed chain; must already exist in the filter table
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Entry lifetime in seconds; the sweep runs every tenth of it
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_target")]
    pub default_target: String,
    /// Explicit firewall tool path, otherwise resolved from `PATH`
    #[serde(default)]
    pub iptables_path: Option<PathBuf>,
    /// Run every mutating operation under one per-chain lock
    #[serde(default)]
    pub serialize_mutations: bool,
    #[serde(default)]
    pub repopulate_policy: RepopulatePolicy,
    #[serde(default)]
    pub elevation: ElevationMethod,
    /// Persist entries to the state directory and restore them on start
    #[serde(default)]
    pub snapshot: bool,
    /// Append mutations to `audit.log` in the state directory
    #[serde(default)]
    pub audit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            ttl_secs: default_ttl_secs(),
            default_target: default_target(),
            iptables_path: None,
            serialize_mutations: false,
            repopulate_policy: RepopulatePolicy::default(),
            elevation: ElevationMethod::default(),
            snapshot: false,
            audit: false,
        }
    }
}

fn default_chain() -> String {
    "CHAINWARD".to_string()
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

impl SyncConfig {
    /// Checks the values that end up on the iptables command line.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_chain_name(&self.chain)
            .map_err(|m| Error::validation("chain", m))?;
        crate::validators::validate_target(&self.default_target)
            .map_err(|m| Error::validation("default_target", m))?;
        if self.ttl_secs == 0 {
            return Err(Error::validation("ttl_secs", "TTL must be at least one second"));
        }
        Ok(())
    }

    /// Builds synchronizer settings, resolving snapshot and audit paths in the state directory.
    pub fn to_settings(&self) -> SyncSettings {
        let mut settings = SyncSettings::new(self.chain.clone())
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_serialized_mutations(self.serialize_mutations)
            .with_repopulate_policy(self.repopulate_policy);
        settings.default_target.clone_from(&self.default_target);

        if self.snapshot {
            settings.snapshot_path = crate::core::snapshot::default_snapshot_path();
        }
        if self.audit {
            settings.audit_path = crate::audit::AuditLog::default_path();
        }
        settings
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path`, or returns defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config_from(path: &Path) -> Result<SyncConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Loads the config from the default location, falling back to defaults.
pub async fn load_config() -> Result<SyncConfig> {
    match default_config_path() {
        Some(path) => load_config_from(&path).await,
        None => Ok(SyncConfig::default()),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file with restrictive permissions (0o600).
/// 2. Atomically renames to the target path.
pub async fn save_config(config: &SyncConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"chain":"POOL","serialize_mutations":true}"#).unwrap();

        assert_eq!(config.chain, "POOL");
        assert!(config.serialize_mutations);
        assert_eq!(config.ttl_secs, 300);
        assert_eq!(config.default_target, "ACCEPT");
        assert_eq!(config.repopulate_policy, RepopulatePolicy::BestEffort);
        assert_eq!(config.elevation, ElevationMethod::None);
    }

    #[test]
    fn test_enum_fields_parse_from_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"repopulate_policy":"strict","elevation":"run0"}"#).unwrap();

        assert_eq!(config.repopulate_policy, RepopulatePolicy::Strict);
        assert_eq!(config.elevation, ElevationMethod::Run0);
    }

    #[test]
    fn test_validate() {
        assert!(SyncConfig::default().validate().is_ok());

        let config = SyncConfig {
            ttl_secs: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            chain: "bad chain".to_string(),
            ..SyncConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Validation { ref field, .. }) if field == "chain"
        ));
    }

    #[test]
    fn test_to_settings() {
        let config = SyncConfig {
            ttl_secs: 45,
            default_target: "TRUSTED".to_string(),
            ..SyncConfig::default()
        };
        let settings = config.to_settings();

        assert_eq!(settings.chain, "CHAINWARD");
        assert_eq!(settings.ttl, Duration::from_secs(45));
        assert_eq!(settings.default_target, "TRUSTED");
        assert!(settings.snapshot_path.is_none());
        assert!(settings.audit_path.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = SyncConfig {
            chain: "EDGE".to_string(),
            audit: true,
            ..SyncConfig::default()
        };

        save_config(&config, &path).await.unwrap();
        assert_eq!(load_config_from(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ nope").await.unwrap();

        assert!(matches!(
            load_config_from(&path).await,
            Err(Error::Serialization(_))
        ));
    }
}
