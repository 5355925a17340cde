//! TOML-based configuration persistence for the agent.
//!
//! Reads and writes [`AgentConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\Deskemes\config.toml`
//! - Linux:    `~/.config/deskemes/config.toml`
//! - macOS:    `~/Library/Application Support/Deskemes/config.toml`
//!
//! Example file:
//!
//! ```toml
//! [device]
//! friendly_name = "Pixel of Alice"
//! public_id = "q0v1yXJ0Z0p2bXZ6cnR1d3l6MTIzNDU2Nzg5MDEy"
//! respond_to_discovery = true
//! log_level = "info"
//!
//! [network]
//! primary_port = 24816
//! fallback_port = 4816
//! handshake_timeout_secs = 60
//! max_datagram_size = 1000
//!
//! [trust]
//! store_path = "/home/alice/.config/deskemes/peers.toml"
//! ```
//!
//! # Serde default values
//!
//! Every field is annotated with `#[serde(default = "some_fn")]`, and every
//! section with `#[serde(default)]`, so a missing file, a missing section or
//! a missing field all fall back to working values.  The one value that
//! cannot have a static default is the device's public ID; it is generated
//! on first run by [`DeviceConfig::ensure_public_id`] and then saved.

use std::path::{Path, PathBuf};

use deskemes_core::PublicId;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the config file inside the platform directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Name of the trust store file placed next to the config by default.
pub const TRUST_STORE_FILE_NAME: &str = "peers.toml";

/// Number of random bytes mixed into a newly generated public ID.
const PUBLIC_ID_ENTROPY_LEN: usize = 20;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level agent configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub trust: TrustConfig,
}

/// How this device presents itself to desktops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Name sent in the `fnam` handshake message.
    #[serde(default = "default_friendly_name")]
    pub friendly_name: String,
    /// Public ID sent in `pubi`; generated on first run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<PublicId>,
    /// Whether discovery beacons from unknown desktops trigger a dial.
    #[serde(default = "default_true")]
    pub respond_to_discovery: bool,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Beacon ports and connection limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP port the beacon listener tries first.
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,
    /// UDP port used when the primary one is taken.
    #[serde(default = "default_fallback_port")]
    pub fallback_port: u16,
    /// Seconds a connection may stay in cleartext; 0 disables the limit.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Receive buffer size for beacon datagrams.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Where approved peers are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustConfig {
    /// Trust store file; defaults to `peers.toml` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_friendly_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "Deskemes device".to_string())
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_primary_port() -> u16 {
    deskemes_core::protocol::PRIMARY_BEACON_PORT
}
fn default_fallback_port() -> u16 {
    deskemes_core::protocol::FALLBACK_BEACON_PORT
}
fn default_handshake_timeout_secs() -> u64 {
    60
}
fn default_max_datagram_size() -> usize {
    deskemes_core::protocol::beacon::MAX_DATAGRAM_SIZE
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            friendly_name: default_friendly_name(),
            public_id: None,
            respond_to_discovery: default_true(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            primary_port: default_primary_port(),
            fallback_port: default_fallback_port(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl DeviceConfig {
    /// Returns the device's public ID, generating one if none is configured.
    ///
    /// Returns `true` in the second position when a new ID was generated and
    /// the config should be saved.
    pub fn ensure_public_id(&mut self) -> (PublicId, bool) {
        match &self.public_id {
            Some(id) => (id.clone(), false),
            None => {
                let id = generate_public_id(&self.friendly_name);
                self.public_id = Some(id.clone());
                (id, true)
            }
        }
    }
}

impl AgentConfig {
    /// Resolves the trust store file for a config loaded from `config_path`.
    pub fn trust_store_path(&self, config_path: &Path) -> PathBuf {
        match &self.trust.store_path {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .map(|dir| dir.join(TRUST_STORE_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(TRUST_STORE_FILE_NAME)),
        }
    }
}

/// Generates a public ID: SHA-256 over the friendly name and fresh randomness.
pub fn generate_public_id(friendly_name: &str) -> PublicId {
    let mut entropy = [0u8; PUBLIC_ID_ENTROPY_LEN];
    OsRng.fill_bytes(&mut entropy);

    let mut hasher = Sha256::new();
    hasher.update(friendly_name.as_bytes());
    hasher.update(entropy);
    PublicId::new(hasher.finalize().to_vec())
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads `AgentConfig` from `path`, returning `AgentConfig::default()` if the
/// file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AgentConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads `AgentConfig` from the platform config file.
///
/// # Errors
///
/// See [`config_file_path`] and [`load_config_from`].
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`config_file_path`] and [`save_config_to`].
pub fn save_config(config: &AgentConfig) -> Result<(), ConfigError> {
    save_config_to(&config_file_path()?, config)
}

/// Resolves the platform config base directory including the `Deskemes` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Deskemes"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("deskemes"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Deskemes")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("deskemes_cfg_test_{}", Uuid::new_v4()))
    }

    #[test]
    fn test_default_config_uses_well_known_ports() {
        // Arrange / Act
        let cfg = AgentConfig::default();

        // Assert
        assert_eq!(cfg.network.primary_port, 24816);
        assert_eq!(cfg.network.fallback_port, 4816);
        assert_eq!(cfg.network.max_datagram_size, 1000);
        assert_eq!(cfg.network.handshake_timeout_secs, 60);
    }

    #[test]
    fn test_default_device_config_responds_to_discovery() {
        let cfg = DeviceConfig::default();
        assert!(cfg.respond_to_discovery);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.public_id.is_none());
        assert!(!cfg.friendly_name.is_empty());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AgentConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg.network, NetworkConfig::default());
        assert!(cfg.trust.store_path.is_none());
    }

    #[test]
    fn test_partial_network_section_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[network]
primary_port = 9999
"#;

        // Act
        let cfg: AgentConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.network.primary_port, 9999);
        assert_eq!(cfg.network.fallback_port, 4816);
    }

    #[test]
    fn test_ensure_public_id_generates_once() {
        // Arrange
        let mut device = DeviceConfig::default();

        // Act
        let (first, generated) = device.ensure_public_id();
        let (second, generated_again) = device.ensure_public_id();

        // Assert
        assert!(generated);
        assert!(!generated_again);
        assert_eq!(first, second);
        assert_eq!(first.as_bytes().len(), 32);
    }

    #[test]
    fn test_generated_public_ids_differ_for_same_name() {
        assert_ne!(generate_public_id("phone"), generate_public_id("phone"));
    }

    #[test]
    fn test_public_id_round_trips_as_base64() {
        // Arrange
        let mut cfg = AgentConfig::default();
        cfg.device.public_id = Some(PublicId::new(b"abc".to_vec()));

        // Act
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AgentConfig = toml::from_str(&toml_str).expect("deserialize");

        // Assert
        assert!(toml_str.contains("public_id = \"YWJj\""));
        assert_eq!(restored, cfg);
    }

    #[test]
    fn test_unset_optional_fields_are_omitted() {
        let toml_str = toml::to_string_pretty(&AgentConfig::default()).unwrap();
        assert!(!toml_str.contains("public_id"));
        assert!(!toml_str.contains("store_path"));
    }

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = temp_dir().join(CONFIG_FILE_NAME);
        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.network, NetworkConfig::default());
    }

    #[test]
    fn test_load_config_from_invalid_toml_is_parse_error() {
        // Arrange
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        // Act
        let result = load_config_from(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_and_load_round_trip_creates_directory() {
        // Arrange
        let dir = temp_dir();
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let mut cfg = AgentConfig::default();
        cfg.device.friendly_name = "Test phone".to_string();
        cfg.network.handshake_timeout_secs = 0;

        // Act
        save_config_to(&path, &cfg).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trust_store_path_defaults_next_to_config() {
        // Arrange
        let cfg = AgentConfig::default();
        let config_path = PathBuf::from("/etc/deskemes/config.toml");

        // Act
        let path = cfg.trust_store_path(&config_path);

        // Assert
        assert_eq!(path, PathBuf::from("/etc/deskemes/peers.toml"));
    }

    #[test]
    fn test_trust_store_path_honours_override() {
        let mut cfg = AgentConfig::default();
        cfg.trust.store_path = Some(PathBuf::from("/tmp/elsewhere.toml"));
        assert_eq!(
            cfg.trust_store_path(Path::new("/etc/deskemes/config.toml")),
            PathBuf::from("/tmp/elsewhere.toml")
        );
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("config.toml"),
                "config file must be named config.toml, got {path:?}"
            );
        }
    }
}
