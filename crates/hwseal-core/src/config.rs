//! Configuration model and helpers used by hwseal runs.

use crate::error::{HwsealError, HwsealResult};
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hwseal.toml";
pub const CONFIG_PATH_ENV: &str = "HWSEAL_CONFIG";

pub const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub const KNOWN_LSBLK_PATHS: &[&str] = &["/usr/bin/lsblk", "/bin/lsblk", "/sbin/lsblk"];
pub(crate) const KNOWN_IP_PATHS: &[&str] = &["/usr/sbin/ip", "/sbin/ip", "/usr/bin/ip", "/bin/ip"];
pub(crate) const KNOWN_PING_PATHS: &[&str] = &["/usr/bin/ping", "/bin/ping", "/usr/sbin/ping"];
pub(crate) const KNOWN_DMIDECODE_PATHS: &[&str] = &["/usr/sbin/dmidecode", "/sbin/dmidecode"];

/// Optional overrides for helper binaries. Unset entries are auto-detected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub lsblk_path: Option<String>,

    #[serde(default)]
    pub ip_path: Option<String>,

    #[serde(default)]
    pub ping_path: Option<String>,

    #[serde(default)]
    pub dmidecode_path: Option<String>,
}

/// Timeouts for volume tool interactions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Where captured LUKS headers land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HeaderBackupMode {
    /// Keep headers on this machine.
    #[default]
    Local,
    /// Stage headers for the caller to download and archive.
    Download,
}

impl HeaderBackupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderBackupMode::Local => "local",
            HeaderBackupMode::Download => "download",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HeadersCfg {
    #[serde(default = "default_headers_local_dir")]
    pub local_dir: String,

    #[serde(default = "default_headers_download_dir")]
    pub download_dir: String,

    #[serde(default)]
    pub default_mode: HeaderBackupMode,
}

fn default_headers_local_dir() -> String {
    "/var/lib/hwseal/headers".to_string()
}

fn default_headers_download_dir() -> String {
    "/run/hwseal/download".to_string()
}

impl Default for HeadersCfg {
    fn default() -> Self {
        Self {
            local_dir: default_headers_local_dir(),
            download_dir: default_headers_download_dir(),
            default_mode: HeaderBackupMode::default(),
        }
    }
}

/// Scratch location for the derived key file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeCfg {
    #[serde(default = "default_key_dir")]
    pub key_dir: String,
}

fn default_key_dir() -> String {
    "/run/hwseal".to_string()
}

impl Default for RuntimeCfg {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    /// Total attempts for adding the derived key to a device.
    #[serde(default = "default_install_attempts")]
    pub install_attempts: u32,
}

fn default_install_attempts() -> u32 {
    2
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            install_attempts: default_install_attempts(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HwsealConfig {
    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub headers: HeadersCfg,

    #[serde(default)]
    pub runtime: RuntimeCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Toml,
        }
    }
}

impl HwsealConfig {
    /// Load `path` when it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> HwsealResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        info!(
            "no configuration at {}; using built-in defaults",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            format: ConfigFormat::from_path(path),
            ..Self::default()
        })
    }

    /// Read a config file from disk and detect its format from the extension.
    pub fn load<P: AsRef<Path>>(path: P) -> HwsealResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::from_path(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(HwsealError::InvalidConfig(format!(
                "{}: {}",
                path.display(),
                issues.join("; ")
            )));
        }

        Ok(cfg)
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.crypto.timeout_secs == 0 {
            issues.push("crypto.timeout_secs must be greater than 0".to_string());
        }
        if self.retry.install_attempts == 0 {
            issues.push("retry.install_attempts must be at least 1".to_string());
        }

        for (field, value) in [
            ("headers.local_dir", &self.headers.local_dir),
            ("headers.download_dir", &self.headers.download_dir),
            ("runtime.key_dir", &self.runtime.key_dir),
        ] {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                issues.push(format!("{field} must not be empty"));
            } else if !Path::new(trimmed).is_absolute() {
                issues.push(format!("{field} must be an absolute path (got {trimmed})"));
            }
        }

        issues
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto.timeout_secs)
    }

    pub fn header_dir(&self, mode: HeaderBackupMode) -> PathBuf {
        match mode {
            HeaderBackupMode::Local => PathBuf::from(self.headers.local_dir.trim()),
            HeaderBackupMode::Download => PathBuf::from(self.headers.download_dir.trim()),
        }
    }

    pub fn key_dir(&self) -> PathBuf {
        PathBuf::from(self.runtime.key_dir.trim())
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> HwsealResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}
