//! Error type shared by every hwseal crate.

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while deriving keys or touching a LUKS header.
#[derive(Debug, Error)]
pub enum HwsealError {
    /// A hardware identifier needed for key derivation is missing.
    #[error("hardware fingerprint unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("key file {path} unusable: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    /// The volume tool (or another helper binary) failed.
    #[error("{0}")]
    Provider(String),

    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    /// A slot mutation was refused because it could lock the device.
    #[error("refusing to modify {device}: {reason}")]
    SafetyInvariant { device: String, reason: String },

    #[error("{0}")]
    Privilege(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type HwsealResult<T> = Result<T, HwsealError>;
