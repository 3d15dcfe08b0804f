//! Provider contract for LUKS containers.
//!
//! Every operation maps to one invocation of the volume tool. Mutating
//! operations take the authorising key material explicitly; nothing here
//! caches credentials between calls.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::path::Path;

/// An active encrypted mapping discovered on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Mapping name as listed by the block-device table (e.g. `/dev/mapper/md1p1`).
    pub mapping: String,
    /// Path of the LUKS container backing the mapping (e.g. `/dev/md1p1`).
    pub device: String,
}

/// On-disk LUKS header format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LuksVersion {
    V1,
    V2,
}

impl LuksVersion {
    /// Number of keyslots the format supports.
    pub fn max_keyslots(self) -> u8 {
        match self {
            LuksVersion::V1 => 8,
            LuksVersion::V2 => 32,
        }
    }

    /// Only LUKS2 headers carry a token area.
    pub fn supports_tokens(self) -> bool {
        matches!(self, LuksVersion::V2)
    }

    pub fn as_number(self) -> u8 {
        match self {
            LuksVersion::V1 => 1,
            LuksVersion::V2 => 2,
        }
    }
}

impl fmt::Display for LuksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LUKS{}", self.as_number())
    }
}

/// Token summary as reported by a header dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpToken {
    pub kind: String,
    pub keyslots: BTreeSet<u8>,
}

/// Typed view of a header dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LuksDump {
    pub version: LuksVersion,
    pub uuid: Option<String>,
    /// Keyslots currently holding key material.
    pub active_slots: BTreeSet<u8>,
    /// Token table keyed by token id. Always empty for LUKS1.
    pub tokens: BTreeMap<u32, DumpToken>,
}

impl LuksDump {
    pub fn is_slot_active(&self, slot: u8) -> bool {
        self.active_slots.contains(&slot)
    }
}

/// How key material reaches the volume tool.
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// Raw bytes piped on stdin.
    Bytes(&'a [u8]),
    /// Path to a file holding the key.
    File(&'a Path),
}

impl fmt::Debug for KeySource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Bytes(bytes) => write!(f, "KeySource::Bytes(<{} bytes>)", bytes.len()),
            KeySource::File(path) => write!(f, "KeySource::File({})", path.display()),
        }
    }
}

/// Abstraction over the LUKS volume tool.
pub trait LuksProvider {
    type Error: Error + Send + Sync + 'static;

    /// List block devices currently mapped as encrypted volumes, in table order.
    fn list_encrypted_devices(&self) -> Result<Vec<BlockDevice>, Self::Error>;

    /// Read and parse the header of `device`.
    fn dump(&self, device: &str) -> Result<LuksDump, Self::Error>;

    /// Return whether `key` opens any keyslot of `device`. Never mutates.
    fn test_key(&self, device: &str, key: KeySource<'_>) -> Result<bool, Self::Error>;

    /// Return whether `key` opens the given keyslot of `device`. Never mutates.
    fn test_key_in_slot(
        &self,
        device: &str,
        key: KeySource<'_>,
        slot: u8,
    ) -> Result<bool, Self::Error>;

    /// Add `new_key` to a free keyslot, authorised by existing key material.
    fn add_key(
        &self,
        device: &str,
        new_key: &Path,
        authorizing: KeySource<'_>,
    ) -> Result<(), Self::Error>;

    /// Wipe `slot`, authorised by key material from a different slot.
    fn kill_slot(
        &self,
        device: &str,
        slot: u8,
        authorizing: KeySource<'_>,
    ) -> Result<(), Self::Error>;

    /// Write a binary copy of the header to `destination`.
    fn header_backup(&self, device: &str, destination: &Path) -> Result<(), Self::Error>;

    /// Export the JSON body of a LUKS2 token.
    fn token_export(&self, device: &str, token_id: u32) -> Result<String, Self::Error>;

    /// Import a LUKS2 token. `None` lets the tool pick the next free id.
    fn token_import(
        &self,
        device: &str,
        token_id: Option<u32>,
        json: &str,
    ) -> Result<(), Self::Error>;

    /// Remove a LUKS2 token.
    fn token_remove(&self, device: &str, token_id: u32) -> Result<(), Self::Error>;
}
