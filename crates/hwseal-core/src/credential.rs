//! Authentication material presented to the volume tool.
//!
//! The lifecycle engine never looks at what kind of credential it holds; it
//! asks for a [`KeySource`] per operation and lets the provider pass it on.

use crate::error::{HwsealError, HwsealResult};
use hwseal_provider::{KeySource, LuksProvider};
use log::debug;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Longest passphrase accepted, matching cryptsetup's interactive limit.
pub const MAX_PASSPHRASE_BYTES: usize = 512;
/// Largest key file accepted, matching cryptsetup's default keyfile limit.
pub const MAX_KEYFILE_BYTES: u64 = 8 * 1024 * 1024;

/// Operations a credential can be asked to authorise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOperation {
    Test,
    AddKey,
    KillSlot,
}

impl fmt::Display for SlotOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotOperation::Test => "key test",
            SlotOperation::AddKey => "key addition",
            SlotOperation::KillSlot => "slot removal",
        })
    }
}

pub trait Credential: fmt::Debug {
    /// Short, secret-free description for logs and reports.
    fn label(&self) -> String;

    /// Hand out key material for `op`.
    fn authorize(&self, op: SlotOperation) -> KeySource<'_>;

    /// Return whether this credential opens `device`.
    fn test(
        &self,
        provider: &dyn LuksProvider<Error = HwsealError>,
        device: &str,
    ) -> HwsealResult<bool> {
        provider.test_key(device, self.authorize(SlotOperation::Test))
    }

    /// Return whether this credential opens `slot` on `device`.
    fn test_slot(
        &self,
        provider: &dyn LuksProvider<Error = HwsealError>,
        device: &str,
        slot: u8,
    ) -> HwsealResult<bool> {
        provider.test_key_in_slot(device, self.authorize(SlotOperation::Test), slot)
    }
}

/// Original passphrase, piped to the tool on stdin.
pub struct Passphrase {
    bytes: Zeroizing<Vec<u8>>,
}

impl Passphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> HwsealResult<Self> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.is_empty() {
            return Err(HwsealError::InvalidCredential(
                "passphrase cannot be empty".into(),
            ));
        }
        if bytes.len() > MAX_PASSPHRASE_BYTES {
            return Err(HwsealError::InvalidCredential(format!(
                "passphrase exceeds {MAX_PASSPHRASE_BYTES} bytes"
            )));
        }
        Ok(Self { bytes })
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl Credential for Passphrase {
    fn label(&self) -> String {
        "passphrase".to_string()
    }

    fn authorize(&self, op: SlotOperation) -> KeySource<'_> {
        debug!("authorising {op} with passphrase");
        KeySource::Bytes(&self.bytes)
    }
}

/// Existing key file equivalent to the original passphrase.
#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> HwsealResult<Self> {
        let path = path.into();
        let meta = fs::metadata(&path).map_err(|err| invalid_keyfile(&path, err.to_string()))?;
        if !meta.is_file() {
            return Err(invalid_keyfile(&path, "not a regular file"));
        }
        if meta.len() == 0 {
            return Err(invalid_keyfile(&path, "file is empty"));
        }
        if meta.len() > MAX_KEYFILE_BYTES {
            return Err(invalid_keyfile(
                &path,
                format!("file exceeds {MAX_KEYFILE_BYTES} bytes"),
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Credential for KeyFile {
    fn label(&self) -> String {
        format!("key file {}", self.path.display())
    }

    fn authorize(&self, op: SlotOperation) -> KeySource<'_> {
        debug!("authorising {op} with key file {}", self.path.display());
        KeySource::File(&self.path)
    }
}

fn invalid_keyfile(path: &Path, reason: impl Into<String>) -> HwsealError {
    HwsealError::InvalidKeyFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
