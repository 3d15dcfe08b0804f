//! Staging of the derived key on disk for the duration of one run.
//!
//! `cryptsetup luksAddKey` wants the new key as a file. The file lives in a
//! private directory with mode `0600` and is removed when the guard drops,
//! whichever way the run ends.

use crate::credential::{Credential, SlotOperation};
use crate::error::{HwsealError, HwsealResult};
use crate::fingerprint::DerivedKey;
use hwseal_provider::KeySource;
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Create `dir` if needed and restrict it to the owner.
pub fn ensure_private_dir(dir: &Path) -> HwsealResult<()> {
    fs::create_dir_all(dir).map_err(|err| {
        HwsealError::Io(std::io::Error::new(
            err.kind(),
            format!("unable to create {}: {err}", dir.display()),
        ))
    })?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Scoped on-disk copy of the derived key.
#[derive(Debug)]
pub struct DerivedKeyFile {
    file: NamedTempFile,
}

impl DerivedKeyFile {
    /// Write `key` into a fresh `0600` file inside `dir`.
    pub fn stage(dir: &Path, key: &DerivedKey) -> HwsealResult<Self> {
        ensure_private_dir(dir)?;

        let mut file = tempfile::Builder::new()
            .prefix(".hwseal-key-")
            .tempfile_in(dir)?;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
        file.as_file_mut().write_all(key.as_bytes())?;
        file.as_file_mut().flush()?;
        file.as_file().sync_all()?;

        debug!("staged derived key at {}", file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the file now and report failures instead of swallowing them.
    pub fn remove(self) -> HwsealResult<()> {
        let path = self.file.path().to_path_buf();
        self.file.close().map_err(|err| {
            warn!("failed to remove derived key file {}: {err}", path.display());
            HwsealError::Io(err)
        })
    }
}

impl Credential for DerivedKeyFile {
    fn label(&self) -> String {
        "hardware-derived key".to_string()
    }

    fn authorize(&self, _op: SlotOperation) -> KeySource<'_> {
        KeySource::File(self.file.path())
    }
}
