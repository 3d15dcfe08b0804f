//! Header capture before any keyslot mutation.
//!
//! Each device's header goes to `luks-header-<basename>-<uuid>.img` in the
//! directory selected by [`crate::config::HeaderBackupMode`]. Packaging the captured files
//! into an archive is left to the caller.

use crate::error::{HwsealError, HwsealResult};
use crate::keyfile::ensure_private_dir;
use crate::lifecycle::MutationGate;
use hwseal_provider::{LuksDump, LuksProvider};
use log::info;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct HeaderBackupCoordinator {
    dir: PathBuf,
    captured: Vec<PathBuf>,
}

impl HeaderBackupCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            captured: Vec::new(),
        }
    }

    /// Capture the header of `device`. In dry-run nothing is written but the
    /// capture still counts.
    pub fn backup(
        &mut self,
        provider: &dyn LuksProvider<Error = HwsealError>,
        gate: &mut MutationGate,
        device: &str,
        dump: &LuksDump,
    ) -> HwsealResult<PathBuf> {
        let destination = self.dir.join(header_file_name(device, dump.uuid.as_deref()));

        gate.header_write(device, &destination, || {
            ensure_private_dir(&self.dir)?;
            match fs::remove_file(&destination) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(HwsealError::Io(err)),
            }
            provider.header_backup(device, &destination)?;
            if !destination.is_file() {
                return Err(HwsealError::Provider(format!(
                    "header backup for {device} reported success but {} is missing",
                    destination.display()
                )));
            }
            fs::set_permissions(&destination, fs::Permissions::from_mode(0o600))?;
            info!("captured header of {device} at {}", destination.display());
            Ok(())
        })?;

        self.captured.push(destination.clone());
        Ok(destination)
    }

    pub fn into_captured(self) -> Vec<PathBuf> {
        self.captured
    }
}

/// `luks-header-<basename>-<uuid>.img`, with anything odd replaced by `_`.
pub fn header_file_name(device: &str, uuid: Option<&str>) -> String {
    let base = Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string());
    let uuid = uuid
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown-uuid");
    format!("luks-header-{}-{}.img", sanitize(&base), sanitize(uuid))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
