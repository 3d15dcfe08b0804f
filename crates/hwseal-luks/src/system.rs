//! System-backed `LuksProvider` implementation.
//!
//! Wraps `cryptsetup` for header work and `lsblk` for discovery.

use crate::command::CryptsetupCommand;
use crate::dump::parse_luks_dump;
use crate::lsblk::{parse_crypt_mappings, LSBLK_ARGS};
use hwseal_core::config::{KNOWN_CRYPTSETUP_PATHS, KNOWN_LSBLK_PATHS};
use hwseal_core::error::{HwsealError, HwsealResult};
use hwseal_core::process::{resolve_binary, ProcessRunner};
use hwseal_core::HwsealConfig;
use hwseal_provider::{BlockDevice, KeySource, LuksDump, LuksProvider};
use log::debug;
use std::path::Path;

/// Provider that manages LUKS headers through the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemLuksProvider {
    cryptsetup: CryptsetupCommand,
    lsblk: ProcessRunner,
}

impl SystemLuksProvider {
    /// Build a provider from configuration, resolving `cryptsetup` and `lsblk`.
    pub fn from_config(config: &HwsealConfig) -> HwsealResult<Self> {
        let timeout = config.command_timeout();
        let cryptsetup = resolve_binary(
            "cryptsetup",
            config.tools.cryptsetup_path.as_deref(),
            KNOWN_CRYPTSETUP_PATHS,
        )?;
        let lsblk = resolve_binary("lsblk", config.tools.lsblk_path.as_deref(), KNOWN_LSBLK_PATHS)?;
        debug!(
            "using cryptsetup at {} and lsblk at {}",
            cryptsetup.display(),
            lsblk.display()
        );

        Ok(Self {
            cryptsetup: CryptsetupCommand::new(cryptsetup, timeout),
            lsblk: ProcessRunner::new(lsblk, timeout),
        })
    }
}

impl LuksProvider for SystemLuksProvider {
    type Error = HwsealError;

    fn list_encrypted_devices(&self) -> HwsealResult<Vec<BlockDevice>> {
        let out = self.lsblk.run(LSBLK_ARGS, None)?;
        if !out.success() {
            return Err(HwsealError::Provider(format!(
                "lsblk failed to list block devices: {} (exit code {})",
                out.diagnostic(),
                out.status
            )));
        }
        Ok(parse_crypt_mappings(&out.stdout))
    }

    fn dump(&self, device: &str) -> HwsealResult<LuksDump> {
        let text = self.cryptsetup.luks_dump(device)?;
        parse_luks_dump(&text)
    }

    fn test_key(&self, device: &str, key: KeySource<'_>) -> HwsealResult<bool> {
        self.cryptsetup.test_key(device, key, None)
    }

    fn test_key_in_slot(&self, device: &str, key: KeySource<'_>, slot: u8) -> HwsealResult<bool> {
        self.cryptsetup.test_key(device, key, Some(slot))
    }

    fn add_key(&self, device: &str, new_key: &Path, authorizing: KeySource<'_>) -> HwsealResult<()> {
        self.cryptsetup.add_key(device, new_key, authorizing)
    }

    fn kill_slot(&self, device: &str, slot: u8, authorizing: KeySource<'_>) -> HwsealResult<()> {
        self.cryptsetup.kill_slot(device, slot, authorizing)
    }

    fn header_backup(&self, device: &str, destination: &Path) -> HwsealResult<()> {
        self.cryptsetup.header_backup(device, destination)
    }

    fn token_export(&self, device: &str, token_id: u32) -> HwsealResult<String> {
        self.cryptsetup.token_export(device, token_id)
    }

    fn token_import(&self, device: &str, token_id: Option<u32>, json: &str) -> HwsealResult<()> {
        self.cryptsetup.token_import(device, token_id, json)
    }

    fn token_remove(&self, device: &str, token_id: u32) -> HwsealResult<()> {
        self.cryptsetup.token_remove(device, token_id)
    }
}
