//! Per-device keyslot lifecycle.
//!
//! ```text
//! KeyCheck -> HeaderBackup -> CurrentCheck -> SlotCleanup -> SlotInstall
//!          -> Verify -> TokenTag -> Done
//! ```
//!
//! A device ends in exactly one of `Added`, `Skipped` or `Failed`. Slot 0 is
//! never removed, and no removal starts unless at least one active slot
//! survives the whole cleanup.

mod gate;

#[cfg(test)]
mod tests;

pub use gate::{MutationCounts, MutationGate};

use crate::backup::HeaderBackupCoordinator;
use crate::credential::{Credential, SlotOperation};
use crate::error::{HwsealError, HwsealResult};
use crate::keyfile::DerivedKeyFile;
use crate::provenance::{find_owned_slots, OwnedSlots, ProvenanceToken};
use crate::retry::RetryPolicy;
use chrono::Utc;
use hwseal_provider::{BlockDevice, LuksDump, LuksProvider, LuksVersion};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Slot that always holds the original passphrase.
pub const PROTECTED_SLOT: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    KeyCheck,
    HeaderBackup,
    CurrentCheck,
    SlotCleanup,
    SlotInstall,
    Verify,
    TokenTag,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::KeyCheck => "key check",
            Stage::HeaderBackup => "header backup",
            Stage::CurrentCheck => "current key check",
            Stage::SlotCleanup => "slot cleanup",
            Stage::SlotInstall => "slot install",
            Stage::Verify => "verification",
            Stage::TokenTag => "token tag",
        })
    }
}

/// Terminal state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Added {
        /// Slot holding the derived key; `None` in dry-run or when it could not be located.
        new_slot: Option<u8>,
        removed_slots: Vec<u8>,
        tagged: bool,
    },
    Skipped,
    Failed {
        stage: Stage,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: BlockDevice,
    pub version: Option<LuksVersion>,
    pub header_backup: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub outcome: Outcome,
}

impl DeviceReport {
    fn new(device: BlockDevice) -> Self {
        Self {
            device,
            version: None,
            header_backup: None,
            warnings: Vec::new(),
            outcome: Outcome::Skipped,
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {message}", self.device.device);
        self.warnings.push(message);
    }
}

/// Slots to wipe during cleanup, after the safety checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPlan {
    pub remove: Vec<u8>,
    /// Owned slots skipped because they are protected.
    pub protected: Vec<u8>,
    /// Active slots left once every removal succeeds.
    pub remaining: usize,
}

/// Decide which owned slots may go. Read-only; runs before any removal.
pub fn plan_cleanup(device: &str, dump: &LuksDump, owned: &OwnedSlots) -> HwsealResult<CleanupPlan> {
    let protected: Vec<u8> = owned
        .slots
        .iter()
        .copied()
        .filter(|slot| *slot == PROTECTED_SLOT)
        .collect();
    let remove: Vec<u8> = owned
        .slots
        .iter()
        .copied()
        .filter(|slot| *slot != PROTECTED_SLOT && dump.is_slot_active(*slot))
        .collect();

    let total = dump.active_slots.len();
    let remaining = total.saturating_sub(remove.len());
    if remaining < 1 {
        return Err(HwsealError::SafetyInvariant {
            device: device.to_string(),
            reason: format!(
                "removing slots {remove:?} would leave no active keyslot ({total} active)"
            ),
        });
    }

    Ok(CleanupPlan {
        remove,
        protected,
        remaining,
    })
}

struct Failure {
    stage: Stage,
    reason: String,
}

fn fail(stage: Stage, reason: impl Into<String>) -> Failure {
    Failure {
        stage,
        reason: reason.into(),
    }
}

/// Drives one device through the lifecycle.
pub struct SlotLifecycle<'a, P> {
    provider: &'a P,
    credential: &'a dyn Credential,
    derived: &'a DerivedKeyFile,
    retry: RetryPolicy,
}

impl<'a, P> SlotLifecycle<'a, P>
where
    P: LuksProvider<Error = HwsealError>,
{
    pub fn new(
        provider: &'a P,
        credential: &'a dyn Credential,
        derived: &'a DerivedKeyFile,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            credential,
            derived,
            retry,
        }
    }

    pub fn process(
        &self,
        target: &BlockDevice,
        backups: &mut HeaderBackupCoordinator,
        gate: &mut MutationGate,
    ) -> DeviceReport {
        let mut report = DeviceReport::new(target.clone());
        report.outcome = match self.drive(&target.device, backups, gate, &mut report) {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(
                    "{}: failed during {}: {}",
                    target.device, failure.stage, failure.reason
                );
                Outcome::Failed {
                    stage: failure.stage,
                    reason: failure.reason,
                }
            }
        };
        report
    }

    fn tool(&self) -> &dyn LuksProvider<Error = HwsealError> {
        self.provider
    }

    fn drive(
        &self,
        device: &str,
        backups: &mut HeaderBackupCoordinator,
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) -> Result<Outcome, Failure> {
        let tool = self.tool();

        debug!("{device}: {}", Stage::KeyCheck);
        match self.credential.test(tool, device) {
            Ok(true) => {}
            Ok(false) => {
                return Err(fail(
                    Stage::KeyCheck,
                    format!("{} does not unlock the device", self.credential.label()),
                ))
            }
            Err(err) => {
                return Err(fail(
                    Stage::KeyCheck,
                    format!("unable to test {}: {err}", self.credential.label()),
                ))
            }
        }

        debug!("{device}: {}", Stage::HeaderBackup);
        let dump = tool.dump(device).map_err(|err| {
            fail(
                Stage::HeaderBackup,
                format!("unable to read LUKS header: {err}"),
            )
        })?;
        report.version = Some(dump.version);
        let backup = backups
            .backup(tool, gate, device, &dump)
            .map_err(|err| fail(Stage::HeaderBackup, format!("header backup failed: {err}")))?;
        report.header_backup = Some(backup);

        debug!("{device}: {}", Stage::CurrentCheck);
        match self.derived.test(tool, device) {
            Ok(true) => {
                info!("{device}: hardware-derived key already enrolled");
                return Ok(Outcome::Skipped);
            }
            Ok(false) => {}
            Err(err) => {
                return Err(fail(
                    Stage::CurrentCheck,
                    format!("unable to test the hardware-derived key: {err}"),
                ))
            }
        }

        debug!("{device}: {}", Stage::SlotCleanup);
        let owned = find_owned_slots(tool, device, &dump);
        let plan = plan_cleanup(device, &dump, &owned)
            .map_err(|err| fail(Stage::SlotCleanup, err.to_string()))?;
        for slot in &plan.protected {
            report.warn(format!(
                "slot {slot} is tagged as hardware-derived but is protected; leaving it untouched"
            ));
        }
        let removed = self.remove_slots(device, &plan, gate, report);
        self.remove_stale_tokens(device, &owned, &removed, gate, report);

        debug!("{device}: {}", Stage::SlotInstall);
        self.install(device, gate)?;
        let before_install: BTreeSet<u8> =
            dump.active_slots.difference(&removed).copied().collect();

        let new_slot = if gate.is_dry_run() {
            None
        } else {
            debug!("{device}: {}", Stage::Verify);
            self.verify_and_locate(device, dump.version, &before_install, gate, report)?
        };

        let tagged = if dump.version.supports_tokens() {
            debug!("{device}: {}", Stage::TokenTag);
            self.tag(device, new_slot, gate, report)
        } else {
            false
        };

        Ok(Outcome::Added {
            new_slot,
            removed_slots: removed.into_iter().collect(),
            tagged,
        })
    }

    fn remove_slots(
        &self,
        device: &str,
        plan: &CleanupPlan,
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) -> BTreeSet<u8> {
        let mut removed = BTreeSet::new();
        for slot in &plan.remove {
            let slot = *slot;
            let result = gate.kill_slot(device, slot, || {
                self.provider.kill_slot(
                    device,
                    slot,
                    self.credential.authorize(SlotOperation::KillSlot),
                )
            });
            match result {
                Ok(()) => {
                    removed.insert(slot);
                }
                Err(err) => report.warn(format!("unable to remove stale slot {slot}: {err}")),
            }
        }
        removed
    }

    fn remove_stale_tokens(
        &self,
        device: &str,
        owned: &OwnedSlots,
        removed: &BTreeSet<u8>,
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) {
        for token_id in owned.tokens_fully_covered_by(removed) {
            let result = gate.remove_token(device, token_id, || {
                self.provider.token_remove(device, token_id)
            });
            if let Err(err) = result {
                report.warn(format!("unable to remove stale token {token_id}: {err}"));
            }
        }
    }

    fn install(&self, device: &str, gate: &mut MutationGate) -> Result<(), Failure> {
        let attempts = self.retry.max_attempts();
        self.retry
            .run(&format!("adding derived key to {device}"), |attempt| {
                if attempt > 1 && !gate.is_dry_run() {
                    // An earlier attempt may have landed despite reporting failure.
                    if let Ok(true) = self.derived.test(self.tool(), device) {
                        info!("{device}: derived key present after failed attempt; not adding again");
                        gate.record_key_added(device);
                        return Ok(());
                    }
                }
                gate.add_key(device, || {
                    self.provider.add_key(
                        device,
                        self.derived.path(),
                        self.credential.authorize(SlotOperation::AddKey),
                    )
                })
            })
            .map_err(|err| {
                fail(
                    Stage::SlotInstall,
                    format!("adding the derived key failed after {attempts} attempts: {err}"),
                )
            })
    }

    /// Confirm the derived key opens the device and find the slot it landed in.
    ///
    /// Assumes nothing else mutates the header between installation and the
    /// probe.
    fn verify_and_locate(
        &self,
        device: &str,
        version: LuksVersion,
        before_install: &BTreeSet<u8>,
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) -> Result<Option<u8>, Failure> {
        let tool = self.tool();
        let after = match tool.dump(device) {
            Ok(dump) => Some(dump),
            Err(err) => {
                report.warn(format!("unable to re-read header after installation: {err}"));
                None
            }
        };
        let fresh: Vec<u8> = after
            .as_ref()
            .map(|dump| dump.active_slots.difference(before_install).copied().collect())
            .unwrap_or_default();

        match self.derived.test(tool, device) {
            Ok(true) => {}
            Ok(false) => {
                self.rollback(device, &fresh, gate, report);
                return Err(fail(
                    Stage::Verify,
                    "hardware-derived key does not unlock the device after installation",
                ));
            }
            Err(err) => {
                self.rollback(device, &fresh, gate, report);
                return Err(fail(
                    Stage::Verify,
                    format!("unable to verify the hardware-derived key: {err}"),
                ));
            }
        }

        let mut candidates = fresh.clone();
        match &after {
            Some(dump) => candidates.extend(
                dump.active_slots
                    .iter()
                    .copied()
                    .filter(|slot| !fresh.contains(slot)),
            ),
            None => candidates.extend(0..version.max_keyslots()),
        }

        for slot in candidates {
            match self.derived.test_slot(tool, device, slot) {
                Ok(true) => {
                    info!("{device}: derived key installed in slot {slot}");
                    return Ok(Some(slot));
                }
                Ok(false) => {}
                Err(err) => debug!("{device}: probing slot {slot} failed: {err}"),
            }
        }

        report.warn("derived key unlocks the device but its keyslot could not be located");
        Ok(None)
    }

    /// Best-effort removal of slots added by this run.
    fn rollback(
        &self,
        device: &str,
        fresh: &[u8],
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) {
        for slot in fresh {
            let slot = *slot;
            if slot == PROTECTED_SLOT {
                report.warn("rollback skipped slot 0; it is never removed");
                continue;
            }
            let result = gate.kill_slot(device, slot, || {
                self.provider.kill_slot(
                    device,
                    slot,
                    self.credential.authorize(SlotOperation::KillSlot),
                )
            });
            match result {
                Ok(()) => info!("{device}: rolled back slot {slot}"),
                Err(err) => report.warn(format!("rollback of slot {slot} failed: {err}")),
            }
        }
    }

    fn tag(
        &self,
        device: &str,
        new_slot: Option<u8>,
        gate: &mut MutationGate,
        report: &mut DeviceReport,
    ) -> bool {
        let Some(slot) = new_slot else {
            if gate.is_dry_run() {
                return gate.write_token(device, None, || Ok(())).is_ok();
            }
            report.warn("provenance token not written: new keyslot unknown");
            return false;
        };

        let result = ProvenanceToken::for_slot(slot, Utc::now())
            .to_json()
            .and_then(|json| {
                gate.write_token(device, Some(slot), || {
                    self.provider.token_import(device, None, &json)
                })
            });
        match result {
            Ok(()) => true,
            Err(err) => {
                report.warn(format!(
                    "provenance token for slot {slot} not written ({err}); later runs will not recognise this slot"
                ));
                false
            }
        }
    }
}
