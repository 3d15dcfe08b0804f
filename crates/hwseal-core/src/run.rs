//! Run coordinator: one fingerprint, every encrypted device, one summary.

use crate::backup::HeaderBackupCoordinator;
use crate::config::{HeaderBackupMode, HwsealConfig};
use crate::credential::Credential;
use crate::error::{HwsealError, HwsealResult};
use crate::fingerprint::{self, HardwareSource};
use crate::keyfile::DerivedKeyFile;
use crate::lifecycle::{DeviceReport, MutationCounts, MutationGate, Outcome, SlotLifecycle, Stage};
use crate::provenance::find_owned_slots;
use crate::retry::RetryPolicy;
use crate::workflow::{event, WorkflowLevel, WorkflowReport};
use hwseal_provider::{BlockDevice, LuksProvider, LuksVersion};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;

/// Caller-controlled knobs for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub header_mode: HeaderBackupMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedDevice {
    pub device: String,
    pub mapping: String,
    pub version: Option<LuksVersion>,
    pub new_slot: Option<u8>,
    pub removed_slots: Vec<u8>,
    pub tagged: bool,
    pub header_backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDevice {
    pub device: String,
    pub mapping: String,
    pub header_backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDevice {
    pub device: String,
    pub mapping: String,
    pub stage: Stage,
    pub reason: String,
    pub header_backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Aggregate of one run. Built empty, filled per device, emitted once.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub dry_run: bool,
    pub header_mode: HeaderBackupMode,
    pub added: Vec<AddedDevice>,
    pub skipped: Vec<SkippedDevice>,
    pub failed: Vec<FailedDevice>,
    pub headers_captured: usize,
    pub header_files: Vec<PathBuf>,
    pub mutations: MutationCounts,
    /// Problems outside any single device.
    pub warnings: Vec<String>,
}

impl RunResult {
    fn new(options: &RunOptions) -> Self {
        Self {
            dry_run: options.dry_run,
            header_mode: options.header_mode,
            added: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            headers_captured: 0,
            header_files: Vec::new(),
            mutations: MutationCounts::default(),
            warnings: Vec::new(),
        }
    }

    fn record(&mut self, report: DeviceReport) {
        let DeviceReport {
            device,
            version,
            header_backup,
            warnings,
            outcome,
        } = report;
        match outcome {
            Outcome::Added {
                new_slot,
                removed_slots,
                tagged,
            } => self.added.push(AddedDevice {
                device: device.device,
                mapping: device.mapping,
                version,
                new_slot,
                removed_slots,
                tagged,
                header_backup,
                warnings,
            }),
            Outcome::Skipped => self.skipped.push(SkippedDevice {
                device: device.device,
                mapping: device.mapping,
                header_backup,
                warnings,
            }),
            Outcome::Failed { stage, reason } => self.failed.push(FailedDevice {
                device: device.device,
                mapping: device.mapping,
                stage,
                reason,
                header_backup,
                warnings,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.added.len() + self.skipped.len() + self.failed.len()
    }

    /// Render the summary as operator-facing workflow events.
    pub fn to_report(&self) -> WorkflowReport {
        let mut events = Vec::new();
        let prefix = if self.dry_run { "[dry-run] " } else { "" };

        if self.device_count() == 0 {
            events.push(event(
                WorkflowLevel::Info,
                "No active encrypted devices found.",
            ));
        }

        for added in &self.added {
            let slot = added
                .new_slot
                .map(|slot| format!("slot {slot}"))
                .unwrap_or_else(|| "a new slot".to_string());
            let mut message = format!("{prefix}{}: hardware-derived key added in {slot}", added.device);
            if !added.removed_slots.is_empty() {
                message.push_str(&format!(
                    "; removed stale slots {:?}",
                    added.removed_slots
                ));
            }
            if added.tagged {
                message.push_str("; provenance token written");
            } else if added.version == Some(LuksVersion::V1) {
                message.push_str("; LUKS1 cannot carry a provenance token");
            }
            events.push(event(WorkflowLevel::Success, message));
            push_warnings(&mut events, &added.device, &added.warnings);
        }

        for skipped in &self.skipped {
            events.push(event(
                WorkflowLevel::Info,
                format!(
                    "{}: hardware-derived key already current; nothing to do",
                    skipped.device
                ),
            ));
            push_warnings(&mut events, &skipped.device, &skipped.warnings);
        }

        for failed in &self.failed {
            events.push(event(
                WorkflowLevel::Error,
                format!(
                    "{}: could not proceed safely ({}): {}",
                    failed.device, failed.stage, failed.reason
                ),
            ));
            push_warnings(&mut events, &failed.device, &failed.warnings);
        }

        for warning in &self.warnings {
            events.push(event(WorkflowLevel::Warn, warning.clone()));
        }

        if self.headers_captured > 0 {
            events.push(event(
                WorkflowLevel::Security,
                format!(
                    "{prefix}captured {} header backup(s) ({} mode); store them somewhere safe",
                    self.headers_captured,
                    self.header_mode.as_str()
                ),
            ));
        }

        events.push(event(
            WorkflowLevel::Info,
            format!(
                "added {}, skipped {}, failed {}",
                self.added.len(),
                self.skipped.len(),
                self.failed.len()
            ),
        ));

        WorkflowReport {
            title: if self.dry_run {
                "Hardware key rotation (dry run)".to_string()
            } else {
                "Hardware key rotation".to_string()
            },
            events,
        }
    }
}

fn push_warnings(events: &mut Vec<crate::workflow::WorkflowEvent>, device: &str, warnings: &[String]) {
    for warning in warnings {
        events.push(event(WorkflowLevel::Warn, format!("{device}: {warning}")));
    }
}

/// Derive the key, then bring every encrypted device in line with it.
///
/// Fingerprint failures abort before any device is enumerated. Per-device
/// problems land in [`RunResult::failed`] and never stop the run.
pub fn run<P, H>(
    config: &HwsealConfig,
    provider: &P,
    hardware: &H,
    credential: &dyn Credential,
    options: &RunOptions,
) -> HwsealResult<RunResult>
where
    P: LuksProvider<Error = HwsealError>,
    H: HardwareSource + ?Sized,
{
    let key = fingerprint::resolve(hardware)?;
    info!("hardware fingerprint resolved (key digest {})", key.digest());

    let staged = DerivedKeyFile::stage(&config.key_dir(), &key)?;
    drop(key);

    let mut result = RunResult::new(options);
    let mut backups = HeaderBackupCoordinator::new(config.header_dir(options.header_mode));
    let mut gate = MutationGate::new(options.dry_run);

    {
        let devices = provider.list_encrypted_devices()?;
        info!("found {} active encrypted device(s)", devices.len());

        let engine = SlotLifecycle::new(
            provider,
            credential,
            &staged,
            RetryPolicy::from_config(&config.retry),
        );
        for device in &devices {
            info!("processing {} ({})", device.device, device.mapping);
            let report = engine.process(device, &mut backups, &mut gate);
            result.record(report);
        }
    }

    result.mutations = gate.counts();
    result.header_files = backups.into_captured();
    result.headers_captured = result.header_files.len();

    if let Err(err) = staged.remove() {
        result
            .warnings
            .push(format!("derived key file could not be removed: {err}"));
    }

    Ok(result)
}

/// Read-only view of one device for `status` output.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device: BlockDevice,
    pub version: Option<LuksVersion>,
    pub uuid: Option<String>,
    pub active_slots: Vec<u8>,
    pub owned_slots: Vec<u8>,
    pub error: Option<String>,
}

/// Describe every encrypted device without touching any header.
pub fn describe_devices<P>(provider: &P) -> HwsealResult<Vec<DeviceStatus>>
where
    P: LuksProvider<Error = HwsealError>,
{
    let devices = provider.list_encrypted_devices()?;
    let mut statuses = Vec::with_capacity(devices.len());
    for device in devices {
        let status = match provider.dump(&device.device) {
            Ok(dump) => {
                let owned = find_owned_slots(provider, &device.device, &dump);
                DeviceStatus {
                    version: Some(dump.version),
                    uuid: dump.uuid.clone(),
                    active_slots: dump.active_slots.iter().copied().collect(),
                    owned_slots: owned.slots.into_iter().collect(),
                    error: None,
                    device,
                }
            }
            Err(err) => {
                warn!("unable to read header of {}: {err}", device.device);
                DeviceStatus {
                    version: None,
                    uuid: None,
                    active_slots: Vec::new(),
                    owned_slots: Vec::new(),
                    error: Some(err.to_string()),
                    device,
                }
            }
        };
        statuses.push(status);
    }
    Ok(statuses)
}
