//! Core of hwseal: bind a LUKS keyslot to the hardware it runs on.
//!
//! A key is derived from the motherboard serial and the default gateway's MAC
//! address, enrolled next to the original passphrase, and tagged with a
//! provenance token so a later run can retire it when the hardware changes.
//! System integrations live in `hwseal-luks`; this crate holds the policy.

pub mod backup;
pub mod config;
pub mod credential;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod keyfile;
pub mod lifecycle;
pub mod logging;
pub mod process;
pub mod provenance;
pub mod retry;
pub mod run;
pub mod workflow;

pub use config::{HeaderBackupMode, HwsealConfig};
pub use credential::{Credential, KeyFile, Passphrase, SlotOperation};
pub use error::{HwsealError, HwsealResult};
pub use fingerprint::{derive_key, DerivedKey, HardwareFingerprint, HardwareSource};
pub use host::HostHardwareSource;
pub use lifecycle::{DeviceReport, Outcome, SlotLifecycle, Stage};
pub use run::{describe_devices, run, DeviceStatus, RunOptions, RunResult};
