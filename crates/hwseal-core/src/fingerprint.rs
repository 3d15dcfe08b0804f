//! Hardware fingerprint resolution and key derivation.
//!
//! The derived key is `hex(SHA256(serial + "_" + mac))`. It is recomputed on
//! every run and never written anywhere except the per-run staging file.

use crate::error::{HwsealError, HwsealResult};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Source of the two identifiers the key is bound to.
///
/// `Err` means the lookup itself failed (tool missing, command error).
/// `Ok(None)` means the lookup worked and the machine has no such value.
pub trait HardwareSource {
    fn motherboard_serial(&self) -> HwsealResult<Option<String>>;

    fn gateway_mac(&self) -> HwsealResult<Option<String>>;
}

/// Ordered `(motherboard serial, gateway MAC)` pair.
#[derive(Clone, PartialEq, Eq)]
pub struct HardwareFingerprint {
    serial: String,
    mac: String,
}

impl HardwareFingerprint {
    pub fn new(serial: impl Into<String>, mac: impl Into<String>) -> HwsealResult<Self> {
        let serial = serial.into().trim().to_string();
        let mac = mac.into().trim().to_string();
        if serial.is_empty() {
            return Err(HwsealError::HardwareUnavailable(
                "motherboard serial number is empty".into(),
            ));
        }
        if mac.is_empty() {
            return Err(HwsealError::HardwareUnavailable(
                "gateway MAC address is empty".into(),
            ));
        }
        Ok(Self { serial, mac })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn derive_key(&self) -> DerivedKey {
        derive_key(&self.serial, &self.mac)
    }
}

impl fmt::Debug for HardwareFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareFingerprint")
            .field("serial", &"<redacted>")
            .field("mac", &self.mac)
            .finish()
    }
}

/// 64 lowercase hex characters derived from the fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey(Zeroizing<String>);

impl DerivedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// SHA-256 of the key, safe to show to operators.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Pure derivation step; identical inputs always give the identical key.
pub fn derive_key(serial: &str, mac: &str) -> DerivedKey {
    let material = Zeroizing::new(format!("{serial}_{mac}"));
    let digest = Sha256::digest(material.as_bytes());
    DerivedKey(Zeroizing::new(hex::encode(digest)))
}

/// Read both identifiers from `source` and build the fingerprint.
pub fn resolve_fingerprint<S>(source: &S) -> HwsealResult<HardwareFingerprint>
where
    S: HardwareSource + ?Sized,
{
    let serial = source
        .motherboard_serial()
        .map_err(|err| {
            HwsealError::HardwareUnavailable(format!("motherboard serial lookup failed: {err}"))
        })?
        .ok_or_else(|| {
            HwsealError::HardwareUnavailable("no motherboard serial number reported".into())
        })?;

    let mac = source
        .gateway_mac()
        .map_err(|err| {
            HwsealError::HardwareUnavailable(format!("gateway MAC lookup failed: {err}"))
        })?
        .ok_or_else(|| {
            HwsealError::HardwareUnavailable(
                "no default gateway with a resolvable MAC address".into(),
            )
        })?;

    HardwareFingerprint::new(serial, mac)
}

/// Resolve the fingerprint and derive the key in one step.
pub fn resolve<S>(source: &S) -> HwsealResult<DerivedKey>
where
    S: HardwareSource + ?Sized,
{
    Ok(resolve_fingerprint(source)?.derive_key())
}
