use super::*;
use crate::config::HwsealConfig;
use crate::credential::{KeyFile, Passphrase};
use crate::fingerprint::derive_key;
use crate::fingerprint::tests::StaticHardware;
use crate::provenance::PROVENANCE_TOKEN_TYPE;
use crate::run::{run, RunOptions, RunResult};
use hwseal_provider::{DumpToken, KeySource};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const PASS: &[u8] = b"correct horse battery staple";
const SERIAL: &str = "BOARD-0042";
const OLD_MAC: &str = "00:11:22:33:44:55";
const NEW_MAC: &str = "66:77:88:99:aa:bb";

#[derive(Debug, Clone)]
struct MockDevice {
    version: LuksVersion,
    uuid: String,
    slots: BTreeMap<u8, Vec<u8>>,
    tokens: BTreeMap<u32, String>,
}

impl MockDevice {
    fn new(version: LuksVersion, uuid: &str) -> Self {
        Self {
            version,
            uuid: uuid.to_string(),
            slots: BTreeMap::from([(0, PASS.to_vec())]),
            tokens: BTreeMap::new(),
        }
    }

    fn with_slot(mut self, slot: u8, key: &[u8]) -> Self {
        self.slots.insert(slot, key.to_vec());
        self
    }

    fn with_token(mut self, id: u32, json: &str) -> Self {
        self.tokens.insert(id, json.to_string());
        self
    }

    fn opens(&self, key: &[u8]) -> bool {
        self.slots.values().any(|stored| stored == key)
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    add_key_failures: usize,
    /// Adds that install the key but still report an error.
    add_key_lands_then_fails: usize,
    corrupt_added_key: bool,
    kill_slot_fails: bool,
    token_import_fails: bool,
    header_backup_fails: bool,
}

#[derive(Debug, Default)]
struct MockState {
    order: Vec<String>,
    devices: HashMap<String, MockDevice>,
    faults: HashMap<String, Faults>,
    mutations: Vec<String>,
    listed: usize,
}

#[derive(Clone, Default)]
struct MockLuks {
    state: Arc<Mutex<MockState>>,
}

impl MockLuks {
    fn with_devices(devices: Vec<(&str, MockDevice)>) -> Self {
        let mock = MockLuks::default();
        {
            let mut state = mock.state.lock().unwrap();
            for (path, device) in devices {
                state.order.push(path.to_string());
                state.devices.insert(path.to_string(), device);
            }
        }
        mock
    }

    fn fault(&self, device: &str, faults: Faults) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(device.to_string(), faults);
    }

    fn device(&self, path: &str) -> MockDevice {
        self.state.lock().unwrap().devices[path].clone()
    }

    fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    fn listed(&self) -> usize {
        self.state.lock().unwrap().listed
    }

    fn snapshot(&self) -> MockLuks {
        let state = self.state.lock().unwrap();
        MockLuks {
            state: Arc::new(Mutex::new(MockState {
                order: state.order.clone(),
                devices: state.devices.clone(),
                faults: state.faults.clone(),
                mutations: Vec::new(),
                listed: 0,
            })),
        }
    }
}

fn key_bytes(source: KeySource<'_>) -> HwsealResult<Vec<u8>> {
    match source {
        KeySource::Bytes(bytes) => Ok(bytes.to_vec()),
        KeySource::File(path) => Ok(fs::read(path)?),
    }
}

fn missing(device: &str) -> HwsealError {
    HwsealError::Provider(format!("Device {device} does not exist"))
}

impl LuksProvider for MockLuks {
    type Error = HwsealError;

    fn list_encrypted_devices(&self) -> HwsealResult<Vec<BlockDevice>> {
        let mut state = self.state.lock().unwrap();
        state.listed += 1;
        Ok(state
            .order
            .iter()
            .map(|path| BlockDevice {
                mapping: format!("/dev/mapper/{}", path.trim_start_matches("/dev/")),
                device: path.clone(),
            })
            .collect())
    }

    fn dump(&self, device: &str) -> HwsealResult<LuksDump> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(device).ok_or_else(|| missing(device))?;
        let tokens = if dev.version.supports_tokens() {
            dev.tokens
                .iter()
                .map(|(id, json)| {
                    let value: Value = serde_json::from_str(json).unwrap_or(Value::Null);
                    let kind = value["type"].as_str().unwrap_or("unknown").to_string();
                    let keyslots = value["keyslots"]
                        .as_array()
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|entry| entry.as_str()?.parse().ok())
                                .collect()
                        })
                        .unwrap_or_default();
                    (*id, DumpToken { kind, keyslots })
                })
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(LuksDump {
            version: dev.version,
            uuid: Some(dev.uuid.clone()),
            active_slots: dev.slots.keys().copied().collect(),
            tokens,
        })
    }

    fn test_key(&self, device: &str, key: KeySource<'_>) -> HwsealResult<bool> {
        let key = key_bytes(key)?;
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(device).ok_or_else(|| missing(device))?;
        Ok(dev.opens(&key))
    }

    fn test_key_in_slot(&self, device: &str, key: KeySource<'_>, slot: u8) -> HwsealResult<bool> {
        let key = key_bytes(key)?;
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(device).ok_or_else(|| missing(device))?;
        Ok(dev.slots.get(&slot).map(|stored| *stored == key).unwrap_or(false))
    }

    fn add_key(&self, device: &str, new_key: &Path, authorizing: KeySource<'_>) -> HwsealResult<()> {
        let auth = key_bytes(authorizing)?;
        let mut new_key = fs::read(new_key)?;
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("add_key {device}"));
        let faults = state.faults.entry(device.to_string()).or_default();
        if faults.add_key_failures > 0 {
            faults.add_key_failures -= 1;
            return Err(HwsealError::Provider("device busy".into()));
        }
        if faults.corrupt_added_key {
            new_key = b"garbage".to_vec();
        }
        let dev = state.devices.get_mut(device).ok_or_else(|| missing(device))?;
        if !dev.opens(&auth) {
            return Err(HwsealError::Provider("No key available with this passphrase.".into()));
        }
        let slot = (0..dev.version.max_keyslots())
            .find(|slot| !dev.slots.contains_key(slot))
            .ok_or_else(|| HwsealError::Provider("All key slots full.".into()))?;
        dev.slots.insert(slot, new_key);
        let faults = state.faults.entry(device.to_string()).or_default();
        if faults.add_key_lands_then_fails > 0 {
            faults.add_key_lands_then_fails -= 1;
            return Err(HwsealError::Provider("Command timed out.".into()));
        }
        Ok(())
    }

    fn kill_slot(&self, device: &str, slot: u8, authorizing: KeySource<'_>) -> HwsealResult<()> {
        let auth = key_bytes(authorizing)?;
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("kill_slot {device} {slot}"));
        if state
            .faults
            .get(device)
            .map(|f| f.kill_slot_fails)
            .unwrap_or(false)
        {
            return Err(HwsealError::Provider("Device or resource busy.".into()));
        }
        let dev = state.devices.get_mut(device).ok_or_else(|| missing(device))?;
        if !dev.slots.contains_key(&slot) {
            return Err(HwsealError::Provider(format!("Keyslot {slot} is not active.")));
        }
        let authorised = dev
            .slots
            .iter()
            .any(|(index, stored)| *index != slot && *stored == auth);
        if !authorised {
            return Err(HwsealError::Provider("No key available with this passphrase.".into()));
        }
        dev.slots.remove(&slot);
        Ok(())
    }

    fn header_backup(&self, device: &str, destination: &Path) -> HwsealResult<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("header_backup {device}"));
        if state
            .faults
            .get(device)
            .map(|f| f.header_backup_fails)
            .unwrap_or(false)
        {
            return Err(HwsealError::Provider("No space left on device".into()));
        }
        let uuid = state.devices.get(device).ok_or_else(|| missing(device))?.uuid.clone();
        fs::write(destination, format!("HEADER:{uuid}"))?;
        Ok(())
    }

    fn token_export(&self, device: &str, token_id: u32) -> HwsealResult<String> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(device).ok_or_else(|| missing(device))?;
        dev.tokens
            .get(&token_id)
            .cloned()
            .ok_or_else(|| HwsealError::Provider(format!("Token {token_id} is not in use.")))
    }

    fn token_import(&self, device: &str, token_id: Option<u32>, json: &str) -> HwsealResult<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("token_import {device}"));
        if state
            .faults
            .get(device)
            .map(|f| f.token_import_fails)
            .unwrap_or(false)
        {
            return Err(HwsealError::Provider("Failed to import token.".into()));
        }
        let dev = state.devices.get_mut(device).ok_or_else(|| missing(device))?;
        if !dev.version.supports_tokens() {
            return Err(HwsealError::Provider("Tokens are supported only with LUKS2.".into()));
        }
        let id = token_id.unwrap_or_else(|| (0..).find(|id| !dev.tokens.contains_key(id)).unwrap());
        dev.tokens.insert(id, json.to_string());
        Ok(())
    }

    fn token_remove(&self, device: &str, token_id: u32) -> HwsealResult<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("token_remove {device} {token_id}"));
        let dev = state.devices.get_mut(device).ok_or_else(|| missing(device))?;
        dev.tokens
            .remove(&token_id)
            .map(|_| ())
            .ok_or_else(|| HwsealError::Provider(format!("Token {token_id} is not in use.")))
    }
}

fn owned_token(slots: &[&str]) -> String {
    serde_json::json!({
        "type": PROVENANCE_TOKEN_TYPE,
        "keyslots": slots,
        "version": "1",
        "generation_time": "2025-01-01T00:00:00Z",
    })
    .to_string()
}

fn old_key() -> Vec<u8> {
    derive_key(SERIAL, OLD_MAC).as_bytes().to_vec()
}

fn new_key() -> Vec<u8> {
    derive_key(SERIAL, NEW_MAC).as_bytes().to_vec()
}

fn test_config(dir: &TempDir) -> HwsealConfig {
    let mut config = HwsealConfig::default();
    config.runtime.key_dir = dir.path().join("run").to_string_lossy().into_owned();
    config.headers.local_dir = dir.path().join("headers").to_string_lossy().into_owned();
    config.headers.download_dir = dir.path().join("download").to_string_lossy().into_owned();
    config
}

fn passphrase() -> Passphrase {
    Passphrase::new(PASS.to_vec()).unwrap()
}

fn run_with(mock: &MockLuks, dir: &TempDir, mac: &'static str, dry_run: bool) -> RunResult {
    let config = test_config(dir);
    let hardware = StaticHardware::new(SERIAL, mac);
    let options = RunOptions {
        dry_run,
        ..RunOptions::default()
    };
    run(&config, mock, &hardware, &passphrase(), &options).unwrap()
}

/// Minimal engine harness for tests that bypass the run coordinator.
fn process_one(mock: &MockLuks, device: &str, credential: &dyn Credential, dry_run: bool) -> DeviceReport {
    process_counted(mock, device, credential, dry_run).0
}

fn process_counted(
    mock: &MockLuks,
    device: &str,
    credential: &dyn Credential,
    dry_run: bool,
) -> (DeviceReport, MutationCounts) {
    let dir = tempdir().unwrap();
    let derived = DerivedKeyFile::stage(dir.path(), &derive_key(SERIAL, NEW_MAC)).unwrap();
    let mut backups = HeaderBackupCoordinator::new(dir.path().join("headers"));
    let mut gate = MutationGate::new(dry_run);
    let engine = SlotLifecycle::new(mock, credential, &derived, RetryPolicy::INSTALL);
    let target = BlockDevice {
        mapping: "/dev/mapper/test".into(),
        device: device.to_string(),
    };
    let report = engine.process(&target, &mut backups, &mut gate);
    (report, gate.counts())
}

fn slot_of_token(json: &str) -> Vec<String> {
    let value: Value = serde_json::from_str(json).unwrap();
    value["keyslots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

#[test]
fn fresh_luks2_device_gets_slot_and_token() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    assert_eq!(
        report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![],
            tagged: true,
        }
    );
    let device = mock.device("/dev/sda1");
    assert_eq!(device.slots[&1], new_key());
    assert_eq!(device.tokens.len(), 1);
    assert_eq!(slot_of_token(&device.tokens[&0]), vec!["1".to_string()]);
}

#[test]
fn unchanged_hardware_second_run_skips_everything() {
    let dir = tempdir().unwrap();
    let mock = MockLuks::with_devices(vec![
        ("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a")),
        ("/dev/sdb1", MockDevice::new(LuksVersion::V1, "uuid-b")),
    ]);

    let first = run_with(&mock, &dir, NEW_MAC, false);
    assert_eq!(first.added.len(), 2);

    let before = mock.mutations().len();
    let second = run_with(&mock, &dir, NEW_MAC, false);
    assert_eq!(second.skipped.len(), 2);
    assert!(second.added.is_empty() && second.failed.is_empty());
    assert_eq!(second.mutations.keys_added, 0);
    assert_eq!(second.mutations.slots_removed, 0);
    assert_eq!(second.mutations.tokens_written, 0);

    let slot_mutations: Vec<String> = mock.mutations()[before..]
        .iter()
        .filter(|call| !call.starts_with("header_backup"))
        .cloned()
        .collect();
    assert!(slot_mutations.is_empty(), "unexpected calls: {slot_mutations:?}");
}

#[test]
fn rollover_replaces_owned_slot_and_retags() {
    let device = MockDevice::new(LuksVersion::V2, "uuid-a")
        .with_slot(1, &old_key())
        .with_token(0, &owned_token(&["1"]));
    let mock = MockLuks::with_devices(vec![("/dev/sda1", device)]);
    assert!(mock.test_key("/dev/sda1", KeySource::Bytes(PASS)).unwrap());

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    assert_eq!(
        report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![1],
            tagged: true,
        }
    );
    let after = mock.device("/dev/sda1");
    assert_eq!(after.slots.len(), 2);
    assert_eq!(after.slots[&1], new_key());
    assert!(!after.opens(&old_key()));
    assert!(mock.test_key("/dev/sda1", KeySource::Bytes(PASS)).unwrap());

    let owned: Vec<&String> = after.tokens.values().collect();
    assert_eq!(owned.len(), 1, "stale token should be replaced");
    assert_eq!(slot_of_token(owned[0]), vec!["1".to_string()]);

    let adds = mock
        .mutations()
        .iter()
        .filter(|call| call.starts_with("add_key"))
        .count();
    assert_eq!(adds, 1);
}

#[test]
fn slot_zero_is_never_removed_even_when_tagged() {
    let device = MockDevice::new(LuksVersion::V2, "uuid-a")
        .with_slot(1, &old_key())
        .with_token(0, &owned_token(&["0", "1"]));
    let mock = MockLuks::with_devices(vec![("/dev/sda1", device)]);

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    assert!(matches!(report.outcome, Outcome::Added { .. }));
    assert!(!mock.mutations().iter().any(|call| call == "kill_slot /dev/sda1 0"));
    assert!(mock.device("/dev/sda1").slots.contains_key(&0));
    assert!(report.warnings.iter().any(|w| w.contains("slot 0")));
}

#[test]
fn cleanup_plan_keeps_one_slot_alive() {
    let owned = OwnedSlots {
        slots: BTreeSet::from([1]),
        tokens: BTreeMap::from([(0, BTreeSet::from([1]))]),
    };

    let two_active = LuksDump {
        version: LuksVersion::V2,
        uuid: None,
        active_slots: BTreeSet::from([0, 1]),
        tokens: BTreeMap::new(),
    };
    let plan = plan_cleanup("/dev/sda1", &two_active, &owned).unwrap();
    assert_eq!(plan.remove, vec![1]);
    assert_eq!(plan.remaining, 1);

    let only_owned = LuksDump {
        active_slots: BTreeSet::from([1]),
        ..two_active
    };
    let err = plan_cleanup("/dev/sda1", &only_owned, &owned).unwrap_err();
    assert!(matches!(err, HwsealError::SafetyInvariant { .. }));
}

#[test]
fn cleanup_plan_ignores_inactive_and_protected_slots() {
    let owned = OwnedSlots {
        slots: BTreeSet::from([0, 3, 5]),
        tokens: BTreeMap::new(),
    };
    let dump = LuksDump {
        version: LuksVersion::V2,
        uuid: None,
        active_slots: BTreeSet::from([0, 3]),
        tokens: BTreeMap::new(),
    };
    let plan = plan_cleanup("/dev/sda1", &dump, &owned).unwrap();
    assert_eq!(plan.remove, vec![3]);
    assert_eq!(plan.protected, vec![0]);
}

#[test]
fn cleanup_aborts_without_removing_when_it_would_lock_out() {
    let dir = tempdir().unwrap();
    let stale_keyfile = dir.path().join("stale.key");
    fs::write(&stale_keyfile, old_key()).unwrap();
    let credential = KeyFile::new(&stale_keyfile).unwrap();

    let mut device = MockDevice::new(LuksVersion::V2, "uuid-a")
        .with_slot(1, &old_key())
        .with_token(0, &owned_token(&["1"]));
    device.slots.remove(&0);
    let mock = MockLuks::with_devices(vec![("/dev/sda1", device)]);

    let report = process_one(&mock, "/dev/sda1", &credential, false);

    match &report.outcome {
        Outcome::Failed { stage, reason } => {
            assert_eq!(*stage, Stage::SlotCleanup);
            assert!(reason.contains("no active keyslot"), "{reason}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!mock.mutations().iter().any(|call| call.starts_with("kill_slot")));
    assert!(!mock.mutations().iter().any(|call| call.starts_with("add_key")));
    assert_eq!(mock.device("/dev/sda1").slots.len(), 1);
}

#[test]
fn luks1_device_never_gets_a_token() {
    let mock = MockLuks::with_devices(vec![("/dev/sdb1", MockDevice::new(LuksVersion::V1, "uuid-b"))]);
    let report = process_one(&mock, "/dev/sdb1", &passphrase(), false);

    assert_eq!(
        report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![],
            tagged: false,
        }
    );
    assert!(!mock.mutations().iter().any(|call| call.starts_with("token_")));
}

#[test]
fn luks1_owned_set_is_empty_regardless_of_dump() {
    let mock = MockLuks::with_devices(vec![(
        "/dev/sdb1",
        MockDevice::new(LuksVersion::V1, "uuid-b").with_token(0, &owned_token(&["1"])),
    )]);
    let dump = LuksDump {
        version: LuksVersion::V1,
        uuid: None,
        active_slots: BTreeSet::from([0, 1]),
        tokens: BTreeMap::from([(
            0,
            DumpToken {
                kind: PROVENANCE_TOKEN_TYPE.into(),
                keyslots: BTreeSet::from([1]),
            },
        )]),
    };
    let owned = find_owned_slots(&mock, "/dev/sdb1", &dump);
    assert!(owned.is_empty());
}

#[test]
fn unparseable_and_foreign_tokens_are_not_owned() {
    let device = MockDevice::new(LuksVersion::V2, "uuid-a")
        .with_slot(1, b"clevis-secret")
        .with_slot(2, &old_key())
        .with_token(0, r#"{"type":"clevis","keyslots":["1"]}"#)
        .with_token(1, "{broken")
        .with_token(2, &owned_token(&["2"]));
    let mock = MockLuks::with_devices(vec![("/dev/sda1", device)]);
    let dump = mock.dump("/dev/sda1").unwrap();

    let owned = find_owned_slots(&mock, "/dev/sda1", &dump);
    assert_eq!(owned.slots, BTreeSet::from([2]));
}

#[test]
fn dry_run_matches_live_classification_without_mutating() {
    let dir_live = tempdir().unwrap();
    let dir_dry = tempdir().unwrap();
    let live = MockLuks::with_devices(vec![
        (
            "/dev/sda1",
            MockDevice::new(LuksVersion::V2, "uuid-a")
                .with_slot(1, &old_key())
                .with_token(0, &owned_token(&["1"])),
        ),
        ("/dev/sdb1", MockDevice::new(LuksVersion::V1, "uuid-b")),
        (
            "/dev/sdc1",
            MockDevice::new(LuksVersion::V2, "uuid-c").with_slot(1, &new_key()),
        ),
    ]);
    {
        let mut state = live.state.lock().unwrap();
        let dev = state.devices.get_mut("/dev/sdb1").unwrap();
        dev.slots.insert(0, b"some other passphrase".to_vec());
    }
    let dry = live.snapshot();

    let live_result = run_with(&live, &dir_live, NEW_MAC, false);
    let dry_result = run_with(&dry, &dir_dry, NEW_MAC, true);

    let devices = |devices: &[crate::run::AddedDevice]| {
        devices.iter().map(|d| d.device.clone()).collect::<Vec<_>>()
    };
    assert_eq!(devices(&live_result.added), devices(&dry_result.added));
    assert_eq!(
        live_result.skipped.iter().map(|d| &d.device).collect::<Vec<_>>(),
        dry_result.skipped.iter().map(|d| &d.device).collect::<Vec<_>>()
    );
    assert_eq!(
        live_result
            .failed
            .iter()
            .map(|d| (&d.device, &d.reason))
            .collect::<Vec<_>>(),
        dry_result
            .failed
            .iter()
            .map(|d| (&d.device, &d.reason))
            .collect::<Vec<_>>()
    );
    assert_eq!(live_result.added.len(), 1);
    assert_eq!(live_result.skipped.len(), 1);
    assert_eq!(live_result.failed.len(), 1);

    assert!(dry.mutations().is_empty(), "dry run mutated: {:?}", dry.mutations());
    assert!(dry_result.dry_run);
    assert_eq!(dry_result.mutations, live_result.mutations);
    assert_eq!(dry_result.headers_captured, live_result.headers_captured);
    assert!(dry_result.header_files.iter().all(|path| !path.exists()));
}

#[test]
fn two_device_rollover_end_to_end() {
    let dir = tempdir().unwrap();
    let mock = MockLuks::with_devices(vec![
        (
            "/dev/md1p1",
            MockDevice::new(LuksVersion::V2, "uuid-a")
                .with_slot(1, &old_key())
                .with_token(0, &owned_token(&["1"])),
        ),
        ("/dev/md2p1", MockDevice::new(LuksVersion::V1, "uuid-b")),
    ]);

    let result = run_with(&mock, &dir, NEW_MAC, false);

    assert!(result.is_success());
    assert_eq!(result.added.len(), 2);
    let a = &result.added[0];
    assert_eq!(a.device, "/dev/md1p1");
    assert_eq!(a.removed_slots, vec![1]);
    assert!(a.tagged);
    let b = &result.added[1];
    assert_eq!(b.device, "/dev/md2p1");
    assert!(b.removed_slots.is_empty());
    assert!(!b.tagged);

    assert_eq!(result.headers_captured, 2);
    for path in &result.header_files {
        assert!(path.is_file());
        let mode = fs::metadata(path).unwrap().permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);
    }
    assert!(result.header_files[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains("md1p1-uuid-a"));

    let again = run_with(&mock, &dir, NEW_MAC, false);
    assert_eq!(again.skipped.len(), 2);
    assert!(again.added.is_empty());
    assert!(again.failed.is_empty());
}

#[test]
fn wrong_credential_fails_only_that_device() {
    let dir = tempdir().unwrap();
    let mut other = MockDevice::new(LuksVersion::V2, "uuid-b");
    other.slots.insert(0, b"different".to_vec());
    let mock = MockLuks::with_devices(vec![
        ("/dev/sda1", other),
        ("/dev/sdb1", MockDevice::new(LuksVersion::V2, "uuid-c")),
    ]);

    let result = run_with(&mock, &dir, NEW_MAC, false);

    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].device, "/dev/sda1");
    assert_eq!(result.failed[0].stage, Stage::KeyCheck);
    assert!(result.failed[0].header_backup.is_none());
    assert_eq!(result.added.len(), 1);
    assert_eq!(result.added[0].device, "/dev/sdb1");
    assert!(!result.is_success());
    assert!(result.to_report().has_errors());
}

#[test]
fn header_backup_failure_blocks_mutation() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            header_backup_fails: true,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    match report.outcome {
        Outcome::Failed { stage, .. } => assert_eq!(stage, Stage::HeaderBackup),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(mock.mutations(), vec!["header_backup /dev/sda1".to_string()]);
}

#[test]
fn install_is_retried_once() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            add_key_failures: 1,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    assert!(matches!(report.outcome, Outcome::Added { tagged: true, .. }));
    let adds = mock
        .mutations()
        .iter()
        .filter(|call| call.starts_with("add_key"))
        .count();
    assert_eq!(adds, 2);
}

#[test]
fn install_fails_after_two_attempts() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            add_key_failures: 5,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    match report.outcome {
        Outcome::Failed { stage, reason } => {
            assert_eq!(stage, Stage::SlotInstall);
            assert!(reason.contains("after 2 attempts"), "{reason}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(mock.device("/dev/sda1").slots.len(), 1);
}

#[test]
fn token_failure_is_only_a_warning() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            token_import_fails: true,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    assert_eq!(
        report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![],
            tagged: false,
        }
    );
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("provenance token for slot 1 not written")));
    assert!(mock.device("/dev/sda1").opens(&new_key()));
}

#[test]
fn unverifiable_install_is_rolled_back() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            corrupt_added_key: true,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    match report.outcome {
        Outcome::Failed { stage, .. } => assert_eq!(stage, Stage::Verify),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let slots: Vec<u8> = mock.device("/dev/sda1").slots.keys().copied().collect();
    assert_eq!(slots, vec![0]);
    assert!(mock
        .mutations()
        .iter()
        .any(|call| call == "kill_slot /dev/sda1 1"));
}

#[test]
fn missing_fingerprint_aborts_before_enumeration() {
    let dir = tempdir().unwrap();
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    let hardware = StaticHardware {
        serial: Some(SERIAL),
        mac: None,
    };

    let err = run(
        &test_config(&dir),
        &mock,
        &hardware,
        &passphrase(),
        &RunOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(err, HwsealError::HardwareUnavailable(_)));
    assert_eq!(mock.listed(), 0);
    assert!(mock.mutations().is_empty());
}

#[test]
fn derived_key_file_is_gone_after_run() {
    let dir = tempdir().unwrap();
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);

    run_with(&mock, &dir, NEW_MAC, false);

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("run")).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn stale_slot_removal_failure_is_only_a_warning() {
    let dir = tempdir().unwrap();
    let aux = b"auxiliary unlock key".to_vec();
    let aux_keyfile = dir.path().join("aux.key");
    fs::write(&aux_keyfile, &aux).unwrap();
    let credential = KeyFile::new(&aux_keyfile).unwrap();

    let device = MockDevice::new(LuksVersion::V2, "uuid-a")
        .with_slot(1, &old_key())
        .with_slot(2, &aux)
        .with_token(0, &owned_token(&["1", "2"]));
    let mock = MockLuks::with_devices(vec![("/dev/sda1", device)]);

    let report = process_one(&mock, "/dev/sda1", &credential, false);

    assert_eq!(
        report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![1],
            tagged: true,
        }
    );
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("unable to remove stale slot 2")));
    assert!(mock
        .mutations()
        .iter()
        .any(|call| call == "kill_slot /dev/sda1 2"));
    let device = mock.device("/dev/sda1");
    assert_eq!(device.slots[&1], new_key());
    assert_eq!(device.slots[&2], aux);
    // Slot 2 survived, so its token stays.
    assert!(device.tokens.contains_key(&0));
}

#[test]
fn failed_rollback_is_only_a_warning() {
    let mock = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    mock.fault(
        "/dev/sda1",
        Faults {
            corrupt_added_key: true,
            kill_slot_fails: true,
            ..Faults::default()
        },
    );

    let report = process_one(&mock, "/dev/sda1", &passphrase(), false);

    match &report.outcome {
        Outcome::Failed { stage, .. } => assert_eq!(*stage, Stage::Verify),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("rollback of slot 1 failed")));
    let slots: Vec<u8> = mock.device("/dev/sda1").slots.keys().copied().collect();
    assert_eq!(slots, vec![0, 1]);
}

#[test]
fn add_that_landed_despite_error_is_counted_once() {
    let live = MockLuks::with_devices(vec![("/dev/sda1", MockDevice::new(LuksVersion::V2, "uuid-a"))]);
    live.fault(
        "/dev/sda1",
        Faults {
            add_key_lands_then_fails: 1,
            ..Faults::default()
        },
    );
    let dry = live.snapshot();

    let (live_report, live_counts) = process_counted(&live, "/dev/sda1", &passphrase(), false);
    let (_, dry_counts) = process_counted(&dry, "/dev/sda1", &passphrase(), true);

    assert_eq!(
        live_report.outcome,
        Outcome::Added {
            new_slot: Some(1),
            removed_slots: vec![],
            tagged: true,
        }
    );
    let adds = live
        .mutations()
        .iter()
        .filter(|call| call.starts_with("add_key"))
        .count();
    assert_eq!(adds, 1);
    assert_eq!(live_counts.keys_added, 1);
    assert_eq!(live_counts, dry_counts);
    assert!(dry.mutations().is_empty());
}
