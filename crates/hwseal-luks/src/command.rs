//! Execution wrapper for invoking `cryptsetup`.
//!
//! Shell integration stays isolated here so provider logic remains testable
//! with fake binaries and deterministic stdout.

use hwseal_core::error::{HwsealError, HwsealResult};
use hwseal_core::process::{Output, ProcessRunner};
use hwseal_provider::KeySource;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `cryptsetup open --test-passphrase` exit code for a key that opens nothing.
const EXIT_NO_PERMISSION: i32 = 2;

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    runner: ProcessRunner,
}

/// `--key-file` argument plus whatever must go on stdin.
struct KeyArg<'a> {
    arg: String,
    input: Option<&'a [u8]>,
    desc: String,
}

impl<'a> KeyArg<'a> {
    fn from_source(source: KeySource<'a>) -> Self {
        match source {
            KeySource::Bytes(bytes) => Self {
                arg: "-".to_string(),
                input: Some(bytes),
                desc: "key material on stdin".to_string(),
            },
            KeySource::File(path) => Self {
                arg: path.to_string_lossy().into_owned(),
                input: None,
                desc: format!("keyfile {}", path.display()),
            },
        }
    }
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: ProcessRunner::new(binary, timeout),
        }
    }

    pub(crate) fn luks_dump(&self, device: &str) -> HwsealResult<String> {
        let out = self.runner.run(&["luksDump", device], None)?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(failure(classify_access_failure("read the header of", device, &out), &out))
    }

    /// `Ok(false)` means the key was rejected; anything unexpected is an error.
    pub(crate) fn test_key(
        &self,
        device: &str,
        key: KeySource<'_>,
        slot: Option<u8>,
    ) -> HwsealResult<bool> {
        let key = KeyArg::from_source(key);
        let slot_arg = slot.map(|slot| slot.to_string());
        let mut args = vec![
            "open",
            "--test-passphrase",
            "--batch-mode",
            "--key-file",
            key.arg.as_str(),
        ];
        if let Some(slot) = &slot_arg {
            args.push("--key-slot");
            args.push(slot.as_str());
        }
        args.push(device);

        let out = self.runner.run(&args, key.input)?;
        match out.status {
            0 => Ok(true),
            EXIT_NO_PERMISSION => Ok(false),
            _ => Err(failure(
                classify_test_failure(device, slot, &key.desc, &out.diagnostic()),
                &out,
            )),
        }
    }

    pub(crate) fn add_key(
        &self,
        device: &str,
        new_key: &Path,
        authorizing: KeySource<'_>,
    ) -> HwsealResult<()> {
        let auth = KeyArg::from_source(authorizing);
        let new_key_arg = new_key.to_string_lossy().into_owned();
        let args = [
            "luksAddKey",
            "--batch-mode",
            "--key-file",
            auth.arg.as_str(),
            device,
            new_key_arg.as_str(),
        ];
        let out = self.runner.run(&args, auth.input)?;
        if out.success() {
            return Ok(());
        }
        Err(failure(
            classify_addkey_failure(device, &auth.desc, &out.diagnostic()),
            &out,
        ))
    }

    pub(crate) fn kill_slot(
        &self,
        device: &str,
        slot: u8,
        authorizing: KeySource<'_>,
    ) -> HwsealResult<()> {
        let auth = KeyArg::from_source(authorizing);
        let slot_arg = slot.to_string();
        let args = [
            "luksKillSlot",
            "--batch-mode",
            "--key-file",
            auth.arg.as_str(),
            device,
            slot_arg.as_str(),
        ];
        let out = self.runner.run(&args, auth.input)?;
        if out.success() {
            return Ok(());
        }
        Err(failure(
            classify_killslot_failure(device, slot, &auth.desc, &out.diagnostic()),
            &out,
        ))
    }

    pub(crate) fn header_backup(&self, device: &str, destination: &Path) -> HwsealResult<()> {
        let dest = destination.to_string_lossy().into_owned();
        let args = ["luksHeaderBackup", device, "--header-backup-file", dest.as_str()];
        let out = self.runner.run(&args, None)?;
        if out.success() {
            return Ok(());
        }
        Err(failure(
            classify_access_failure("back up the header of", device, &out),
            &out,
        ))
    }

    pub(crate) fn token_export(&self, device: &str, token_id: u32) -> HwsealResult<String> {
        let id = token_id.to_string();
        let out = self
            .runner
            .run(&["token", "export", "--token-id", id.as_str(), device], None)?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(failure(
            classify_token_failure("export", device, Some(token_id), &out.diagnostic()),
            &out,
        ))
    }

    pub(crate) fn token_import(
        &self,
        device: &str,
        token_id: Option<u32>,
        json: &str,
    ) -> HwsealResult<()> {
        let id = token_id.map(|id| id.to_string());
        let mut args = vec!["token", "import", "--json-file", "-"];
        if let Some(id) = &id {
            args.push("--token-id");
            args.push(id.as_str());
        }
        args.push(device);

        let out = self.runner.run(&args, Some(json.as_bytes()))?;
        if out.success() {
            return Ok(());
        }
        Err(failure(
            classify_token_failure("import", device, token_id, &out.diagnostic()),
            &out,
        ))
    }

    pub(crate) fn token_remove(&self, device: &str, token_id: u32) -> HwsealResult<()> {
        let id = token_id.to_string();
        let out = self
            .runner
            .run(&["token", "remove", "--token-id", id.as_str(), device], None)?;
        if out.success() {
            return Ok(());
        }
        Err(failure(
            classify_token_failure("remove", device, Some(token_id), &out.diagnostic()),
            &out,
        ))
    }
}

fn failure(message: String, out: &Output) -> HwsealError {
    HwsealError::Provider(format!("{message} (exit code {})", out.status))
}

fn or_placeholder(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_permission_problem(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn is_missing_device(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

fn is_not_luks(lower: &str) -> bool {
    lower.contains("not a valid luks device") || lower.contains("is not a luks device")
}

fn is_rejected_key(lower: &str) -> bool {
    lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}

fn classify_access_failure(action: &str, device: &str, out: &Output) -> String {
    let diagnostic = or_placeholder(&out.diagnostic());
    let lower = diagnostic.to_ascii_lowercase();

    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not {action} `{device}`: {diagnostic}. This requires root"
        );
    }
    if is_not_luks(&lower) {
        return format!("`{device}` is not a LUKS device: {diagnostic}");
    }
    if is_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{device}`: {diagnostic}. Confirm the device is present"
        );
    }
    format!("cryptsetup failed to {action} `{device}`: {diagnostic}")
}

fn classify_test_failure(device: &str, slot: Option<u8>, key_desc: &str, diagnostic: &str) -> String {
    let diagnostic = or_placeholder(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();
    let target = match slot {
        Some(slot) => format!("slot {slot} of `{device}`"),
        None => format!("`{device}`"),
    };

    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not test {key_desc} against {target}: {diagnostic}. This requires root"
        );
    }
    if lower.contains("not active") || lower.contains("keyslot") || lower.contains("key slot") {
        return format!("cryptsetup could not test {target}: {diagnostic}");
    }
    if is_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{device}` while testing {key_desc}: {diagnostic}"
        );
    }
    format!("cryptsetup failed to test {key_desc} against {target}: {diagnostic}")
}

fn classify_addkey_failure(device: &str, auth_desc: &str, diagnostic: &str) -> String {
    let diagnostic = or_placeholder(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();

    if is_rejected_key(&lower) {
        return format!(
            "cryptsetup rejected the authorizing {auth_desc} while adding a key to `{device}`: {diagnostic}"
        );
    }
    if is_not_luks(&lower) {
        return format!(
            "cryptsetup refused to add a key because `{device}` is not a LUKS device: {diagnostic}"
        );
    }
    if lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("all key slots full")
        || lower.contains("no remaining keyslot")
    {
        return format!(
            "`{device}` has no free keyslot for the hardware-derived key: {diagnostic}. Remove an unused keyslot before retrying"
        );
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not add a key to `{device}`: {diagnostic}. This requires root"
        );
    }
    if is_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{device}` while adding a key: {diagnostic}"
        );
    }
    format!("cryptsetup failed to add a key to `{device}`: {diagnostic}")
}

fn classify_killslot_failure(device: &str, slot: u8, auth_desc: &str, diagnostic: &str) -> String {
    let diagnostic = or_placeholder(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();

    if is_rejected_key(&lower) {
        return format!(
            "cryptsetup rejected the authorizing {auth_desc} while removing slot {slot} from `{device}`: {diagnostic}"
        );
    }
    if lower.contains("not active") {
        return format!("slot {slot} of `{device}` is already inactive: {diagnostic}");
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not remove slot {slot} from `{device}`: {diagnostic}. This requires root"
        );
    }
    format!("cryptsetup failed to remove slot {slot} from `{device}`: {diagnostic}")
}

fn classify_token_failure(action: &str, device: &str, token_id: Option<u32>, diagnostic: &str) -> String {
    let diagnostic = or_placeholder(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();
    let token = token_id
        .map(|id| format!("token {id}"))
        .unwrap_or_else(|| "a token".to_string());

    if lower.contains("only with luks2") || lower.contains("luks1") {
        return format!("`{device}` does not support tokens: {diagnostic}");
    }
    if lower.contains("not in use") {
        return format!("{token} does not exist on `{device}`: {diagnostic}");
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not {action} {token} on `{device}`: {diagnostic}. This requires root"
        );
    }
    format!("cryptsetup failed to {action} {token} on `{device}`: {diagnostic}")
}
