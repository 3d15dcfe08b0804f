use crate::error::{HwsealError, HwsealResult};

/// Header dumps, key tests and slot changes all need root.
pub fn ensure_privilege() -> HwsealResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(missing_privilege_error())
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

fn missing_privilege_error() -> HwsealError {
    HwsealError::Privilege(
        "hwseal must run as root: reading LUKS headers and changing keyslots requires CAP_SYS_ADMIN. Re-run with sudo or from the boot hook."
            .into(),
    )
}
