#![forbid(unsafe_code)]

//! System provider for LUKS containers.
//!
//! Integrates with the host via:
//! - `cryptsetup` (luksDump, test-passphrase, luksAddKey, luksKillSlot,
//!   luksHeaderBackup, token export/import/remove)
//! - `lsblk` for active `crypt` mappings

mod command;
mod dump;
mod lsblk;
mod system;

pub use system::SystemLuksProvider;
