//! Single choke point for every mutating call.
//!
//! Live and dry runs walk the same state machine; the gate decides whether
//! the underlying operation actually executes. Counters move either way.

use crate::error::HwsealResult;
use log::info;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationCounts {
    pub headers_written: usize,
    pub slots_removed: usize,
    pub keys_added: usize,
    pub tokens_written: usize,
    pub tokens_removed: usize,
}

impl MutationCounts {
    pub fn total(&self) -> usize {
        self.headers_written
            + self.slots_removed
            + self.keys_added
            + self.tokens_written
            + self.tokens_removed
    }
}

#[derive(Debug, Default)]
pub struct MutationGate {
    dry_run: bool,
    counts: MutationCounts,
}

impl MutationGate {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            counts: MutationCounts::default(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn counts(&self) -> MutationCounts {
        self.counts
    }

    pub fn header_write<F>(&mut self, device: &str, destination: &Path, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        let what = format!(
            "write header backup of {device} to {}",
            destination.display()
        );
        self.apply(&what, op)?;
        self.counts.headers_written += 1;
        Ok(())
    }

    pub fn kill_slot<F>(&mut self, device: &str, slot: u8, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        self.apply(&format!("remove keyslot {slot} from {device}"), op)?;
        self.counts.slots_removed += 1;
        Ok(())
    }

    pub fn add_key<F>(&mut self, device: &str, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        self.apply(&format!("add hardware-derived key to {device}"), op)?;
        self.counts.keys_added += 1;
        Ok(())
    }

    /// Count a key that an earlier attempt installed while reporting failure.
    pub fn record_key_added(&mut self, device: &str) {
        info!("hardware-derived key already present on {device}");
        self.counts.keys_added += 1;
    }

    pub fn write_token<F>(&mut self, device: &str, slot: Option<u8>, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        let what = match slot {
            Some(slot) => format!("tag keyslot {slot} of {device} with a provenance token"),
            None => format!("tag the new keyslot of {device} with a provenance token"),
        };
        self.apply(&what, op)?;
        self.counts.tokens_written += 1;
        Ok(())
    }

    pub fn remove_token<F>(&mut self, device: &str, token_id: u32, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        self.apply(&format!("remove stale token {token_id} from {device}"), op)?;
        self.counts.tokens_removed += 1;
        Ok(())
    }

    fn apply<F>(&self, what: &str, op: F) -> HwsealResult<()>
    where
        F: FnOnce() -> HwsealResult<()>,
    {
        if self.dry_run {
            info!("[dry-run] would {what}");
            return Ok(());
        }
        info!("{what}");
        op()
    }
}
