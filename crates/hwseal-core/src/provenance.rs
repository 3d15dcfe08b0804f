//! Provenance tokens: the only record of which keyslots hwseal created.
//!
//! A slot counts as owned only when a LUKS2 token with our `type` marker
//! lists it. LUKS1 has no token area, so nothing is ever owned there.

use crate::error::{HwsealError, HwsealResult};
use chrono::{DateTime, SecondsFormat, Utc};
use hwseal_provider::{LuksDump, LuksProvider};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// `type` marker written into every token hwseal creates.
pub const PROVENANCE_TOKEN_TYPE: &str = "system-derived";
/// Layout version of the token body; bumped only when its fields change.
pub const PROVENANCE_TOKEN_VERSION: &str = "1";

/// Token body as written to the LUKS2 header. Holds no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceToken {
    #[serde(rename = "type")]
    pub kind: String,
    /// LUKS2 expects keyslot references as decimal strings.
    pub keyslots: Vec<String>,
    pub version: String,
    pub generation_time: String,
}

impl ProvenanceToken {
    pub fn for_slot(slot: u8, generated_at: DateTime<Utc>) -> Self {
        Self {
            kind: PROVENANCE_TOKEN_TYPE.to_string(),
            keyslots: vec![slot.to_string()],
            version: PROVENANCE_TOKEN_VERSION.to_string(),
            generation_time: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn to_json(&self) -> HwsealResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Slots owned on one device, and the tokens that claim them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedSlots {
    pub slots: BTreeSet<u8>,
    pub tokens: BTreeMap<u32, BTreeSet<u8>>,
}

impl OwnedSlots {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Token ids whose every slot is in `removed`.
    pub fn tokens_fully_covered_by(&self, removed: &BTreeSet<u8>) -> Vec<u32> {
        self.tokens
            .iter()
            .filter(|(_, slots)| !slots.is_empty() && slots.is_subset(removed))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Inspect every token on `device` and collect the slots tagged as ours.
///
/// Tokens that fail to export or parse are skipped with a warning; they are
/// never treated as owned.
pub fn find_owned_slots(
    provider: &dyn LuksProvider<Error = HwsealError>,
    device: &str,
    dump: &LuksDump,
) -> OwnedSlots {
    let mut owned = OwnedSlots::default();
    if !dump.version.supports_tokens() {
        debug!("{device} is {}; no provenance tokens possible", dump.version);
        return owned;
    }

    for token_id in dump.tokens.keys() {
        let json = match provider.token_export(device, *token_id) {
            Ok(json) => json,
            Err(err) => {
                warn!("unable to export token {token_id} from {device}: {err}");
                continue;
            }
        };

        match parse_owned_keyslots(&json) {
            Ok(Some(slots)) => {
                debug!("token {token_id} on {device} claims slots {slots:?}");
                owned.slots.extend(slots.iter().copied());
                owned.tokens.insert(*token_id, slots);
            }
            Ok(None) => {}
            Err(err) => warn!("ignoring token {token_id} on {device}: {err}"),
        }
    }

    owned
}

/// `Some(slots)` when the token carries our marker, `None` for foreign tokens.
pub(crate) fn parse_owned_keyslots(json: &str) -> HwsealResult<Option<BTreeSet<u8>>> {
    let value: Value = serde_json::from_str(json).map_err(|err| HwsealError::Parse {
        what: "token JSON",
        reason: err.to_string(),
    })?;

    let kind = value.get("type").and_then(Value::as_str);
    if kind != Some(PROVENANCE_TOKEN_TYPE) {
        return Ok(None);
    }

    let entries = value
        .get("keyslots")
        .and_then(Value::as_array)
        .ok_or_else(|| HwsealError::Parse {
            what: "token JSON",
            reason: "missing keyslots array".into(),
        })?;

    let mut slots = BTreeSet::new();
    for entry in entries {
        let slot = match entry {
            Value::String(text) => text.trim().parse::<u8>().ok(),
            Value::Number(number) => number.as_u64().and_then(|n| u8::try_from(n).ok()),
            _ => None,
        }
        .ok_or_else(|| HwsealError::Parse {
            what: "token JSON",
            reason: format!("invalid keyslot reference {entry}"),
        })?;
        slots.insert(slot);
    }

    Ok(Some(slots))
}
