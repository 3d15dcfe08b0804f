//! `cryptsetup luksDump` text parser.
//!
//! LUKS1 reports `Key Slot N: ENABLED|DISABLED`. LUKS2 groups entries under
//! column-zero section headers (`Keyslots:`, `Tokens:`, ...) with each entry
//! written as `  N: <type>` and its attributes indented by a tab.

use hwseal_core::error::{HwsealError, HwsealResult};
use hwseal_provider::{DumpToken, LuksDump, LuksVersion};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Keyslots,
    Tokens,
    Other,
}

pub(crate) fn parse_luks_dump(text: &str) -> HwsealResult<LuksDump> {
    let version = parse_version(text)?;
    let uuid = field(text, "UUID").filter(|value| !value.is_empty());

    let (active_slots, tokens) = match version {
        LuksVersion::V1 => (parse_v1_slots(text)?, BTreeMap::new()),
        LuksVersion::V2 => parse_v2_sections(text)?,
    };

    Ok(LuksDump {
        version,
        uuid,
        active_slots,
        tokens,
    })
}

fn parse_version(text: &str) -> HwsealResult<LuksVersion> {
    match field(text, "Version").as_deref() {
        Some("1") => Ok(LuksVersion::V1),
        Some("2") => Ok(LuksVersion::V2),
        Some(other) => Err(dump_error(format!("unsupported LUKS version `{other}`"))),
        None => Err(dump_error("no Version line".into())),
    }
}

/// Value of the first column-zero `name:` line.
fn field(text: &str, name: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key == name).then(|| value.trim().to_string())
    })
}

fn parse_v1_slots(text: &str) -> HwsealResult<BTreeSet<u8>> {
    let mut active = BTreeSet::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("Key Slot ") else {
            continue;
        };
        let Some((index, state)) = rest.split_once(':') else {
            continue;
        };
        let slot = parse_slot(index)?;
        if state.trim().eq_ignore_ascii_case("ENABLED") {
            active.insert(slot);
        }
    }
    Ok(active)
}

fn parse_v2_sections(text: &str) -> HwsealResult<(BTreeSet<u8>, BTreeMap<u32, DumpToken>)> {
    let mut section = Section::Preamble;
    let mut active = BTreeSet::new();
    let mut tokens: BTreeMap<u32, DumpToken> = BTreeMap::new();
    let mut current_token: Option<u32> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            if let Some(header) = line.trim_end().strip_suffix(':') {
                section = match header {
                    "Keyslots" => Section::Keyslots,
                    "Tokens" => Section::Tokens,
                    _ => Section::Other,
                };
                current_token = None;
            }
            continue;
        }

        match section {
            Section::Keyslots => {
                if let Some((index, _)) = entry(line) {
                    active.insert(parse_slot(index)?);
                }
            }
            Section::Tokens => {
                if let Some((index, kind)) = entry(line) {
                    let id: u32 = index
                        .parse()
                        .map_err(|_| dump_error(format!("invalid token id `{index}`")))?;
                    tokens.insert(
                        id,
                        DumpToken {
                            kind: kind.to_string(),
                            keyslots: BTreeSet::new(),
                        },
                    );
                    current_token = Some(id);
                } else if let Some(value) = line.trim().strip_prefix("Keyslot:") {
                    let Some(id) = current_token else {
                        continue;
                    };
                    let slots = value
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|part| !part.is_empty())
                        .map(parse_slot)
                        .collect::<HwsealResult<Vec<u8>>>()?;
                    if let Some(token) = tokens.get_mut(&id) {
                        token.keyslots.extend(slots);
                    }
                }
            }
            Section::Preamble | Section::Other => {}
        }
    }

    Ok((active, tokens))
}

/// `  N: value` entry lines; attribute lines start with a tab and a word.
fn entry(line: &str) -> Option<(&str, &str)> {
    let (index, value) = line.trim().split_once(':')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((index, value.trim()))
}

fn parse_slot(value: &str) -> HwsealResult<u8> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| dump_error(format!("invalid keyslot number `{}`", value.trim())))
}

fn dump_error(reason: String) -> HwsealError {
    HwsealError::Parse {
        what: "luksDump output",
        reason,
    }
}
