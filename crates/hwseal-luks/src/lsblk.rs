//! Encrypted mapping discovery from `lsblk --raw` output.

use hwseal_provider::BlockDevice;
use std::collections::HashSet;
use std::path::Path;

pub(crate) const LSBLK_ARGS: &[&str] = &[
    "--raw",
    "--noheadings",
    "--paths",
    "--output",
    "NAME,TYPE,PKNAME",
];

const CRYPT_TYPE: &str = "crypt";

/// Parse `NAME TYPE PKNAME` rows, keeping active `crypt` mappings in order.
pub(crate) fn parse_crypt_mappings(output: &str) -> Vec<BlockDevice> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for line in output.lines() {
        let mut columns = line.split_whitespace();
        let (Some(name), Some(kind)) = (columns.next(), columns.next()) else {
            continue;
        };
        if kind != CRYPT_TYPE {
            continue;
        }

        let mapping = unescape(name);
        let device = match columns.next() {
            Some(parent) => unescape(parent),
            None => device_from_mapping(&mapping),
        };

        if seen.insert(device.clone()) {
            devices.push(BlockDevice { mapping, device });
        }
    }

    devices
}

/// Best guess at the container behind a mapping when lsblk has no parent.
///
/// `luks-<uuid>` names (systemd-cryptsetup) resolve through
/// `/dev/disk/by-uuid`; anything else is taken as a `/dev` node name.
fn device_from_mapping(mapping: &str) -> String {
    let name = Path::new(mapping)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| mapping.to_string());

    match name.strip_prefix("luks-") {
        Some(uuid) if looks_like_uuid(uuid) => format!("/dev/disk/by-uuid/{uuid}"),
        _ => format!("/dev/{name}"),
    }
}

fn looks_like_uuid(value: &str) -> bool {
    value.len() == 36
        && value.chars().enumerate().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// `lsblk --raw` escapes unsafe bytes as `\xHH`.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(byte) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
