//! Live hardware lookups backing [`HardwareSource`] on a real host.
//!
//! Serial: DMI sysfs first, then `dmidecode`. Gateway MAC: `ip route` for the
//! default gateway, `ip neigh` for its link-layer address, with one `ping`
//! to populate the neighbour table when the entry is missing.

use crate::config::{HwsealConfig, KNOWN_DMIDECODE_PATHS, KNOWN_IP_PATHS, KNOWN_PING_PATHS};
use crate::error::{HwsealError, HwsealResult};
use crate::fingerprint::HardwareSource;
use crate::process::{resolve_binary, ProcessRunner};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

const DMI_BOARD_SERIAL: &str = "/sys/class/dmi/id/board_serial";

#[derive(Debug, Clone)]
pub struct HostHardwareSource {
    ip_path: Option<String>,
    ping_path: Option<String>,
    dmidecode_path: Option<String>,
    dmi_serial_path: PathBuf,
    timeout: Duration,
}

impl HostHardwareSource {
    pub fn from_config(config: &HwsealConfig) -> Self {
        Self {
            ip_path: config.tools.ip_path.clone(),
            ping_path: config.tools.ping_path.clone(),
            dmidecode_path: config.tools.dmidecode_path.clone(),
            dmi_serial_path: PathBuf::from(DMI_BOARD_SERIAL),
            timeout: config.command_timeout(),
        }
    }

    fn runner(
        &self,
        name: &str,
        configured: Option<&str>,
        known: &[&str],
    ) -> HwsealResult<ProcessRunner> {
        let binary = resolve_binary(name, configured, known)?;
        Ok(ProcessRunner::new(binary, self.timeout))
    }

    fn serial_from_dmidecode(&self) -> HwsealResult<Option<String>> {
        let runner = self.runner(
            "dmidecode",
            self.dmidecode_path.as_deref(),
            KNOWN_DMIDECODE_PATHS,
        )?;
        let out = runner.run(&["-s", "baseboard-serial-number"], None)?;
        if !out.success() {
            return Err(HwsealError::Provider(format!(
                "dmidecode exited with code {}: {}",
                out.status,
                out.diagnostic()
            )));
        }
        Ok(parse_dmidecode_value(&out.stdout))
    }

    fn neighbour_mac(
        &self,
        ip: &ProcessRunner,
        gateway: &str,
        dev: &str,
    ) -> HwsealResult<Option<String>> {
        let out = ip.run(&["neigh", "show", gateway, "dev", dev], None)?;
        if !out.success() {
            return Err(HwsealError::Provider(format!(
                "ip neigh exited with code {}: {}",
                out.status,
                out.diagnostic()
            )));
        }
        Ok(parse_neighbour_mac(&out.stdout))
    }

    fn probe_gateway(&self, gateway: &str) {
        let runner = match self.runner("ping", self.ping_path.as_deref(), KNOWN_PING_PATHS) {
            Ok(runner) => runner,
            Err(err) => {
                warn!("cannot probe gateway {gateway}: {err}");
                return;
            }
        };
        match runner.run(&["-c", "1", "-W", "1", gateway], None) {
            Ok(out) if !out.success() => debug!("gateway probe exited with {}", out.status),
            Ok(_) => {}
            Err(err) => warn!("gateway probe failed: {err}"),
        }
    }
}

impl HardwareSource for HostHardwareSource {
    fn motherboard_serial(&self) -> HwsealResult<Option<String>> {
        match fs::read_to_string(&self.dmi_serial_path) {
            Ok(contents) => {
                let value = contents.trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
                debug!("{} is empty; asking dmidecode", self.dmi_serial_path.display());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} not present", self.dmi_serial_path.display());
            }
            Err(err) => {
                debug!("unable to read {}: {err}", self.dmi_serial_path.display());
            }
        }

        self.serial_from_dmidecode()
    }

    fn gateway_mac(&self) -> HwsealResult<Option<String>> {
        let ip = self.runner("ip", self.ip_path.as_deref(), KNOWN_IP_PATHS)?;
        let out = ip.run(&["route", "show", "default"], None)?;
        if !out.success() {
            return Err(HwsealError::Provider(format!(
                "ip route exited with code {}: {}",
                out.status,
                out.diagnostic()
            )));
        }

        let Some(route) = parse_default_route(&out.stdout) else {
            return Ok(None);
        };
        debug!("default gateway {} via {}", route.gateway, route.dev);

        if let Some(mac) = self.neighbour_mac(&ip, &route.gateway, &route.dev)? {
            return Ok(Some(mac));
        }

        self.probe_gateway(&route.gateway);
        self.neighbour_mac(&ip, &route.gateway, &route.dev)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DefaultRoute {
    pub(crate) gateway: String,
    pub(crate) dev: String,
}

/// First `default via <gw> dev <if>` line of `ip route show default`.
pub(crate) fn parse_default_route(payload: &str) -> Option<DefaultRoute> {
    payload.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "default" {
            return None;
        }
        let mut gateway = None;
        let mut dev = None;
        while let Some(token) = tokens.next() {
            match token {
                "via" => gateway = tokens.next(),
                "dev" => dev = tokens.next(),
                _ => {}
            }
        }
        Some(DefaultRoute {
            gateway: gateway?.to_string(),
            dev: dev?.to_string(),
        })
    })
}

/// `lladdr` field of an `ip neigh show` entry, lowercased.
pub(crate) fn parse_neighbour_mac(payload: &str) -> Option<String> {
    payload.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "lladdr" {
                return tokens
                    .next()
                    .map(str::to_ascii_lowercase)
                    .filter(|mac| !mac.is_empty());
            }
        }
        None
    })
}

fn parse_dmidecode_value(payload: &str) -> Option<String> {
    payload
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_extracts_gateway_and_device() {
        let payload = "default via 192.168.1.1 dev br0 proto dhcp src 192.168.1.20 metric 205\n";
        assert_eq!(
            parse_default_route(payload),
            Some(DefaultRoute {
                gateway: "192.168.1.1".into(),
                dev: "br0".into(),
            })
        );
    }

    #[test]
    fn default_route_without_gateway_is_none() {
        assert_eq!(parse_default_route("default dev ppp0 scope link\n"), None);
        assert_eq!(parse_default_route(""), None);
        assert_eq!(
            parse_default_route("10.0.0.0/24 dev eth0 proto kernel scope link\n"),
            None
        );
    }

    #[test]
    fn neighbour_mac_is_lowercased() {
        let payload = "192.168.1.1 lladdr AA:BB:CC:00:11:22 REACHABLE\n";
        assert_eq!(
            parse_neighbour_mac(payload).as_deref(),
            Some("aa:bb:cc:00:11:22")
        );
    }

    #[test]
    fn incomplete_neighbour_has_no_mac() {
        assert_eq!(parse_neighbour_mac("192.168.1.1 INCOMPLETE\n"), None);
        assert_eq!(parse_neighbour_mac(""), None);
    }

    #[test]
    fn dmidecode_comments_are_skipped() {
        let payload = "# SMBIOS entry point at 0x000f0000\n190436123400123\n";
        assert_eq!(
            parse_dmidecode_value(payload).as_deref(),
            Some("190436123400123")
        );
        assert_eq!(parse_dmidecode_value("\n"), None);
    }
}
