//! CLI surface and process configuration (spec §6, SPEC_FULL.md
//! Configuration): a `clap::Parser` for process-level knobs, in the
//! teacher's `Cli` idiom, plus the device-roster file format this crate
//! needs that isn't itself in scope as a persistent-configuration system.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use crate::apcfg::payload::ExploitProfile;
use crate::device::{Device, DeviceRegistry};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(long, env, default_value = "info")]
    pub log_level: LevelFilter,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the impersonation server: DHCP + DNS + HTTP/HTTPS + MQTT behind
    /// one virtual-cloud IP (spec §4.10).
    Serve(ServeArgs),
    /// Runs the provisioning datagram client against a device still in its
    /// unconfigured access-point mode (spec §4.9).
    Provision(ProvisionArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Wi-Fi interface the virtual cloud's access point runs on.
    #[clap(long, env, default_value = "wlan0")]
    pub interface: String,

    /// Virtual-cloud IPv4 address.
    #[clap(long, env, default_value = "10.42.42.1")]
    pub virtual_addr: Ipv4Addr,

    #[clap(long, env, default_value = "255.255.255.0")]
    pub netmask: Ipv4Addr,

    #[clap(long, env, default_value = "10.42.42.10")]
    pub dhcp_range_start: Ipv4Addr,

    #[clap(long, env, default_value = "10.42.42.40")]
    pub dhcp_range_end: Ipv4Addr,

    /// Optional upstream DNS resolver for unmatched queries (spec §4.4).
    #[clap(long, env)]
    pub dns_upstream: Option<Ipv4Addr>,

    /// Directory of `<action>.json` schema-replay templates (spec §4.8).
    #[clap(long, env, default_value = "schema")]
    pub schema_dir: PathBuf,

    /// CSV device roster: `uuid,auth_key,psk,firmware_path?` per line.
    #[clap(long, env, default_value = "devices.csv")]
    pub devices_file: PathBuf,

    #[clap(long, env, default_value = "0.0.0.0:9090")]
    pub metrics_listen_addr: String,
}

#[derive(Parser, Debug)]
pub struct ProvisionArgs {
    #[clap(long, env, default_value = "wlan0")]
    pub interface: String,

    /// Provisions with the benign `{ssid,passwd,token}` payload instead of
    /// the classic memory-write exploit.
    #[clap(long, default_value_t = false)]
    pub benign: bool,

    /// SSID/passwd for the benign payload (ignored for the exploit).
    #[clap(long, default_value = "")]
    pub ssid: String,
    #[clap(long, default_value = "")]
    pub passwd: String,

    /// Exploit profile fields (spec §4.9, §8 scenario 6); ignored when
    /// `--benign` is set.
    #[clap(long, value_parser = parse_hex_u32)]
    pub address_finish: Option<u32>,
    #[clap(long, value_parser = parse_hex_u32)]
    pub address_ssid: Option<u32>,
    #[clap(long, value_parser = parse_hex_u32)]
    pub address_passwd: Option<u32>,
    #[clap(long, value_parser = parse_hex_u32)]
    pub address_datagram: Option<u32>,
    #[clap(long, default_value_t = 0)]
    pub address_ssid_padding: usize,

    /// Target AP's own SSID, `auzkey`, device UUID, and PSK key — required
    /// for the exploit payload, ignored for `--benign`.
    #[clap(long, default_value = "")]
    pub ap_ssid: String,
    #[clap(long, default_value = "")]
    pub auzkey: String,
    #[clap(long, default_value = "")]
    pub uuid: String,
    #[clap(long, default_value = "")]
    pub psk_key: String,
}

fn parse_hex_u32(val: &str) -> Result<u32, String> {
    let trimmed = val.strip_prefix("0x").unwrap_or(val);
    u32::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

impl ProvisionArgs {
    pub fn exploit_profile(&self) -> ExploitProfile {
        ExploitProfile {
            address_finish: self.address_finish.unwrap_or(0),
            address_ssid: self.address_ssid,
            address_passwd: self.address_passwd,
            address_datagram: self.address_datagram,
            address_ssid_padding: self.address_ssid_padding,
        }
    }
}

/// Loads the CSV device roster: `uuid,auth_key,psk,firmware_path?`, where
/// `auth_key` is exactly 32 ASCII bytes and `psk` is exactly 64 ASCII bytes
/// (spec §3 `Device`).
pub fn load_device_roster(path: &std::path::Path) -> Result<DeviceRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading device roster {}", path.display()))?;

    let mut registry = DeviceRegistry::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 {
            anyhow::bail!("devices file line {}: expected at least 3 fields", line_no + 1);
        }
        let uuid = fields[0].trim();
        let auth_key = parse_ascii_key::<32>(fields[1].trim(), line_no + 1, "auth_key")?;
        let psk = parse_ascii_key::<64>(fields[2].trim(), line_no + 1, "psk")?;

        let mut device = Device::new(uuid, auth_key, psk);
        if let Some(firmware_path) = fields.get(3).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            device = device.with_firmware(PathBuf::from(firmware_path));
        }
        registry.register(device);
    }
    Ok(registry)
}

fn parse_ascii_key<const N: usize>(text: &str, line_no: usize, field: &str) -> Result<[u8; N]> {
    if text.len() != N {
        anyhow::bail!(
            "devices file line {line_no}: {field} must be exactly {N} ASCII bytes, got {}",
            text.len()
        );
    }
    let mut out = [0u8; N];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}
