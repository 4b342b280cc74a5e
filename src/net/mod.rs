//! Host-OS network collaborator contracts (§6): interface enumeration, IP
//! assignment and Wi-Fi station/access-point control. The platform-specific
//! implementations themselves are out of scope — only the traits the
//! provisioning client and orchestrator depend on live here, plus a
//! deterministic fake used by tests.

pub mod fake;

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

/// An IPv4 address/netmask/gateway triple, immutable once constructed
/// (§3 `Ip4Config`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip4Config {
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
}

impl Ip4Config {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            address,
            netmask,
            gateway,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// The network address derived from `address & netmask`.
    pub fn network(&self) -> Ipv4Addr {
        let addr = u32::from(self.address);
        let mask = u32::from(self.netmask);
        Ipv4Addr::from(addr & mask)
    }

    /// The broadcast address of this network (`network | !netmask`).
    pub fn broadcast(&self) -> Ipv4Addr {
        let network = u32::from(self.network());
        let mask = u32::from(self.netmask);
        Ipv4Addr::from(network | !mask)
    }

    /// The first host address of the network (`network + 1`).
    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) + 1)
    }
}

/// A Wi-Fi network observed by a scan or held as a station's current
/// association (§3 `WifiNetwork`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    pub password: Option<String>,
    pub auth: Option<String>,
    pub cipher: Option<String>,
    pub rssi: Option<i32>,
    pub ad_hoc: bool,
}

impl WifiNetwork {
    pub fn open(ssid: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: None,
            auth: None,
            cipher: None,
            rssi: None,
            ad_hoc: false,
        }
    }

    /// `protected = auth is set ∨ cipher is set`.
    pub fn protected(&self) -> bool {
        self.auth.is_some() || self.cipher.is_some()
    }
}

/// Host-OS network-interface enumeration and IP assignment (§6
/// `NetworkAdapter`).
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn get_ip4config(&self, iface: &str) -> anyhow::Result<Vec<Ip4Config>>;
    async fn set_ip4config(&self, iface: &str, config: Option<Ip4Config>) -> anyhow::Result<()>;
    async fn ping(&self, address: Ipv4Addr) -> anyhow::Result<Option<Duration>>;
}

/// Host-OS Wi-Fi station/access-point control (§6 `WifiAdapter`).
#[async_trait]
pub trait WifiAdapter: Send + Sync {
    async fn scan_networks(&self, iface: &str) -> anyhow::Result<Vec<WifiNetwork>>;
    async fn start_station(&self, iface: &str, net: &WifiNetwork) -> anyhow::Result<()>;
    async fn stop_station(&self, iface: &str) -> anyhow::Result<()>;
    async fn get_station_state(&self, iface: &str) -> anyhow::Result<Option<WifiNetwork>>;
    async fn start_access_point(&self, iface: &str, net: &WifiNetwork) -> anyhow::Result<()>;
    async fn stop_access_point(&self, iface: &str) -> anyhow::Result<()>;
}

/// Per-OS user-credential key-store access for the hosted-network secret
/// (§6 `HostSecretStore`); used only to bring the AP up on platforms that
/// require the secret to be registered with the OS first.
pub trait HostSecretStore: Send + Sync {
    fn read_hosted_network_secret(&self) -> anyhow::Result<Option<(String, String)>>;
    fn write_hosted_network_secret(&self, ssid: &str, password: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_first_host_derive_from_address_and_netmask() {
        let config = Ip4Config::new(
            "10.42.42.1".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            None,
        );
        assert_eq!(config.network(), "10.42.42.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.first(), "10.42.42.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            config.broadcast(),
            "10.42.42.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn protected_is_true_when_auth_or_cipher_set() {
        let open = WifiNetwork::open("device-AB12");
        assert!(!open.protected());
        let mut secured = open.clone();
        secured.auth = Some("WPA2".to_string());
        assert!(secured.protected());
    }
}
