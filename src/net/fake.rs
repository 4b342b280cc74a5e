//! Deterministic fakes for the host-OS adapter traits (§9 Design Notes):
//! scripted scan results and explicit state transitions instead of a real
//! network stack, so the provisioning state machine can be driven
//! scan → connect → ip → disconnect without hardware.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{HostSecretStore, Ip4Config, NetworkAdapter, WifiAdapter, WifiNetwork};

#[derive(Default)]
struct NetworkState {
    configs: HashMap<String, Vec<Ip4Config>>,
    reachable: HashMap<Ipv4Addr, Duration>,
}

#[derive(Default)]
pub struct FakeNetworkAdapter {
    state: Mutex<NetworkState>,
}

impl FakeNetworkAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ip4configs(&self, iface: &str, configs: Vec<Ip4Config>) {
        self.state
            .lock()
            .configs
            .insert(iface.to_string(), configs);
    }

    pub fn set_reachable(&self, address: Ipv4Addr, rtt: Option<Duration>) {
        let mut state = self.state.lock();
        match rtt {
            Some(rtt) => {
                state.reachable.insert(address, rtt);
            }
            None => {
                state.reachable.remove(&address);
            }
        }
    }
}

#[async_trait]
impl NetworkAdapter for FakeNetworkAdapter {
    async fn get_ip4config(&self, iface: &str) -> anyhow::Result<Vec<Ip4Config>> {
        Ok(self.state.lock().configs.get(iface).cloned().unwrap_or_default())
    }

    async fn set_ip4config(&self, iface: &str, config: Option<Ip4Config>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        match config {
            Some(config) => {
                state.configs.insert(iface.to_string(), vec![config]);
            }
            None => {
                state.configs.remove(iface);
            }
        }
        Ok(())
    }

    async fn ping(&self, address: Ipv4Addr) -> anyhow::Result<Option<Duration>> {
        Ok(self.state.lock().reachable.get(&address).copied())
    }
}

#[derive(Default)]
struct WifiState {
    scan_results: Vec<WifiNetwork>,
    station: Option<WifiNetwork>,
    access_point: Option<WifiNetwork>,
}

#[derive(Default)]
pub struct FakeWifiAdapter {
    state: Mutex<WifiState>,
}

impl FakeWifiAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scan_results(&self, networks: Vec<WifiNetwork>) {
        self.state.lock().scan_results = networks;
    }

    pub fn access_point(&self) -> Option<WifiNetwork> {
        self.state.lock().access_point.clone()
    }
}

#[async_trait]
impl WifiAdapter for FakeWifiAdapter {
    async fn scan_networks(&self, _iface: &str) -> anyhow::Result<Vec<WifiNetwork>> {
        Ok(self.state.lock().scan_results.clone())
    }

    async fn start_station(&self, _iface: &str, net: &WifiNetwork) -> anyhow::Result<()> {
        self.state.lock().station = Some(net.clone());
        Ok(())
    }

    async fn stop_station(&self, _iface: &str) -> anyhow::Result<()> {
        self.state.lock().station = None;
        Ok(())
    }

    async fn get_station_state(&self, _iface: &str) -> anyhow::Result<Option<WifiNetwork>> {
        Ok(self.state.lock().station.clone())
    }

    async fn start_access_point(&self, _iface: &str, net: &WifiNetwork) -> anyhow::Result<()> {
        self.state.lock().access_point = Some(net.clone());
        Ok(())
    }

    async fn stop_access_point(&self, _iface: &str) -> anyhow::Result<()> {
        self.state.lock().access_point = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeHostSecretStore {
    secret: Mutex<Option<(String, String)>>,
}

impl FakeHostSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSecretStore for FakeHostSecretStore {
    fn read_hosted_network_secret(&self) -> anyhow::Result<Option<(String, String)>> {
        Ok(self.secret.lock().clone())
    }

    fn write_hosted_network_secret(&self, ssid: &str, password: &str) -> anyhow::Result<()> {
        *self.secret.lock() = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn station_state_reflects_start_and_stop() {
        let adapter = FakeWifiAdapter::new();
        let net = WifiNetwork::open("device-AB12");
        adapter.start_station("wlan0", &net).await.unwrap();
        assert_eq!(adapter.get_station_state("wlan0").await.unwrap(), Some(net));
        adapter.stop_station("wlan0").await.unwrap();
        assert_eq!(adapter.get_station_state("wlan0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ping_reports_none_until_scripted() {
        let adapter = FakeNetworkAdapter::new();
        let addr: Ipv4Addr = "10.42.42.1".parse().unwrap();
        assert_eq!(adapter.ping(addr).await.unwrap(), None);
        adapter.set_reachable(addr, Some(Duration::from_millis(5)));
        assert_eq!(adapter.ping(addr).await.unwrap(), Some(Duration::from_millis(5)));
    }
}
