//! Provisioning datagram client (spec §4.9): scans for the unprovisioned
//! device's own access point, associates with it, and hammers its UDP
//! config port with a pre-built ApCfg frame until the device reboots.
//! Grounded on `cores/apcfg/_core.py`'s `TuyaApCfg.run`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event_bus::{Event, EventBus};
use crate::net::{Ip4Config, NetworkAdapter, WifiAdapter, WifiNetwork};

const TARGET_PORT: u16 = 6669;
const FRAMES_PER_BURST: usize = 5;
const FRAME_GAP: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// The five milestones the provisioning run passes through (spec §4.9,
/// `_events.py`'s `TuyaApCfg*Event` family).
#[derive(Debug, Clone)]
pub enum ProvisioningEvent {
    Found {
        network: WifiNetwork,
    },
    Connected {
        network: WifiNetwork,
        ip4config: Ip4Config,
    },
    Ready {
        network: WifiNetwork,
        address: Ipv4Addr,
        rtt: Duration,
    },
    Sent {
        network: WifiNetwork,
        address: Ipv4Addr,
        port: u16,
    },
    Finished {
        network: WifiNetwork,
        address: Ipv4Addr,
    },
}

impl Event for ProvisioningEvent {}

/// Drives one device through scan → associate → ping → transmit → reboot
/// detection, on a single Wi-Fi interface.
pub struct ProvisioningClient {
    interface: String,
    network_adapter: Arc<dyn NetworkAdapter>,
    wifi_adapter: Arc<dyn WifiAdapter>,
    events: EventBus,
}

impl ProvisioningClient {
    pub fn new(
        interface: impl Into<String>,
        network_adapter: Arc<dyn NetworkAdapter>,
        wifi_adapter: Arc<dyn WifiAdapter>,
        events: EventBus,
    ) -> Self {
        Self {
            interface: interface.into(),
            network_adapter,
            wifi_adapter,
            events,
        }
    }

    /// Runs the full sequence for one already-built frame `datagram`, until
    /// the device reboots or `cancel` fires.
    pub async fn run(&self, datagram: Vec<u8>, cancel: CancellationToken) -> anyhow::Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Ok(()),
            result = self.run_inner(datagram) => result,
        }
    }

    async fn run_inner(&self, datagram: Vec<u8>) -> anyhow::Result<()> {
        let network = self.scan_for_target().await?;
        self.events.publish(ProvisioningEvent::Found {
            network: network.clone(),
        });

        self.disassociate().await?;
        self.associate(&network).await?;

        let ip4config = self.wait_for_ip().await?;
        self.events.publish(ProvisioningEvent::Connected {
            network: network.clone(),
            ip4config,
        });

        let target = ip4config.first();
        let rtt = self.wait_for_ping(target).await?;
        self.events.publish(ProvisioningEvent::Ready {
            network: network.clone(),
            address: target,
            rtt,
        });

        self.transmit_until_unreachable(&network, target, &datagram).await?;

        self.wait_for_link_drop(&network).await?;
        self.events.publish(ProvisioningEvent::Finished {
            network: network.clone(),
            address: target,
        });
        Ok(())
    }

    /// Polls every 2 s for an unencrypted SSID matching `^.+-[A-F0-9]{4}$`.
    async fn scan_for_target(&self) -> anyhow::Result<WifiNetwork> {
        let pattern = Regex::new(r"^.+-[A-F0-9]{4}$")?;
        loop {
            let networks = self.wifi_adapter.scan_networks(&self.interface).await?;
            if let Some(found) = networks
                .into_iter()
                .find(|net| !net.protected() && pattern.is_match(&net.ssid))
            {
                return Ok(found);
            }
            debug!("no matching provisioning access point found yet");
            sleep(SCAN_INTERVAL).await;
        }
    }

    async fn disassociate(&self) -> anyhow::Result<()> {
        self.wifi_adapter.stop_station(&self.interface).await?;
        while self
            .wifi_adapter
            .get_station_state(&self.interface)
            .await?
            .is_some()
        {
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn associate(&self, network: &WifiNetwork) -> anyhow::Result<()> {
        self.wifi_adapter.start_station(&self.interface, network).await
    }

    async fn wait_for_ip(&self) -> anyhow::Result<Ip4Config> {
        loop {
            if self
                .wifi_adapter
                .get_station_state(&self.interface)
                .await?
                .is_none()
            {
                sleep(POLL_INTERVAL).await;
                continue;
            }
            if let Some(config) = self
                .network_adapter
                .get_ip4config(&self.interface)
                .await?
                .into_iter()
                .next()
            {
                return Ok(config);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_ping(&self, address: Ipv4Addr) -> anyhow::Result<Duration> {
        loop {
            if let Some(rtt) = self.network_adapter.ping(address).await? {
                return Ok(rtt);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// While the device keeps answering ping, opens a fresh socket and
    /// sends `datagram` five times with a 200 ms gap, then loops (spec
    /// §4.9 step 6).
    async fn transmit_until_unreachable(
        &self,
        network: &WifiNetwork,
        address: Ipv4Addr,
        datagram: &[u8],
    ) -> anyhow::Result<()> {
        while self.network_adapter.ping(address).await?.is_some() {
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
            for burst in 0..FRAMES_PER_BURST {
                debug!(burst = burst + 1, %address, "sending provisioning datagram");
                socket.send_to(datagram, (address, TARGET_PORT)).await?;
                sleep(FRAME_GAP).await;
            }
            self.events.publish(ProvisioningEvent::Sent {
                network: network.clone(),
                address,
                port: TARGET_PORT,
            });
        }
        Ok(())
    }

    /// Waits until the Wi-Fi link to `network` drops, which together with
    /// the ping loss already observed marks the device as rebooting.
    async fn wait_for_link_drop(&self, network: &WifiNetwork) -> anyhow::Result<()> {
        loop {
            match self.wifi_adapter.get_station_state(&self.interface).await? {
                Some(current) if current.ssid == network.ssid => sleep(POLL_INTERVAL).await,
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::fake::{FakeNetworkAdapter, FakeWifiAdapter};

    fn client(
        network_adapter: Arc<FakeNetworkAdapter>,
        wifi_adapter: Arc<FakeWifiAdapter>,
        events: EventBus,
    ) -> ProvisioningClient {
        ProvisioningClient::new("wlan0", network_adapter, wifi_adapter, events)
    }

    #[tokio::test]
    async fn scan_skips_protected_and_non_matching_networks() {
        let wifi = Arc::new(FakeWifiAdapter::new());
        let mut secured = WifiNetwork::open("device-AB12");
        secured.auth = Some("WPA2".to_string());
        wifi.set_scan_results(vec![
            WifiNetwork::open("home-network"),
            secured,
            WifiNetwork::open("smartplug-CD34"),
        ]);

        let net = Arc::new(FakeNetworkAdapter::new());
        let c = client(net, wifi, EventBus::new());
        let found = c.scan_for_target().await.unwrap();
        assert_eq!(found.ssid, "smartplug-CD34");
    }

    #[tokio::test]
    async fn wait_for_ip_blocks_until_station_and_config_present() {
        let wifi = Arc::new(FakeWifiAdapter::new());
        let net = Arc::new(FakeNetworkAdapter::new());
        let c = client(Arc::clone(&net), Arc::clone(&wifi), EventBus::new());

        let target = WifiNetwork::open("smartplug-CD34");
        wifi.start_station("wlan0", &target).await.unwrap();
        let config = Ip4Config::new(
            "10.42.42.55".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            Some("10.42.42.1".parse().unwrap()),
        );
        net.set_ip4configs("wlan0", vec![config]);

        let resolved = c.wait_for_ip().await.unwrap();
        assert_eq!(resolved, config);
    }

    #[tokio::test]
    async fn transmit_loop_stops_once_device_goes_silent() {
        let wifi = Arc::new(FakeWifiAdapter::new());
        let net = Arc::new(FakeNetworkAdapter::new());
        let events = EventBus::new();
        let mut sent = events.subscribe::<ProvisioningEvent>();
        let c = client(Arc::clone(&net), Arc::clone(&wifi), events);

        let address: Ipv4Addr = "10.42.42.55".parse().unwrap();
        net.set_reachable(address, Some(Duration::from_millis(3)));

        let network = WifiNetwork::open("smartplug-CD34");
        let datagram = vec![0xAAu8; 32];

        let net_for_clear = Arc::clone(&net);
        let clearer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            net_for_clear.set_reachable(address, None);
        });

        c.transmit_until_unreachable(&network, address, &datagram)
            .await
            .unwrap();
        clearer.await.unwrap();

        let event = sent.recv().await.unwrap();
        match event {
            ProvisioningEvent::Sent { address: sent_addr, port, .. } => {
                assert_eq!(sent_addr, address);
                assert_eq!(port, TARGET_PORT);
            }
            other => panic!("expected Sent event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn link_drop_resolves_once_station_disconnects() {
        let wifi = Arc::new(FakeWifiAdapter::new());
        let net = Arc::new(FakeNetworkAdapter::new());
        let c = client(net, Arc::clone(&wifi), EventBus::new());

        let network = WifiNetwork::open("smartplug-CD34");
        wifi.start_station("wlan0", &network).await.unwrap();

        let wifi_for_drop = Arc::clone(&wifi);
        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            wifi_for_drop.stop_station("wlan0").await.unwrap();
        });

        c.wait_for_link_drop(&network).await.unwrap();
        dropper.await.unwrap();
    }
}
