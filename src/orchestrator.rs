//! Orchestrator (spec §4.10): brings every impersonation subsystem up in
//! order behind one virtual-cloud IP, and tears them down in reverse.
//! Grounded on the teacher's `run()` (component wiring + `CancellationToken`
//! shutdown pattern), generalized from "firmware relay + metrics server" to
//! "DHCP + DNS + HTTP + MQTT + impersonation handlers".

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::device::DeviceRegistry;
use crate::dhcp::{DhcpLeaseEvent, DhcpServer};
use crate::dns::{DnsQueryEvent, DnsRecord, DnsServer};
use crate::event_bus::EventBus;
use crate::http::tls::{register_psk_resolvers, TlsConfig};
use crate::http::HttpServer;
use crate::impersonation;
use crate::impersonation::ota::{OtaEvent, OtaTracker};
use crate::metrics::record_event;
use crate::mqtt::MqttBroker;
use crate::net::{HostSecretStore, Ip4Config, NetworkAdapter, WifiAdapter, WifiNetwork};

const AP_SSID: &str = "cloudcutterflash";
const AP_PASSWORD: &str = "abcdabcd";
const PSK_HINT_PREFIX: &str = "1dHRsc2NjbHltbGx3eWh5";
const TUYA_REGIONS: [&str; 4] = ["us", "eu", "cn", "in"];
const TUYA_SUBDOMAINS: [&str; 8] = ["a", "a1", "a2", "a3", "m", "m1", "m2", "baal"];

/// Process-level knobs the Orchestrator needs (§4.10, SPEC_FULL.md
/// Configuration); parsed from `Cli`/`AppConfig` by the caller.
pub struct OrchestratorConfig {
    pub interface: String,
    pub virtual_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp_range: (Ipv4Addr, Ipv4Addr),
    pub dns_upstream: Option<Ipv4Addr>,
    pub schema_dir: PathBuf,
}

/// Owns every long-lived component and the single `CancellationToken` that
/// tears them all down together.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    network_adapter: Arc<dyn NetworkAdapter>,
    wifi_adapter: Arc<dyn WifiAdapter>,
    host_secret_store: Arc<dyn HostSecretStore>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<DeviceRegistry>,
        events: EventBus,
        network_adapter: Arc<dyn NetworkAdapter>,
        wifi_adapter: Arc<dyn WifiAdapter>,
        host_secret_store: Arc<dyn HostSecretStore>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            network_adapter,
            wifi_adapter,
            host_secret_store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Brings every subsystem up in the order spec §4.10 fixes, then
    /// returns: long-lived accept loops run as spawned tasks tracked by
    /// `self.cancel`, not awaited here.
    pub async fn start(&self) -> anyhow::Result<()> {
        let ip4config = Ip4Config::new(self.config.virtual_addr, self.config.netmask, None);

        let ap_network = WifiNetwork {
            ssid: AP_SSID.to_string(),
            password: Some(AP_PASSWORD.to_string()),
            auth: Some("WPA2".to_string()),
            cipher: Some("CCMP".to_string()),
            rssi: None,
            ad_hoc: false,
        };
        self.host_secret_store
            .write_hosted_network_secret(AP_SSID, AP_PASSWORD)?;
        self.wifi_adapter
            .start_access_point(&self.config.interface, &ap_network)
            .await?;
        info!(ssid = AP_SSID, "access point started");

        let already_assigned = self
            .network_adapter
            .get_ip4config(&self.config.interface)
            .await?
            .iter()
            .any(|c| c.address() == self.config.virtual_addr);
        if !already_assigned {
            self.network_adapter
                .set_ip4config(&self.config.interface, Some(ip4config))
                .await?;
        }
        info!(addr = %self.config.virtual_addr, "virtual-cloud address assigned");

        let dhcp = Arc::new(DhcpServer::new(
            ip4config,
            self.config.dhcp_range,
            Some(self.config.virtual_addr),
            self.events.clone(),
        ));
        let dhcp_cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = dhcp.run(dhcp_cancel).await {
                tracing::error!(error = %err, "DHCP server exited");
            }
        });
        info!("DHCP server started");
        spawn_event_counter::<DhcpLeaseEvent>(self.events.clone(), self.cancel.clone(), "dhcp_lease");

        let dns = Arc::new(DnsServer::new(
            self.config.virtual_addr,
            self.config.dns_upstream,
            self.events.clone(),
        ));
        install_dns_records(&dns, self.config.virtual_addr)?;
        let dns_cancel = self.cancel.clone();
        let dns_for_task = Arc::clone(&dns);
        tokio::spawn(async move {
            if let Err(err) = dns_for_task.run(dns_cancel).await {
                tracing::error!(error = %err, "DNS server exited");
            }
        });
        info!("DNS server started");
        spawn_event_counter::<DnsQueryEvent>(self.events.clone(), self.cancel.clone(), "dns_query");
        spawn_ota_event_counter(self.events.clone(), self.cancel.clone());

        let mut tls_config = TlsConfig::new();
        tls_config.psk_hint = Some(format!("{PSK_HINT_PREFIX}{}", "0".repeat(16)));
        register_psk_resolvers(&mut tls_config, Arc::clone(&self.registry));

        let http = HttpServer::new(
            format!("{}:80", self.config.virtual_addr).parse()?,
            format!("{}:443", self.config.virtual_addr).parse()?,
            tls_config,
            self.events.clone(),
        );

        let mqtt = Arc::new(MqttBroker::new(self.config.virtual_addr, self.events.clone()));
        register_device_log_ingestion(&mqtt, self.events.clone());

        let ota_tracker = Arc::new(OtaTracker::new());
        impersonation::register_all(
            &http.router,
            Arc::clone(&self.registry),
            self.events.clone(),
            Arc::clone(&mqtt),
            ota_tracker,
            self.config.schema_dir.clone(),
            self.config.virtual_addr,
        )?;

        http.start(self.cancel.clone()).await?;
        info!("HTTP/HTTPS servers started");

        let mqtt_cancel = self.cancel.clone();
        let mqtt_for_task = Arc::clone(&mqtt);
        tokio::spawn(async move {
            if let Err(err) = mqtt_for_task.start(mqtt_cancel).await {
                tracing::error!(error = %err, "MQTT broker exited");
            }
        });
        info!("MQTT broker started");

        Ok(())
    }

    /// Tears down in reverse order: cancels every component's shared
    /// token, then brings the access point back down.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.wifi_adapter.stop_access_point(&self.config.interface).await?;
        info!("orchestrator stopped");
        Ok(())
    }
}

/// Drives the three ambient `cloudcutter_events_total` counters from Event
/// Bus subscriptions rather than from inside each component, so a DHCP
/// lease, a DNS query and an OTA milestone are all counted the same way.
fn spawn_event_counter<T>(events: EventBus, cancel: CancellationToken, kind: &'static str)
where
    T: crate::event_bus::Event + Clone + 'static,
{
    let mut subscription = events.subscribe::<T>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = subscription.recv() => {
                    if event.is_none() {
                        return;
                    }
                    record_event(kind);
                }
            }
        }
    });
}

fn spawn_ota_event_counter(events: EventBus, cancel: CancellationToken) {
    let mut subscription = events.subscribe::<OtaEvent>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = subscription.recv() => {
                    let Some(event) = event else { return };
                    let kind = match event {
                        OtaEvent::Triggered { .. } => "ota_triggered",
                        OtaEvent::Skip { .. } => "ota_skip",
                        OtaEvent::Info { .. } => "ota_info",
                        OtaEvent::StatusUpdate { .. } => "ota_status_update",
                        OtaEvent::Progress { .. } => "ota_progress",
                        OtaEvent::Downloaded { .. } => "ota_downloaded",
                    };
                    record_event(kind);
                }
            }
        }
    });
}

/// Wires `log/+/+` so device log lines re-surface as `DeviceLogEvent`
/// broadcasts (SPEC_FULL.md supplement, grounded on `cores/server/mqtt.py`).
fn register_device_log_ingestion(mqtt: &MqttBroker, events: EventBus) {
    mqtt.on_topic("log/+/+", move |topic: String, payload: Vec<u8>| {
        let events = events.clone();
        Box::pin(async move {
            let uuid = topic.split('/').nth(1).unwrap_or_default().to_string();
            match String::from_utf8(payload) {
                Ok(message) => events.publish(crate::mqtt::DeviceLogEvent { uuid, message }),
                Err(_) => tracing::warn!(uuid, "dropping non-UTF-8 device log payload"),
            }
        })
    });
}

fn install_dns_records(dns: &DnsServer, virtual_addr: Ipv4Addr) -> anyhow::Result<()> {
    dns.add_record(DnsRecord::handler(
        r"^h\d+\.iot-dns\.com$",
        "^A$",
        move |_name, _qtype| vec![virtual_addr],
    )?);
    dns.add_record(DnsRecord::static_a("^fakedns\\.com$", vec![virtual_addr])?);
    dns.add_record(DnsRecord::static_a("^cloudcutter\\.io$", vec![virtual_addr])?);

    for region in TUYA_REGIONS {
        for sub in TUYA_SUBDOMAINS {
            let host = format!("{sub}.tuya{region}.com");
            let pattern = format!("^{}$", regex::escape(&host));
            dns.add_record(DnsRecord::static_a(&pattern, vec![virtual_addr])?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_record_install_covers_expected_hostname_count() {
        let events = EventBus::new();
        let dns = DnsServer::new("10.42.42.1".parse().unwrap(), None, events);
        install_dns_records(&dns, "10.42.42.1".parse().unwrap()).unwrap();
        // 3 fixed patterns + 4 regions * 8 subdomains
        // (asserted indirectly: installing twice must not error, i.e. regexes are valid)
        install_dns_records(&dns, "10.42.42.1".parse().unwrap()).unwrap();
    }
}
