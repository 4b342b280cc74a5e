//! End-to-end provisioning run (spec §8 scenario 6 family): scan, associate,
//! wait for IP/ping, transmit the classic exploit datagram over a real UDP
//! socket, then detect the reboot via link drop.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use cloudcutter_rs::apcfg::{payload::ExploitProfile, ApCfgFrame};
use cloudcutter_rs::event_bus::EventBus;
use cloudcutter_rs::net::fake::{FakeNetworkAdapter, FakeWifiAdapter};
use cloudcutter_rs::net::{Ip4Config, WifiAdapter, WifiNetwork};
use cloudcutter_rs::provisioning::{ProvisioningClient, ProvisioningEvent};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn full_provisioning_run_delivers_exploit_datagram_and_detects_reboot() {
    let wifi = Arc::new(FakeWifiAdapter::new());
    let net = Arc::new(FakeNetworkAdapter::new());
    let events = EventBus::new();
    let mut milestones = events.subscribe::<ProvisioningEvent>();

    wifi.set_scan_results(vec![WifiNetwork::open("smartplug-AB12")]);

    // A 127.0.0.0/8 config makes `first()` resolve to the loopback address,
    // so the transmit step can hit a real socket without root.
    let target: Ipv4Addr = "127.0.0.1".parse().unwrap();
    net.set_ip4configs(
        "wlan0",
        vec![Ip4Config::new(target, "255.0.0.0".parse().unwrap(), None)],
    );
    net.set_reachable(target, Some(Duration::from_millis(2)));

    let profile = ExploitProfile {
        address_finish: 0x0011_2233,
        ..Default::default()
    };
    let datagram = cloudcutter_rs::apcfg::payload::build_exploit_frame(
        &profile,
        1,
        &"u".repeat(12),
        &"k".repeat(16),
        &"u".repeat(12),
        &"p".repeat(32),
    );

    let client = ProvisioningClient::new("wlan0", net.clone(), wifi.clone(), events);
    let run_datagram = datagram.clone();
    let run_handle = tokio::spawn(async move {
        client.run(run_datagram, CancellationToken::new()).await
    });

    let receiver = UdpSocket::bind((target, 6669)).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _peer) = receiver.recv_from(&mut buf).await.unwrap();
    let received = &buf[..len];
    assert_eq!(received, datagram.as_slice());

    let frame = ApCfgFrame::decode(received).unwrap();
    assert_eq!(frame.frame_num, 1);

    // Device "goes dark": stop answering pings and drop the station link,
    // which the run loop reads as a reboot in progress.
    net.set_reachable(target, None);
    wifi.stop_station("wlan0").await.unwrap();

    run_handle.await.unwrap().unwrap();

    let mut seen = Vec::new();
    while let Some(event) = milestones.recv().await {
        let is_last = matches!(event, ProvisioningEvent::Finished { .. });
        seen.push(event);
        if is_last {
            break;
        }
    }
    assert!(matches!(seen[0], ProvisioningEvent::Found { .. }));
    assert!(matches!(seen[1], ProvisioningEvent::Connected { .. }));
    assert!(matches!(seen[2], ProvisioningEvent::Ready { .. }));
    assert!(matches!(seen[3], ProvisioningEvent::Sent { .. }));
    assert!(matches!(seen[4], ProvisioningEvent::Finished { .. }));
}
