pub mod apcfg;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dhcp;
pub mod dns;
pub mod event_bus;
pub mod http;
pub mod impersonation;
pub mod metrics;
pub mod mqtt;
pub mod net;
pub mod orchestrator;
pub mod provisioning;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Command, ProvisionArgs, ServeArgs};
use crate::event_bus::EventBus;
use crate::net::fake::{FakeHostSecretStore, FakeNetworkAdapter, FakeWifiAdapter};
use crate::net::{HostSecretStore, NetworkAdapter, WifiAdapter};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::provisioning::ProvisioningClient;

/// Runs `cloudcutter-rs` with the parsed CLI configuration.
///
/// This function initializes logging, sets up graceful shutdown handling,
/// and dispatches to either the impersonation server (`Command::Serve`) or
/// the provisioning datagram client (`Command::Provision`).
///
/// # Errors
///
/// Returns an error if the device roster fails to parse, if any listener
/// fails to bind, or if a component reports a fatal transport error.
///
/// # Panics
///
/// Panics if the Ctrl+C signal handler fails to register.
pub async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    let cancel_token = CancellationToken::new();
    let ctrl_c_cancel = cancel_token.clone();
    let ctrl_c_listener = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C signal");
        info!("Ctrl+C received, proceeding with graceful shutdown...");
        ctrl_c_cancel.cancel();
    });

    match cli.command {
        Command::Serve(args) => run_serve(args, cancel_token.clone()).await?,
        Command::Provision(args) => run_provision(args, cancel_token.clone()).await?,
    }

    ctrl_c_listener.abort();
    info!("all services shut down gracefully");
    Ok(())
}

/// Host-OS network/Wi-Fi control is an out-of-scope external collaborator
/// (spec §1); this wires the deterministic fakes the rest of the crate is
/// tested against. A real deployment supplies its own `NetworkAdapter` /
/// `WifiAdapter` behind this same seam.
fn platform_adapters() -> (
    Arc<dyn NetworkAdapter>,
    Arc<dyn WifiAdapter>,
    Arc<dyn HostSecretStore>,
) {
    (
        Arc::new(FakeNetworkAdapter::new()),
        Arc::new(FakeWifiAdapter::new()),
        Arc::new(FakeHostSecretStore::new()),
    )
}

async fn run_serve(args: ServeArgs, cancel: CancellationToken) -> Result<()> {
    let registry = Arc::new(config::load_device_roster(&args.devices_file)?);
    let events = EventBus::new();
    let (network_adapter, wifi_adapter, host_secret_store) = platform_adapters();

    let orchestrator_config = OrchestratorConfig {
        interface: args.interface,
        virtual_addr: args.virtual_addr,
        netmask: args.netmask,
        dhcp_range: (args.dhcp_range_start, args.dhcp_range_end),
        dns_upstream: args.dns_upstream,
        schema_dir: args.schema_dir,
    };

    let orchestrator = Orchestrator::new(
        orchestrator_config,
        registry,
        events,
        network_adapter,
        wifi_adapter,
        host_secret_store,
    );
    orchestrator.start().await?;

    let metrics_listener = TcpListener::bind(&args.metrics_listen_addr).await?;
    info!(addr = %metrics_listener.local_addr()?, "metrics listening");
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = async move { metrics_cancel.cancelled().await };
        if let Err(err) = axum::serve(metrics_listener, crate::metrics::metrics_router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    cancel.cancelled().await;
    orchestrator.stop().await?;
    Ok(())
}

async fn run_provision(args: ProvisionArgs, cancel: CancellationToken) -> Result<()> {
    let events = EventBus::new();
    let (network_adapter, wifi_adapter, _host_secret_store) = platform_adapters();

    let datagram = if args.benign {
        let payload = apcfg::payload::benign_payload(&args.ssid, Some(&args.passwd), None);
        apcfg::ApCfgFrame::new(1, apcfg::FRAME_TYPE_CONFIG, payload).encode()
    } else {
        apcfg::payload::build_exploit_frame(
            &args.exploit_profile(),
            1,
            &args.ap_ssid,
            &args.auzkey,
            &args.uuid,
            &args.psk_key,
        )
    };

    let client = ProvisioningClient::new(args.interface, network_adapter, wifi_adapter, events);
    client.run(datagram, cancel).await
}
