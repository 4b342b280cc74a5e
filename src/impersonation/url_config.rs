//! `url_config` impersonation (spec §4.8): tells the device where the
//! virtual cloud's HTTP and MQTT endpoints live. Grounded on the original
//! `cores/server/dns.py` `on_url_config`/`on_url_config_old` handlers.

use std::net::Ipv4Addr;

use serde_json::json;

use crate::event_bus::{Event, EventBus};
use crate::http::request::{Request, Response};
use crate::http::router::RouteBuilder;
use crate::http::router::Router;

/// Emitted on every `url_config` request, regardless of host/path variant.
#[derive(Debug, Clone)]
pub struct UrlConfigEvent {
    pub peer: Option<std::net::SocketAddr>,
}

impl Event for UrlConfigEvent {}

pub fn register(router: &Router, events: EventBus, virtual_addr: Ipv4Addr) -> anyhow::Result<()> {
    for method in ["GET", "POST"] {
        let events = events.clone();
        router.register(
            RouteBuilder::new("url_config", method, r"^/v[12]/url_config$")
                .host(r"^h\d+\.iot-dns\.com$")
                .build(move |req: Request| {
                    let events = events.clone();
                    async move {
                        events.publish(UrlConfigEvent { peer: req.peer_addr });
                        current_response(virtual_addr)
                    }
                })?,
        );
    }

    router.register(
        RouteBuilder::new("url_config_legacy", "POST", r"^/device/url_config$")
            .build(move |req: Request| {
                let events = events.clone();
                async move {
                    events.publish(UrlConfigEvent { peer: req.peer_addr });
                    legacy_response(virtual_addr)
                }
            })?,
    );
    Ok(())
}

fn current_response(virtual_addr: Ipv4Addr) -> Response {
    Response::json(json!({
        "caArr": [],
        "httpUrl": {
            "addr": format!("http://{virtual_addr}/d.json"),
            "ips": [virtual_addr.to_string()],
        },
        "httpsPSKUrl": {
            "addr": "",
            "ips": [],
        },
        "mqttUrl": {
            "addr": format!("{virtual_addr}:1883"),
            "ips": [virtual_addr.to_string()],
        },
        "ttl": 600,
    }))
}

fn legacy_response(virtual_addr: Ipv4Addr) -> Response {
    Response::json(json!({
        "caArr": [],
        "httpUrl": format!("http://{virtual_addr}/d.json"),
        "mqttUrl": format!("{virtual_addr}:1883"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    #[tokio::test]
    async fn url_config_advertises_virtual_cloud_endpoints() {
        let virtual_addr: Ipv4Addr = "10.42.42.1".parse().unwrap();
        let router = Router::new();
        let events = EventBus::new();
        register(&router, events, virtual_addr).unwrap();

        let req = Request::builder("POST", "/v2/url_config")
            .host("h2.iot-dns.com")
            .build();
        let response = router.dispatch(req).await;
        let Response::Json(value) = response else {
            panic!("expected json response, got {response:?}");
        };
        assert_eq!(value["httpUrl"]["addr"], "http://10.42.42.1/d.json");
        assert_eq!(value["mqttUrl"]["addr"], "10.42.42.1:1883");
        assert_eq!(value["ttl"], 600);
    }

    #[tokio::test]
    async fn legacy_device_url_config_uses_flat_shape() {
        let virtual_addr: Ipv4Addr = "10.42.42.1".parse().unwrap();
        let router = Router::new();
        let events = EventBus::new();
        register(&router, events, virtual_addr).unwrap();

        let req = Request::builder("POST", "/device/url_config").build();
        let response = router.dispatch(req).await;
        let Response::Json(value) = response else {
            panic!("expected json response, got {response:?}");
        };
        assert_eq!(value["httpUrl"], "http://10.42.42.1/d.json");
    }
}
