//! Cross-handler HTTP precedence: `url_config`, activation and the default
//! schema-replay handler all share one `Router`, registered in the order
//! `impersonation::register_all` fixes, and only the first applicable route
//! wins for a given request (spec §4.8, §8 scenario 3/5 family).

use std::net::Ipv4Addr;
use std::sync::Arc;

use base64::Engine as _;
use cloudcutter_rs::crypto;
use cloudcutter_rs::device::{Device, DeviceRegistry};
use cloudcutter_rs::event_bus::EventBus;
use cloudcutter_rs::http::request::{Body, Request, Response};
use cloudcutter_rs::http::router::Router;
use cloudcutter_rs::impersonation::{self, activation::ActivationEvent, ota::OtaTracker, url_config::UrlConfigEvent};
use cloudcutter_rs::mqtt::MqttBroker;
use serde_json::json;

fn registry_with_one_device(uuid: &str) -> Arc<DeviceRegistry> {
    let device = Device::new(uuid, [b'K'; 32], [b'P'; 64]);
    let mut registry = DeviceRegistry::new();
    registry.register(device);
    Arc::new(registry)
}

#[tokio::test]
async fn url_config_wins_over_device_routes_on_its_own_host() {
    let virtual_addr: Ipv4Addr = "10.42.42.1".parse().unwrap();
    let uuid = "01234567890123456789012345678901";
    let registry = registry_with_one_device(uuid);
    let events = EventBus::new();
    let mut url_config_events = events.subscribe::<UrlConfigEvent>();

    let router = Router::new();
    let mqtt = Arc::new(MqttBroker::new(virtual_addr, events.clone()));
    let tracker = Arc::new(OtaTracker::new());
    let schema_dir = std::env::temp_dir().join(format!("cloudcutter-rs-stack-test-{}", std::process::id()));
    tokio::fs::create_dir_all(&schema_dir).await.unwrap();

    impersonation::register_all(
        &router,
        Arc::clone(&registry),
        events.clone(),
        mqtt,
        tracker,
        schema_dir,
        virtual_addr,
    )
    .unwrap();

    let req = Request::builder("POST", "/v2/url_config")
        .host("h7.iot-dns.com")
        .build();
    let response = router.dispatch(req).await;
    let Response::Json(value) = response else {
        panic!("expected json response, got {response:?}");
    };
    assert_eq!(value["httpUrl"]["addr"], "http://10.42.42.1/d.json");
    assert!(url_config_events.recv().await.is_some());
}

#[tokio::test]
async fn unmatched_action_falls_through_to_default_schema_handler() {
    let virtual_addr: Ipv4Addr = "10.42.42.1".parse().unwrap();
    let uuid = "01234567890123456789012345678901";
    let registry = registry_with_one_device(uuid);
    let events = EventBus::new();
    let mut activation_events = events.subscribe::<ActivationEvent>();

    let router = Router::new();
    let mqtt = Arc::new(MqttBroker::new(virtual_addr, events.clone()));
    let tracker = Arc::new(OtaTracker::new());
    let schema_dir = std::env::temp_dir().join(format!("cloudcutter-rs-stack-test-{}", std::process::id()));
    tokio::fs::create_dir_all(&schema_dir).await.unwrap();

    impersonation::register_all(
        &router,
        Arc::clone(&registry),
        events.clone(),
        mqtt,
        tracker,
        schema_dir,
        virtual_addr,
    )
    .unwrap();

    // `tuya.device.active` is claimed by the activation handler, which
    // registers ahead of the catch-all schema handler.
    let device = registry.get(uuid).unwrap();
    let active_wire = crypto::encrypt(&json!({"softVer": "2.0.0"}), device).unwrap();
    let active_req = Request::builder("POST", "/d.json")
        .query("uuid", uuid)
        .query("et", "1")
        .query("a", "tuya.device.active")
        .body(Body::Json(json!({"data": hex::encode(active_wire)})))
        .build();
    let response = router.dispatch(active_req).await;
    assert!(matches!(response, Response::Json(_)));
    assert!(activation_events.recv().await.is_some());

    // An action nothing else claims falls through to schema replay, which
    // still produces a valid envelope rather than a 404.
    let device = registry.get(uuid).unwrap();
    let other_wire = crypto::encrypt(&json!({}), device).unwrap();
    let other_req = Request::builder("POST", "/d.json")
        .query("uuid", uuid)
        .query("et", "1")
        .query("a", "some.unclaimed.action")
        .body(Body::Json(json!({"data": hex::encode(other_wire)})))
        .build();
    let response = router.dispatch(other_req).await;
    let Response::Json(envelope) = response else {
        panic!("expected json envelope, got {response:?}");
    };
    let result_b64 = envelope["result"].as_str().unwrap();
    let wire = base64::engine::general_purpose::STANDARD
        .decode(result_b64)
        .unwrap();
    let inner = crypto::decrypt(&wire, registry.get(uuid).unwrap()).unwrap();
    assert!(inner["result"].is_object());
}
