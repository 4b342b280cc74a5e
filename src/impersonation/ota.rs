//! OTA trigger/info/status/progress/download state machine (spec §4.8).
//! Grounded on the original `cores/server/ota.py`.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::crypto::{self, MqttProtocolVersion};
use crate::device::{Device, DeviceRegistry};
use crate::event_bus::{Event, EventBus};
use crate::http::request::Request;
use crate::http::request::Response;
use crate::http::router::{RouteBuilder, Router};
use crate::mqtt::{MqttBroker, TopicHandlerFuture};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    NotYetTriggered,
    Triggered,
    Downloaded,
}

#[derive(Debug, Clone)]
pub enum OtaEvent {
    Triggered { uuid: String },
    Skip { uuid: String, reason: &'static str },
    Info { uuid: String },
    StatusUpdate { uuid: String, status: String },
    Progress { uuid: String, percent: i64 },
    Downloaded { uuid: String },
}

impl Event for OtaEvent {}

/// Per-device OTA progress, keyed by uuid. `upgraded` tracks the set used
/// by `upgrade.silent.get`'s idempotency check, independent of `states`,
/// matching the original's separate `upgraded_devices` set.
#[derive(Default)]
pub struct OtaTracker {
    states: RwLock<HashMap<String, OtaState>>,
    upgraded: RwLock<HashSet<String>>,
}

impl OtaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, uuid: &str) -> OtaState {
        *self.states.read().get(uuid).unwrap_or(&OtaState::NotYetTriggered)
    }

    fn set_state(&self, uuid: &str, state: OtaState) {
        self.states.write().insert(uuid.to_string(), state);
    }

    pub fn is_upgraded(&self, uuid: &str) -> bool {
        self.upgraded.read().contains(uuid)
    }

    fn mark_upgraded(&self, uuid: &str) {
        self.upgraded.write().insert(uuid.to_string());
    }
}

pub fn register(
    router: &Router,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    mqtt: Arc<MqttBroker>,
    tracker: Arc<OtaTracker>,
    virtual_addr: Ipv4Addr,
) -> anyhow::Result<()> {
    router.register(
        RouteBuilder::new("ota_trigger", "POST", r"^/d\.json$")
            .query(
                "a",
                r"^(tuya\.device\.dynamic\.config\.ack|tuya\.device\.timer\.count)$",
            )
            .build({
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let mqtt = Arc::clone(&mqtt);
                let tracker = Arc::clone(&tracker);
                move |req: Request| {
                    let registry = Arc::clone(&registry);
                    let events = events.clone();
                    let mqtt = Arc::clone(&mqtt);
                    let tracker = Arc::clone(&tracker);
                    async move { handle_trigger(&registry, &events, &mqtt, &tracker, req).await }
                }
            })?,
    );

    router.register(
        RouteBuilder::new("ota_silent_get", "POST", r"^/d\.json$")
            .query("a", r"^tuya\.device\.upgrade\.silent\.get$")
            .build({
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let tracker = Arc::clone(&tracker);
                move |req: Request| {
                    let registry = Arc::clone(&registry);
                    let events = events.clone();
                    let tracker = Arc::clone(&tracker);
                    async move { handle_silent_get(&registry, &events, &tracker, virtual_addr, req).await }
                }
            })?,
    );

    router.register(
        RouteBuilder::new("ota_upgrade_get", "POST", r"^/d\.json$")
            .query("a", r"^tuya\.device\.upgrade\.get$")
            .build({
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let tracker = Arc::clone(&tracker);
                move |req: Request| {
                    let registry = Arc::clone(&registry);
                    let events = events.clone();
                    let tracker = Arc::clone(&tracker);
                    async move {
                        let action = req.query.get("a").cloned().unwrap_or_default();
                        let device = match super::resolve_device(&registry, &req) {
                            Ok(device) => device,
                            Err(response) => return response,
                        };
                        if let Err(err) = super::decrypt_request(&req, device) {
                            warn!(error = %err, "failed to decrypt upgrade.get request");
                            return Response::Status(500);
                        }
                        upgrade_get_response(device, &events, &tracker, virtual_addr, &action).await
                    }
                }
            })?,
    );

    router.register(
        RouteBuilder::new("ota_status_update", "POST", r"^/d\.json$")
            .query("a", r"^tuya\.device\.upgrade\.status\.update$")
            .build({
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let tracker = Arc::clone(&tracker);
                move |req: Request| {
                    let registry = Arc::clone(&registry);
                    let events = events.clone();
                    let tracker = Arc::clone(&tracker);
                    async move { handle_status_update(&registry, &events, &tracker, req).await }
                }
            })?,
    );

    router.register(
        RouteBuilder::new("ota_files", "GET", r"^/files/.+$")
            .build({
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let tracker = Arc::clone(&tracker);
                move |req: Request| {
                    let registry = Arc::clone(&registry);
                    let events = events.clone();
                    let tracker = Arc::clone(&tracker);
                    async move { handle_files(&registry, &events, &tracker, req) }
                }
            })?,
    );

    mqtt.on_topic("smart/device/out/+", {
        let registry = Arc::clone(&registry);
        let events = events.clone();
        move |topic: String, payload: Vec<u8>| {
            let registry = Arc::clone(&registry);
            let events = events.clone();
            Box::pin(async move { handle_progress(&registry, &events, &topic, &payload) }) as TopicHandlerFuture
        }
    });

    Ok(())
}

async fn handle_trigger(
    registry: &DeviceRegistry,
    events: &EventBus,
    mqtt: &MqttBroker,
    tracker: &OtaTracker,
    req: Request,
) -> Response {
    let action = req.query.get("a").cloned().unwrap_or_default();
    let device = match super::resolve_device(registry, &req) {
        Ok(device) => device,
        Err(response) => return response,
    };
    if let Err(err) = super::decrypt_request(&req, device) {
        warn!(error = %err, "failed to decrypt OTA trigger request");
        return Response::Status(500);
    }

    if tracker.is_upgraded(&device.uuid) {
        info!(uuid = %device.uuid, "device already upgraded, skipping trigger");
        return Response::None;
    }
    if device.firmware_path.is_none() {
        info!(uuid = %device.uuid, "no upgrade firmware set, skipping trigger");
        events.publish(OtaEvent::Skip {
            uuid: device.uuid.clone(),
            reason: "NO_FIRMWARE_SET",
        });
        return Response::None;
    }

    info!(uuid = %device.uuid, action, "triggering OTA upgrade");
    tracker.mark_upgraded(&device.uuid);
    tracker.set_state(&device.uuid, OtaState::Triggered);
    events.publish(OtaEvent::Triggered {
        uuid: device.uuid.clone(),
    });

    let topic = format!("smart/device/in/{}", device.uuid);
    let payload = json!({"data": {"firmwareType": 0}, "protocol": 15});
    match crypto::mqtt_encrypt(&payload, device, MqttProtocolVersion::V22, super::now_unix_f64()) {
        Ok(message) => {
            if let Err(err) = mqtt.publish(&topic, message).await {
                warn!(error = %err, "failed to publish OTA trigger over MQTT");
            }
        }
        Err(err) => warn!(error = %err, "failed to build OTA trigger envelope"),
    }

    // Falls through to the default schema handler, matching the original.
    Response::None
}

async fn handle_silent_get(
    registry: &DeviceRegistry,
    events: &EventBus,
    tracker: &OtaTracker,
    virtual_addr: Ipv4Addr,
    req: Request,
) -> Response {
    let device = match super::resolve_device(registry, &req) {
        Ok(device) => device,
        Err(response) => return response,
    };
    if let Err(err) = super::decrypt_request(&req, device) {
        warn!(error = %err, "failed to decrypt upgrade.silent.get request");
        return Response::Status(500);
    }

    if tracker.is_upgraded(&device.uuid) {
        info!(uuid = %device.uuid, "already upgraded, skipping silent upgrade");
        return super::encrypt_response(&json!({}), device);
    }
    if device.firmware_path.is_none() {
        info!(uuid = %device.uuid, "no upgrade firmware set");
        return Response::None;
    }

    upgrade_get_response(device, events, tracker, virtual_addr, "tuya.device.upgrade.silent.get").await
}

async fn upgrade_get_response(
    device: &Device,
    events: &EventBus,
    tracker: &OtaTracker,
    virtual_addr: Ipv4Addr,
    action: &str,
) -> Response {
    let Some(fw_path) = device.firmware_path.clone() else {
        warn!(uuid = %device.uuid, "upgrade.get requested but no firmware configured");
        events.publish(OtaEvent::Skip {
            uuid: device.uuid.clone(),
            reason: "NO_FIRMWARE_SET",
        });
        return Response::None;
    };
    let fw_data = match tokio::fs::read(&fw_path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, path = %fw_path.display(), "failed to read firmware file");
            return Response::Status(500);
        }
    };

    let fw_sha_hex = hex::encode(Sha256::digest(&fw_data)).to_uppercase();
    let mut mac = HmacSha256::new_from_slice(device.active_key()).expect("HMAC accepts any key length");
    mac.update(fw_sha_hex.as_bytes());
    let fw_hmac = hex::encode(mac.finalize().into_bytes()).to_uppercase();

    info!(uuid = %device.uuid, action, "sending upgrade information");
    tracker.mark_upgraded(&device.uuid);
    tracker.set_state(&device.uuid, OtaState::Triggered);
    events.publish(OtaEvent::Info {
        uuid: device.uuid.clone(),
    });

    let result = json!({
        "url": format!("http://{virtual_addr}/files/{}", device.uuid),
        "hmac": fw_hmac,
        "version": "9.0.0",
        "size": fw_data.len().to_string(),
        "type": 0,
    });
    super::encrypt_response(&result, device)
}

async fn handle_status_update(registry: &DeviceRegistry, events: &EventBus, tracker: &OtaTracker, req: Request) -> Response {
    let device = match super::resolve_device(registry, &req) {
        Ok(device) => device,
        Err(response) => return response,
    };
    let data = match super::decrypt_request(&req, device) {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "failed to decrypt upgrade.status.update request");
            return Response::Status(500);
        }
    };
    let status = data.get("upgradeStatus").cloned().unwrap_or(Value::Null);
    info!(uuid = %device.uuid, %status, "OTA status update");
    tracker.set_state(&device.uuid, OtaState::Triggered);
    events.publish(OtaEvent::StatusUpdate {
        uuid: device.uuid.clone(),
        status: status.to_string(),
    });
    Response::None
}

fn handle_files(registry: &DeviceRegistry, events: &EventBus, tracker: &OtaTracker, req: Request) -> Response {
    let uuid = req.path.rsplit('/').next().unwrap_or_default().to_string();
    let device = match registry.get(&uuid) {
        Ok(device) => device,
        Err(err) => {
            warn!(error = %err, uuid, "files request for unknown device");
            return Response::Status(500);
        }
    };
    let Some(fw_path) = device.firmware_path.clone() else {
        warn!(uuid, "files request but device has no firmware configured");
        return Response::Status(404);
    };

    tracker.set_state(&uuid, OtaState::Downloaded);
    events.publish(OtaEvent::Downloaded { uuid });
    Response::File(fw_path)
}

fn handle_progress(registry: &DeviceRegistry, events: &EventBus, topic: &str, payload: &[u8]) {
    let uuid = topic.rsplit('/').next().unwrap_or_default();
    let Ok(device) = registry.get(uuid) else {
        return;
    };
    let Ok(data) = crypto::mqtt_decrypt(payload, device) else {
        return;
    };
    if data.get("protocol").and_then(Value::as_i64) != Some(16) {
        return;
    }
    let percent = data
        .get("data")
        .and_then(|d| d.get("progress"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    info!(uuid, percent, "OTA progress");
    events.publish(OtaEvent::Progress {
        uuid: uuid.to_string(),
        percent,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::http::request::Body;

    fn setup(uuid: &str, fw: &[u8]) -> (Arc<DeviceRegistry>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("cloudcutter-rs-ota-test-{uuid}"));
        std::fs::create_dir_all(&dir).unwrap();
        let fw_path = dir.join("firmware.bin");
        std::fs::write(&fw_path, fw).unwrap();

        let device = Device::new(uuid, [b'K'; 32], [b'P'; 64]).with_firmware(fw_path.clone());
        let mut registry = DeviceRegistry::new();
        registry.register(device);
        (Arc::new(registry), fw_path)
    }

    #[tokio::test]
    async fn upgrade_get_hmac_matches_spec_formula() {
        let uuid = "01234567890123456789012345678901";
        let (registry, _fw_path) = setup(uuid, b"HELLO");
        let device = registry.get(uuid).unwrap();
        let tracker = OtaTracker::new();
        let events = EventBus::new();
        let virtual_addr: Ipv4Addr = "10.42.42.1".parse().unwrap();

        let response = upgrade_get_response(device, &events, &tracker, virtual_addr, "tuya.device.upgrade.get").await;
        let Response::Json(envelope) = response else {
            panic!("expected json envelope, got {response:?}");
        };

        use base64::Engine as _;
        let wire = base64::engine::general_purpose::STANDARD
            .decode(envelope["result"].as_str().unwrap())
            .unwrap();
        let inner = crypto::decrypt(&wire, device).unwrap();

        let fw_sha_hex = hex::encode(Sha256::digest(b"HELLO")).to_uppercase();
        let mut mac = HmacSha256::new_from_slice(device.active_key()).unwrap();
        mac.update(fw_sha_hex.as_bytes());
        let expected_hmac = hex::encode(mac.finalize().into_bytes()).to_uppercase();

        assert_eq!(inner["result"]["hmac"], expected_hmac);
        assert_eq!(inner["result"]["size"], "5");
        assert_eq!(inner["result"]["url"], format!("http://10.42.42.1/files/{uuid}"));
        assert_eq!(tracker.state(uuid), OtaState::Triggered);
        assert!(tracker.is_upgraded(uuid));
    }

    #[tokio::test]
    async fn second_silent_get_returns_empty_envelope() {
        let uuid = "01234567890123456789012345678901";
        let (registry, _fw_path) = setup(uuid, b"HELLO");
        let tracker = Arc::new(OtaTracker::new());
        tracker.mark_upgraded(uuid);

        let router = Router::new();
        let events = EventBus::new();
        let mqtt = Arc::new(MqttBroker::new("10.42.42.1".parse().unwrap(), events.clone()));
        register(&router, Arc::clone(&registry), events, mqtt, Arc::clone(&tracker), "10.42.42.1".parse().unwrap()).unwrap();

        let device = registry.get(uuid).unwrap();
        let wire = crypto::encrypt(&json!({}), device).unwrap();
        let req = Request::builder("POST", "/d.json")
            .query("uuid", uuid.to_string())
            .query("a", "tuya.device.upgrade.silent.get")
            .body(Body::Json(json!({"data": hex::encode(wire)})))
            .build();

        let response = router.dispatch(req).await;
        let Response::Json(envelope) = response else {
            panic!("expected json envelope, got {response:?}");
        };
        use base64::Engine as _;
        let wire = base64::engine::general_purpose::STANDARD
            .decode(envelope["result"].as_str().unwrap())
            .unwrap();
        let inner = crypto::decrypt(&wire, registry.get(uuid).unwrap()).unwrap();
        assert_eq!(inner["result"], json!({}));
    }

    #[test]
    fn tracker_defaults_to_not_yet_triggered() {
        let tracker = OtaTracker::new();
        assert_eq!(tracker.state("unknown"), OtaState::NotYetTriggered);
        assert!(!tracker.is_upgraded("unknown"));
    }
}
