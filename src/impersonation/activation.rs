//! Device activation (spec §4.8): `POST /d.json?a=tuya.device.active`.
//! Grounded on the original `cores/gateway.py` `on_gateway_active`.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::device::DeviceRegistry;
use crate::event_bus::{Event, EventBus};
use crate::http::request::{Request, Response};
use crate::http::router::{RouteBuilder, Router};

/// Emitted once per successful activation.
#[derive(Debug, Clone)]
pub struct ActivationEvent {
    pub uuid: String,
    pub soft_ver: Option<String>,
}

impl Event for ActivationEvent {}

pub fn register(router: &Router, registry: Arc<DeviceRegistry>, events: EventBus) -> anyhow::Result<()> {
    router.register(
        RouteBuilder::new("activation", "POST", r"^/d\.json$")
            .query("a", r"^tuya\.device\.active$")
            .build(move |req: Request| {
                let registry = Arc::clone(&registry);
                let events = events.clone();
                async move { handle(&registry, &events, req) }
            })?,
    );
    Ok(())
}

fn handle(registry: &DeviceRegistry, events: &EventBus, req: Request) -> Response {
    let device = match super::resolve_device(registry, &req) {
        Ok(device) => device,
        Err(response) => return response,
    };

    let data = match super::decrypt_request(&req, device) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(error = %err, "failed to decrypt activation request");
            return Response::Status(500);
        }
    };
    let soft_ver = data.get("softVer").and_then(|v| v.as_str()).map(str::to_string);
    info!(uuid = %device.uuid, ?soft_ver, "activating device");

    let active_key = String::from_utf8_lossy(device.active_key()).into_owned();
    let schema = json!([
        {
            "mode": "rw",
            "property": {"type": "bool"},
            "id": 1,
            "type": "obj",
        }
    ]);

    let result = json!({
        "schema": serde_json::to_string(&schema).unwrap_or_default(),
        "devId": device.uuid,
        "resetFactory": false,
        "timeZone": "+02:00",
        "capability": 1025,
        "secKey": active_key,
        "stdTimeZone": "+01:00",
        "schemaId": "0000000000",
        "dstIntervals": [],
        "localKey": active_key,
    });

    events.publish(ActivationEvent {
        uuid: device.uuid.clone(),
        soft_ver,
    });

    super::encrypt_response(&result, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use crate::crypto;
    use crate::device::Device;
    use crate::http::request::Body;

    fn request_with_data(uuid: &str, device: &Device, payload: serde_json::Value) -> Request {
        let wire = crypto::encrypt(&payload, device).unwrap();
        Request::builder("POST", "/d.json")
            .query("uuid", uuid.to_string())
            .query("et", "1")
            .query("a", "tuya.device.active")
            .body(Body::Json(json!({"data": hex::encode(wire)})))
            .build()
    }

    #[tokio::test]
    async fn activation_returns_dev_id_and_active_key() {
        let uuid = "01234567890123456789012345678901";
        let device = Device::new(uuid, [b'K'; 32], [b'P'; 64]);
        let mut registry = DeviceRegistry::new();
        registry.register(device);
        let registry = Arc::new(registry);

        let events = EventBus::new();
        let mut subscription = events.subscribe::<ActivationEvent>();
        let router = Router::new();
        register(&router, Arc::clone(&registry), events).unwrap();

        // Build the request against the registered device's current (ECB) state.
        let device_ref = registry.get(uuid).unwrap();
        let req = request_with_data(uuid, device_ref, json!({"softVer": "1.0.0"}));

        let response = router.dispatch(req).await;
        let Response::Json(envelope) = response else {
            panic!("expected json envelope, got {response:?}");
        };
        let result_b64 = envelope["result"].as_str().unwrap();
        let wire = base64::engine::general_purpose::STANDARD
            .decode(result_b64)
            .unwrap();
        let inner = crypto::decrypt(&wire, registry.get(uuid).unwrap()).unwrap();
        assert_eq!(inner["result"]["devId"], uuid);
        assert_eq!(inner["result"]["capability"], 1025);

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.uuid, uuid);
        assert_eq!(event.soft_ver.as_deref(), Some("1.0.0"));
    }
}
