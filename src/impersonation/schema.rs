//! Default schema-replay handler (spec §4.8): `POST /d.json` with no
//! query constraint, registered last so every more specific handler gets
//! first refusal. Grounded on the original `cores/gateway.py`
//! `on_gateway_other`.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::device::DeviceRegistry;
use crate::event_bus::{Event, EventBus};
use crate::http::request::{Request, Response};
use crate::http::router::{RouteBuilder, Router};

/// Emitted for every schema-replay action, whether or not a canned file
/// existed for it.
#[derive(Debug, Clone)]
pub struct SchemaReplayEvent {
    pub uuid: String,
    pub action: String,
    pub matched: bool,
}

impl Event for SchemaReplayEvent {}

pub fn register(
    router: &Router,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    schema_dir: PathBuf,
) -> anyhow::Result<()> {
    router.register(
        RouteBuilder::new("schema_replay", "POST", r"^/d\.json$")
            .build(move |req: Request| {
                let registry = Arc::clone(&registry);
                let events = events.clone();
                let schema_dir = schema_dir.clone();
                async move { handle(&registry, &events, &schema_dir, req).await }
            })?,
    );
    Ok(())
}

async fn handle(registry: &DeviceRegistry, events: &EventBus, schema_dir: &std::path::Path, req: Request) -> Response {
    let action = req.query.get("a").cloned().unwrap_or_default();

    let device = match super::resolve_device(registry, &req) {
        Ok(device) => device,
        Err(response) => return response,
    };
    if let Err(err) = super::decrypt_request(&req, device) {
        warn!(error = %err, action, "failed to decrypt schema-replay request");
        return Response::Status(500);
    }

    let (result, matched) = load_schema_result(schema_dir, &action, &device.uuid).await;
    info!(uuid = %device.uuid, action, matched, "schema-replay action");
    events.publish(SchemaReplayEvent {
        uuid: device.uuid.clone(),
        action,
        matched,
    });

    super::encrypt_response(&result, device)
}

/// Loads `<schema_dir>/<action>.json`, substitutes the literal `DUMMY`
/// placeholder with `uuid`, and returns its `result` field. Falls back to
/// an empty object when no file exists for the action (spec §4.8).
async fn load_schema_result(schema_dir: &std::path::Path, action: &str, uuid: &str) -> (Value, bool) {
    if action.is_empty() {
        return (json!({}), false);
    }
    let path = schema_dir.join(format!("{action}.json"));
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
            let text = text.replace("DUMMY", uuid);
            match serde_json::from_str::<Value>(&text) {
                Ok(doc) => (doc.get("result").cloned().unwrap_or(json!({})), true),
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "malformed schema file");
                    (json!({}), false)
                }
            }
        }
        Err(_) => {
            warn!(action, "missing schema response for action");
            (json!({}), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::device::Device;
    use crate::http::request::Body;

    #[tokio::test]
    async fn missing_schema_file_returns_empty_object() {
        let dir = std::env::temp_dir().join(format!("cloudcutter-rs-schema-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let uuid = "01234567890123456789012345678901";
        let device = Device::new(uuid, [b'K'; 32], [b'P'; 64]);
        let mut registry = DeviceRegistry::new();
        registry.register(device);
        let registry = Arc::new(registry);

        let router = Router::new();
        register(&router, Arc::clone(&registry), EventBus::new(), dir).unwrap();

        let wire = crypto::encrypt(&json!({}), registry.get(uuid).unwrap()).unwrap();
        let req = Request::builder("POST", "/d.json")
            .query("uuid", uuid.to_string())
            .query("a", "tuya.device.timer.count")
            .body(Body::Json(json!({"data": hex::encode(wire)})))
            .build();

        let response = router.dispatch(req).await;
        let Response::Json(envelope) = response else {
            panic!("expected json envelope, got {response:?}");
        };
        let result_b64 = envelope["result"].as_str().unwrap();
        use base64::Engine as _;
        let wire = base64::engine::general_purpose::STANDARD
            .decode(result_b64)
            .unwrap();
        let inner = crypto::decrypt(&wire, registry.get(uuid).unwrap()).unwrap();
        assert_eq!(inner["result"], json!({}));
    }

    #[tokio::test]
    async fn schema_file_substitutes_dummy_with_uuid() {
        let dir = std::env::temp_dir().join(format!("cloudcutter-rs-schema-test-{}", std::process::id() as u64 + 1));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("tuya.device.upgrade.status.update.json"),
            r#"{"result":{"devId":"DUMMY"}}"#,
        )
        .await
        .unwrap();

        let uuid = "abcdefabcdefabcdefabcdefabcdefab";
        let (result, matched) = load_schema_result(&dir, "tuya.device.upgrade.status.update", uuid).await;
        assert!(matched);
        assert_eq!(result["devId"], uuid);
    }
}
