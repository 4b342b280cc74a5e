//! Impersonation handlers (spec §4.8): URL-config, activation, generic
//! schema replay, and the OTA trigger/info/status/progress/file state
//! machine. Every `/d.json` handler speaks the Crypto Envelope; registration
//! order on the shared `Router` decides precedence among overlapping routes.

pub mod activation;
pub mod ota;
pub mod schema;
pub mod url_config;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::crypto::{self, CryptoError};
use crate::device::{Device, DeviceError, DeviceRegistry};
use crate::http::request::{Body, Request, Response};

/// Resolves the device addressed by `req`, or builds the `500` response
/// spec §7 prescribes for `DeviceNotFound`/`Unsupported` errors surfacing
/// from an HTTP handler.
fn resolve_device<'a>(registry: &'a DeviceRegistry, req: &Request) -> Result<&'a Device, Response> {
    registry.resolve_request(req).map_err(|err| {
        warn!(error = %err, "device resolution failed for impersonation request");
        device_error_response(&err)
    })
}

fn device_error_response(_err: &DeviceError) -> Response {
    Response::Status(500)
}

/// Reads the hex-encoded `data` field a `/d.json` body carries and decrypts
/// it under `device`'s current envelope (spec §4.2).
fn decrypt_request(req: &Request, device: &Device) -> Result<Value, CryptoError> {
    let hex_str = match req.body.as_ref() {
        Some(Body::Json(Value::Object(map))) => map.get("data").and_then(Value::as_str),
        Some(Body::Form(map)) => map.get("data").map(String::as_str),
        _ => None,
    }
    .unwrap_or_default();
    let wire = hex::decode(hex_str).map_err(|_| CryptoError::Truncated)?;
    crypto::decrypt(&wire, device)
}

/// Builds the `{result, t, sign}` envelope for a `/d.json` response.
fn encrypt_response(payload: &Value, device: &Device) -> Response {
    match crypto::http_response_envelope(payload, device, now_unix()) {
        Ok(envelope) => Response::Json(envelope),
        Err(err) => {
            warn!(error = %err, "failed to build response envelope");
            Response::Status(500)
        }
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn now_unix_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Registers every impersonation handler onto `router`, in the order spec
/// §4.8's dispatch precedence requires: URL-config and activation are
/// narrowly scoped and always win; the OTA handlers come next (the trigger
/// handler falls through to schema replay on purpose); the default schema
/// handler is registered last so it only ever catches what nothing else
/// claimed.
#[allow(clippy::too_many_arguments)]
pub fn register_all(
    router: &crate::http::router::Router,
    registry: Arc<DeviceRegistry>,
    events: crate::event_bus::EventBus,
    mqtt: Arc<crate::mqtt::MqttBroker>,
    ota_tracker: Arc<ota::OtaTracker>,
    schema_dir: std::path::PathBuf,
    virtual_addr: std::net::Ipv4Addr,
) -> anyhow::Result<()> {
    url_config::register(router, events.clone(), virtual_addr)?;
    activation::register(router, Arc::clone(&registry), events.clone())?;
    ota::register(
        router,
        Arc::clone(&registry),
        events.clone(),
        mqtt,
        ota_tracker,
        virtual_addr,
    )?;
    schema::register(router, registry, events, schema_dir)?;
    Ok(())
}
