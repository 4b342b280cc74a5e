//! The device record and registry: §3 `Device`, §4.7 `Device Registry`.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::http::request::Request;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found")]
    NotFound,
    #[error("unsupported encryption type {0}")]
    Unsupported(u8),
}

/// Selector for the per-device symmetric envelope, spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Reserved; must fail with `Unsupported`.
    Reserved,
    /// AES-128-ECB + PKCS#7.
    Ecb,
    /// AES-128-GCM.
    Gcm,
}

impl EncryptionType {
    pub fn from_code(code: u8) -> Result<Self, DeviceError> {
        match code {
            1 => Ok(Self::Ecb),
            3 => Ok(Self::Gcm),
            other => Err(DeviceError::Unsupported(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Reserved => 0,
            Self::Ecb => 1,
            Self::Gcm => 3,
        }
    }
}

/// A device the impersonation server knows how to answer for.
///
/// `psk_id` is derived once at construction and never mutated afterwards.
/// `encryption_type`/`aes_key` are the only mutable fields, written while
/// handling a request on that device's own request path (spec §3, §9 notes
/// this as the field the redesign should eventually make per-request rather
/// than device-global; we keep the mutable fields but confine writes to
/// `DeviceRegistry::resolve_request`, the single call site, to honor that).
pub struct Device {
    pub uuid: String,
    pub auth_key: [u8; 32],
    pub psk: [u8; 64],
    pub psk_id: [u8; 32],
    pub firmware_path: Option<PathBuf>,
    state: RwLock<DeviceState>,
}

struct DeviceState {
    encryption_type: EncryptionType,
    aes_key: Vec<u8>,
}

impl Device {
    pub fn new(uuid: impl Into<String>, auth_key: [u8; 32], psk: [u8; 64]) -> Self {
        let uuid = uuid.into();
        let psk_id: [u8; 32] = Sha256::digest(uuid.as_bytes()).into();
        Self {
            uuid,
            auth_key,
            psk,
            psk_id,
            firmware_path: None,
            state: RwLock::new(DeviceState {
                encryption_type: EncryptionType::Ecb,
                aes_key: auth_key[0..16].to_vec(),
            }),
        }
    }

    pub fn with_firmware(mut self, path: PathBuf) -> Self {
        self.firmware_path = Some(path);
        self
    }

    /// `active_key = auth_key[0:16]`, interpreted as ASCII — used for
    /// `secKey`/`localKey` and the OTA HMAC.
    pub fn active_key(&self) -> &[u8] {
        &self.auth_key[0..16]
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.state.read().encryption_type
    }

    pub fn aes_key(&self) -> Vec<u8> {
        self.state.read().aes_key.clone()
    }

    /// Sets the per-device encryption type and the AES key view that goes
    /// with it. `full_key = true` selects the `uuid` lookup path (all 32
    /// bytes of `auth_key` reachable, though only the first 16 are ever fed
    /// to AES); `false` selects the legacy `devid` path (`auth_key[0:16]`).
    fn set_encryption(&self, encryption_type: EncryptionType, full_key: bool) {
        let mut state = self.state.write();
        state.encryption_type = encryption_type;
        state.aes_key = if full_key {
            self.auth_key.to_vec()
        } else {
            self.auth_key[0..16].to_vec()
        };
    }

    pub fn psk_id_hex(&self) -> String {
        hex::encode(self.psk_id)
    }
}

/// Maps device UUID / PSK identity to `Device`, spec §4.7.
pub struct DeviceRegistry {
    by_uuid: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            by_uuid: HashMap::new(),
        }
    }

    pub fn register(&mut self, device: Device) {
        self.by_uuid.insert(device.uuid.clone(), device);
    }

    pub fn get(&self, uuid: &str) -> Result<&Device, DeviceError> {
        self.by_uuid.get(uuid).ok_or(DeviceError::NotFound)
    }

    pub fn get_by_psk_id(&self, psk_id: &[u8]) -> Result<&Device, DeviceError> {
        self.by_uuid
            .values()
            .find(|d| d.psk_id == psk_id)
            .ok_or(DeviceError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.by_uuid.values()
    }

    /// Resolves the device addressed by an HTTP request: reads `uuid` or
    /// the legacy `devid` query parameter, and `et` (default `0`) for the
    /// encryption type, then writes the derived `aes_key`/`encryption_type`
    /// onto that device before returning it. This is the crate's one
    /// single-writer call site for per-device mutable state (spec §3, §5).
    pub fn resolve_request(&self, req: &Request) -> Result<&Device, DeviceError> {
        let (key, full_key) = if let Some(uuid) = req.query.get("uuid") {
            (uuid.clone(), true)
        } else if let Some(devid) = req.query.get("devid") {
            (devid.clone(), false)
        } else {
            return Err(DeviceError::NotFound);
        };

        let device = self.get(&key)?;

        let et_code: u8 = req
            .query
            .get("et")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let encryption_type = EncryptionType::from_code(et_code)?;
        device.set_encryption(encryption_type, full_key);
        debug!(uuid = %device.uuid, et = et_code, "resolved device for request");
        Ok(device)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_id_is_sha256_of_uuid() {
        let uuid = "01234567890123456789012345678901";
        let device = Device::new(uuid, [b'A'; 32], [b'P'; 64]);
        let expected: [u8; 32] = Sha256::digest(uuid.as_bytes()).into();
        assert_eq!(device.psk_id, expected);
    }

    #[test]
    fn active_key_is_first_16_bytes_of_auth_key() {
        let device = Device::new("u", [b'K'; 32], [b'P'; 64]);
        assert_eq!(device.active_key(), &[b'K'; 16]);
    }
}
