//! Crypto Envelope: spec §4.2. Symmetric encryption/decryption of the JSON
//! payloads carried on HTTP and MQTT, plus the signature schemes each wire
//! format uses to let the device trust an unauthenticated response.

use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit as AeadKeyInit};
use aes_gcm::{Aes128Gcm, Key as GcmKey, Nonce};
use base64::Engine as _;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;

use crate::device::{Device, EncryptionType};

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption type {0} is reserved and unsupported")]
    Unsupported(u8),
    #[error("ciphertext too short for the declared wire format")]
    Truncated,
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("padding error")]
    Padding,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encrypts `payload` (compact JSON, no spaces) under `device`'s current
/// `encryption_type`/`aes_key`, producing the wire form described in §4.2:
/// raw ciphertext for type 1 (ECB), or `IV || ciphertext || tag` for type 3
/// (GCM).
pub fn encrypt(payload: &Value, device: &Device) -> Result<Vec<u8>, CryptoError> {
    let plaintext = serde_json::to_vec(payload)?;
    encrypt_bytes(&plaintext, device)
}

pub fn encrypt_bytes(plaintext: &[u8], device: &Device) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; GCM_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_bytes_with_iv(plaintext, device, &iv)
}

/// Test-visible variant that accepts an explicit IV instead of drawing one
/// from the CSPRNG (spec §8 scenario 1 pins the IV to 12 zero bytes).
pub fn encrypt_bytes_with_iv(
    plaintext: &[u8],
    device: &Device,
    iv: &[u8; GCM_IV_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let key = device.aes_key();
    let key16 = &key[..16.min(key.len())];
    match device.encryption_type() {
        EncryptionType::Reserved => Err(CryptoError::Unsupported(0)),
        EncryptionType::Ecb => Ok(Aes128EcbEnc::new(key16.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        EncryptionType::Gcm => {
            let cipher = Aes128Gcm::new(GcmKey::<Aes128Gcm>::from_slice(key16));
            let nonce = Nonce::from_slice(iv);
            let ct_and_tag = cipher
                .encrypt(nonce, plaintext)
                .map_err(|_| CryptoError::AuthFailed)?;
            let mut wire = Vec::with_capacity(GCM_IV_LEN + ct_and_tag.len());
            wire.extend_from_slice(iv);
            wire.extend_from_slice(&ct_and_tag);
            Ok(wire)
        }
    }
}

/// Decrypts a wire-form payload produced by `encrypt`, returning the parsed
/// JSON value.
pub fn decrypt(wire: &[u8], device: &Device) -> Result<Value, CryptoError> {
    let plaintext = decrypt_bytes(wire, device)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

pub fn decrypt_bytes(wire: &[u8], device: &Device) -> Result<Vec<u8>, CryptoError> {
    let key = device.aes_key();
    let key16 = &key[..16.min(key.len())];
    match device.encryption_type() {
        EncryptionType::Reserved => Err(CryptoError::Unsupported(0)),
        EncryptionType::Ecb => Aes128EcbDec::new(key16.into())
            .decrypt_padded_vec_mut::<Pkcs7>(wire)
            .map_err(|_| CryptoError::Padding),
        EncryptionType::Gcm => {
            if wire.len() < GCM_IV_LEN + GCM_TAG_LEN {
                return Err(CryptoError::Truncated);
            }
            let (iv, ct_and_tag) = wire.split_at(GCM_IV_LEN);
            let cipher = Aes128Gcm::new(GcmKey::<Aes128Gcm>::from_slice(key16));
            cipher
                .decrypt(Nonce::from_slice(iv), ct_and_tag)
                .map_err(|_| CryptoError::AuthFailed)
        }
    }
}

/// The MD5-based signature scheme shared by the HTTP `sign` field and the
/// MQTT `"2.1"` envelope: `MD5(input).hex()[8:24]`, 16 lowercase hex chars.
pub fn md5_sign_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    let full_hex = hex::encode(digest);
    full_hex[8..24].to_string()
}

/// Builds the HTTP response envelope: `{"result": base64(wire), "t": t,
/// "sign": sig}` where `sig` signs `"result=" || base64 || "||t=" || t ||
/// "||" || aes_key`.
pub fn http_response_envelope(
    payload: &Value,
    device: &Device,
    t: u64,
) -> Result<Value, CryptoError> {
    let inner = serde_json::json!({"success": true, "t": t, "result": payload});
    let wire = encrypt(&inner, device)?;
    let result_b64 = base64::engine::general_purpose::STANDARD.encode(&wire);

    let mut signed = Vec::new();
    signed.extend_from_slice(b"result=");
    signed.extend_from_slice(result_b64.as_bytes());
    signed.extend_from_slice(format!("||t={t}||").as_bytes());
    signed.extend_from_slice(&device.aes_key());
    let sign = md5_sign_hex(&signed);

    Ok(serde_json::json!({"result": result_b64, "t": t, "sign": sign}))
}

/// MQTT protocol tag used by the crypto envelope on `smart/device/in`/`out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttProtocolVersion {
    V21,
    V22,
}

impl MqttProtocolVersion {
    fn tag(self) -> &'static [u8; 3] {
        match self {
            Self::V21 => b"2.1",
            Self::V22 => b"2.2",
        }
    }
}

/// Encodes an MQTT message: `[3-byte tag][16-byte sig][payload]` (§4.2,
/// §6). For `"2.1"` the payload is base64 ciphertext and the 16-byte sig
/// field holds the 16 ASCII hex characters produced by [`md5_sign_hex`].
/// For `"2.2"` the payload is raw ciphertext prefixed by an 8-digit
/// zero-padded ASCII timestamp, and the 16-byte sig field holds a
/// big-endian CRC32 of `timestamp || ciphertext` in its first 4 bytes
/// (zero-padded to fill the field).
pub fn mqtt_encrypt(
    payload: &Value,
    device: &Device,
    version: MqttProtocolVersion,
    unix_time_secs: f64,
) -> Result<Vec<u8>, CryptoError> {
    let wire = encrypt(payload, device)?;
    let mut out = Vec::new();
    out.extend_from_slice(version.tag());

    match version {
        MqttProtocolVersion::V21 => {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&wire);
            let mut signed = Vec::new();
            signed.extend_from_slice(b"data=");
            signed.extend_from_slice(b64.as_bytes());
            signed.extend_from_slice(b"||pv=2.1||");
            let key = device.aes_key();
            signed.extend_from_slice(&key[..16.min(key.len())]);
            let sig = md5_sign_hex(&signed);
            out.extend_from_slice(sig.as_bytes());
            out.extend_from_slice(b64.as_bytes());
        }
        MqttProtocolVersion::V22 => {
            let timestamp = format!("{:08}", (unix_time_secs * 100.0).floor() as u64 % 100_000_000);
            let mut covered = Vec::new();
            covered.extend_from_slice(timestamp.as_bytes());
            covered.extend_from_slice(&wire);
            let crc = crc32fast::hash(&covered);

            let mut sig_field = [0u8; 16];
            sig_field[0..4].copy_from_slice(&crc.to_be_bytes());
            out.extend_from_slice(&sig_field);
            out.extend_from_slice(&covered);
        }
    }

    Ok(out)
}

/// Decodes an MQTT envelope, ignoring the prefix appropriate to the tag.
pub fn mqtt_decrypt(wire: &[u8], device: &Device) -> Result<Value, CryptoError> {
    if wire.len() < 19 {
        return Err(CryptoError::Truncated);
    }
    let tag = &wire[0..3];
    let rest = &wire[19..];

    let ciphertext = if tag == b"2.1" {
        base64::engine::general_purpose::STANDARD
            .decode(rest)
            .map_err(|_| CryptoError::Truncated)?
    } else if tag == b"2.2" {
        if rest.len() < 8 {
            return Err(CryptoError::Truncated);
        }
        rest[8..].to_vec()
    } else {
        return Err(CryptoError::Truncated);
    };

    decrypt(&ciphertext, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    /// Builds a registry with one device resolved for GCM (`et=3`), the way
    /// an HTTP request with `?uuid=...&et=3` would leave it.
    fn registry_with_gcm_device(uuid: &str) -> crate::device::DeviceRegistry {
        let device = Device::new(uuid, [b'A'; 32], [b'P'; 64]);
        let req = crate::http::request::Request::builder("POST", "/d.json")
            .query("uuid", uuid.to_string())
            .query("et", "3")
            .build();
        let mut registry = crate::device::DeviceRegistry::new();
        registry.register(device);
        registry.resolve_request(&req).unwrap();
        registry
    }

    #[test]
    fn round_trip_gcm_with_fixed_iv() {
        let uuid = "01234567890123456789012345678901";
        let registry = registry_with_gcm_device(uuid);
        let device = registry.get(uuid).unwrap();

        let plaintext = serde_json::json!({"success": true, "t": 1_700_000_000, "result": {}});
        let iv = [0u8; GCM_IV_LEN];
        let plaintext_bytes = serde_json::to_vec(&plaintext).unwrap();
        let wire = encrypt_bytes_with_iv(&plaintext_bytes, device, &iv).unwrap();
        let decrypted = decrypt(&wire, device).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn round_trip_ecb() {
        let device = Device::new("u", [b'K'; 32], [b'P'; 64]);
        let payload = serde_json::json!({"a": 1, "b": "two"});
        let wire = encrypt(&payload, &device).unwrap();
        let decrypted = decrypt(&wire, &device).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn sign_is_sixteen_lowercase_hex_chars() {
        let sig = md5_sign_hex(b"result=abc||t=1||key");
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn mqtt_round_trip_both_versions() {
        let device = Device::new("u", [b'K'; 32], [b'P'; 64]);
        let payload = serde_json::json!({"protocol": 15, "data": {"firmwareType": 0}});

        let wire21 = mqtt_encrypt(&payload, &device, MqttProtocolVersion::V21, 1_700_000_000.0)
            .unwrap();
        assert_eq!(&wire21[0..3], b"2.1");
        assert_eq!(mqtt_decrypt(&wire21, &device).unwrap(), payload);

        let wire22 = mqtt_encrypt(&payload, &device, MqttProtocolVersion::V22, 1_700_000_000.0)
            .unwrap();
        assert_eq!(&wire22[0..3], b"2.2");
        assert_eq!(mqtt_decrypt(&wire22, &device).unwrap(), payload);
    }

    #[test]
    fn encryption_type_zero_is_unsupported() {
        let device = Device::new("u", [b'K'; 32], [b'P'; 64]);
        let req = crate::http::request::Request::builder("POST", "/d.json")
            .query("uuid", device.uuid.clone())
            .query("et", "0")
            .build();
        let mut registry = crate::device::DeviceRegistry::new();
        registry.register(device);
        let err = registry.resolve_request(&req).unwrap_err();
        assert!(matches!(err, crate::device::DeviceError::Unsupported(0)));
    }
}
