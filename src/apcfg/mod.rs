//! ApCfg wire framing (§3, §4.9): the unprovisioned device's UDP config
//! channel on port 6669.

pub mod payload;

use thiserror::Error;

const HEAD: u16 = 0x55AA;
const TAIL: u16 = 0xAA55;
pub const FRAME_TYPE_CONFIG: u16 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApCfgError {
    #[error("frame shorter than the 12-byte header+trailer minimum")]
    Truncated,
    #[error("bad magic header")]
    BadHead,
    #[error("bad magic trailer")]
    BadTail,
    #[error("declared length does not match the actual payload size")]
    LengthMismatch,
    #[error("CRC32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
}

/// A parsed/encoded ApCfg frame (§3 `ApCfgFrame`). The 8-byte header is
/// `{head: u16, frame_num: u16, frame_type: u16, length: u16}`, all
/// big-endian; `length` counts the header too (`8 + payload.len()`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApCfgFrame {
    pub frame_num: u16,
    pub frame_type: u16,
    pub payload: Vec<u8>,
}

impl ApCfgFrame {
    pub fn new(frame_num: u16, frame_type: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_num,
            frame_type,
            payload,
        }
    }

    /// Encodes the frame: big-endian `{head, frame_num, frame_type,
    /// length}`, the payload, then `{crc32, tail}`. The CRC covers every
    /// byte from `head` through the end of the payload.
    pub fn encode(&self) -> Vec<u8> {
        let length = (8 + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(8 + self.payload.len() + 6);
        out.extend_from_slice(&HEAD.to_be_bytes());
        out.extend_from_slice(&self.frame_num.to_be_bytes());
        out.extend_from_slice(&self.frame_type.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&TAIL.to_be_bytes());
        out
    }

    /// Decodes a frame, validating header magic, trailer magic, declared
    /// length, and CRC.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApCfgError> {
        if bytes.len() < 14 {
            return Err(ApCfgError::Truncated);
        }
        let head = u16::from_be_bytes([bytes[0], bytes[1]]);
        if head != HEAD {
            return Err(ApCfgError::BadHead);
        }
        let frame_num = u16::from_be_bytes([bytes[2], bytes[3]]);
        let frame_type = u16::from_be_bytes([bytes[4], bytes[5]]);
        let length = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

        if length < 8 || bytes.len() != length + 6 {
            return Err(ApCfgError::LengthMismatch);
        }

        let payload = bytes[8..length].to_vec();
        let header_and_payload = &bytes[0..length];
        let crc_bytes = &bytes[length..length + 4];
        let tail_bytes = &bytes[length + 4..length + 6];

        let tail = u16::from_be_bytes([tail_bytes[0], tail_bytes[1]]);
        if tail != TAIL {
            return Err(ApCfgError::BadTail);
        }

        let expected_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual_crc = crc32fast::hash(header_and_payload);
        if expected_crc != actual_crc {
            return Err(ApCfgError::CrcMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        Ok(Self {
            frame_num,
            frame_type,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = ApCfgFrame::new(7, FRAME_TYPE_CONFIG, b"hello world".to_vec());
        let bytes = frame.encode();
        assert_eq!(&bytes[0..2], &HEAD.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 2..], &TAIL.to_be_bytes());
        let decoded = ApCfgFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn crc_covers_header_and_payload() {
        let frame = ApCfgFrame::new(1, FRAME_TYPE_CONFIG, b"abc".to_vec());
        let bytes = frame.encode();
        let length = bytes.len() - 6;
        let crc_bytes = &bytes[length..length + 4];
        let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(&bytes[0..length]);
        assert_eq!(expected, actual);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let frame = ApCfgFrame::new(1, FRAME_TYPE_CONFIG, b"abc".to_vec());
        let mut bytes = frame.encode();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ApCfgFrame::decode(&bytes),
            Err(ApCfgError::CrcMismatch { .. })
        ));
    }
}
