//! Dynamic SNI certificate selection and TLS-PSK identity resolution,
//! spec §4.5. Built on `openssl` because `rustls` has no PSK cipher suite
//! support; the device firmware expects `PSK-AES128-CBC-SHA256` to be on
//! offer alongside ordinary SNI certificates on the same listener.

use std::sync::Arc;

use openssl::pkey::PKey;
use openssl::ssl::{NameType, Ssl, SslAcceptor, SslContext, SslMethod, SslVersion};
use openssl::x509::X509;
use regex::Regex;
use tracing::{debug, warn};

use crate::device::DeviceRegistry;

/// One `(identity_pattern, cert, key)` entry, tried in order (§3 `SslCertEntry`).
pub struct CertEntry {
    pub sni_pattern: Regex,
    pub cert: X509,
    pub key: PKey<openssl::pkey::Private>,
}

/// Resolves a PSK from an identity. `openssl`/`v1`/`v2` are the three
/// resolvers spec §4.5 requires be registered.
pub type PskResolver = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub struct PskEntry {
    pub identity_pattern: Regex,
    pub resolver: PskResolver,
}

#[derive(Default)]
pub struct TlsConfig {
    pub certs: Vec<CertEntry>,
    pub psks: Vec<PskEntry>,
    pub psk_hint: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cert(&mut self, entry: CertEntry) {
        self.certs.push(entry);
    }

    pub fn add_psk(&mut self, entry: PskEntry) {
        self.psks.push(entry);
    }

    fn resolve_cert(&self, sni: &str) -> Option<&CertEntry> {
        self.certs.iter().find(|e| e.sni_pattern.is_match(sni))
    }

    fn resolve_psk(&self, identity: &[u8]) -> Option<Vec<u8>> {
        for entry in &self.psks {
            let text = String::from_utf8_lossy(identity);
            if entry.identity_pattern.is_match(&text) {
                if let Some(psk) = (entry.resolver)(identity) {
                    return Some(psk);
                }
            }
        }
        None
    }

    /// Builds the `SslAcceptor` wired with the SNI callback and PSK server
    /// callback. The acceptor has no default certificate; every connection
    /// must either negotiate PSK or match an SNI pattern.
    pub fn build_acceptor(self: Arc<Self>) -> anyhow::Result<SslAcceptor> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(
            "PSK-AES128-CBC-SHA256:ECDHE-RSA-AES128-GCM-SHA256:AES128-GCM-SHA256",
        )?;

        if let Some(hint) = &self.psk_hint {
            builder.set_psk_identity_hint(hint)?;
        }

        let sni_config = Arc::clone(&self);
        builder.set_servername_callback(move |ssl, _alert| {
            let Some(sni) = ssl.servername(NameType::HOST_NAME) else {
                return Ok(());
            };
            match sni_config.resolve_cert(sni) {
                Some(entry) => {
                    let ctx = SslContext::builder(SslMethod::tls())
                        .map_err(|_| openssl::ssl::SniError::ALERT_FATAL)?;
                    let mut ctx = ctx;
                    ctx.set_certificate(&entry.cert)
                        .map_err(|_| openssl::ssl::SniError::ALERT_FATAL)?;
                    ctx.set_private_key(&entry.key)
                        .map_err(|_| openssl::ssl::SniError::ALERT_FATAL)?;
                    ssl.set_ssl_context(&ctx.build())
                        .map_err(|_| openssl::ssl::SniError::ALERT_FATAL)?;
                    debug!(sni, "SNI certificate selected");
                    Ok(())
                }
                None => {
                    warn!(sni, "no certificate matches SNI, continuing without one");
                    Ok(())
                }
            }
        });

        let psk_config = Arc::clone(&self);
        builder.set_psk_server_callback(move |_ssl, identity, psk_out| {
            let identity = identity.unwrap_or(&[]);
            match psk_config.resolve_psk(identity) {
                Some(psk) if psk.len() <= psk_out.len() => {
                    psk_out[..psk.len()].copy_from_slice(&psk);
                    Ok(psk.len())
                }
                _ => Ok(0),
            }
        });

        Ok(builder.build())
    }
}

/// Registers the three PSK resolvers impersonation logic relies on (§4.5,
/// §4.7), in the order they must be tried: `openssl` (identity is the ASCII
/// hex encoding of a type byte, matched on the literal `0x` prefix), `v1`
/// (raw identity begins with type byte `\x01`), `v2` (raw identity begins
/// with type byte `\x02`). Order is load-bearing: `resolve_psk` stops at the
/// first pattern match whose resolver returns `Some`.
pub fn register_psk_resolvers(config: &mut TlsConfig, registry: Arc<DeviceRegistry>) {
    let openssl_registry = Arc::clone(&registry);
    config.add_psk(PskEntry {
        identity_pattern: Regex::new(r"^0x[0-9A-Fa-f]+$").unwrap(),
        resolver: Arc::new(move |identity| calc_psk_openssl(&openssl_registry, identity)),
    });

    config.add_psk(PskEntry {
        identity_pattern: Regex::new(r"^\x01.+$").unwrap(),
        resolver: Arc::new(calc_psk_v1),
    });

    config.add_psk(PskEntry {
        identity_pattern: Regex::new(r"^\x02.+$").unwrap(),
        resolver: Arc::new(move |identity| calc_psk_v2(&registry, identity)),
    });
}

/// `calc_psk_v2`: identity is exactly 49 bytes; bytes `[17..49)` are a
/// PSK-id looked up in the registry.
pub fn calc_psk_v2(registry: &DeviceRegistry, identity: &[u8]) -> Option<Vec<u8>> {
    if identity.len() != 49 {
        return None;
    }
    let psk_id = &identity[17..49];
    registry.get_by_psk_id(psk_id).ok().map(|d| d.psk.to_vec())
}

/// `calc_psk_v1`: protocol-v1 devices are unsupported; must not crash the
/// handshake, so this returns an empty key rather than erroring (spec §4.7,
/// §9 Open Questions — the real v1 behavior is left undocumented upstream).
pub fn calc_psk_v1(_identity: &[u8]) -> Option<Vec<u8>> {
    Some(Vec::new())
}

/// `calc_psk_openssl`: strip the `0x` prefix, hex-decode, dispatch on the
/// leading type byte (`0x01` -> v1, `0x02` -> v2).
pub fn calc_psk_openssl(registry: &DeviceRegistry, identity: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(identity).ok()?;
    let hex_part = text.strip_prefix("0x")?;
    let decoded = hex::decode(hex_part).ok()?;
    match decoded.first()? {
        1 => calc_psk_v1(&decoded),
        2 => calc_psk_v2(registry, &decoded),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_identity_returns_empty_not_none() {
        assert_eq!(calc_psk_v1(b"anything"), Some(Vec::new()));
    }

    #[test]
    fn v2_rejects_wrong_length() {
        let registry = DeviceRegistry::new();
        assert_eq!(calc_psk_v2(&registry, b"short"), None);
    }
}
