//! Shared-access-signature minting and parsing.
//!
//! A signature string has the form
//! `SharedAccessSignature sr=<uri>&sig=<sig>&se=<expiry>[&skn=<name>]`
//! where `sr` is the percent-encoded resource URI, `sig` the percent-encoded
//! base64 HMAC-SHA256 of `"<encoded-uri>\n<expiry>"` under the base64-decoded
//! device key, and `se` the unix expiry in seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

use crate::AuthError;

/// Signatures are minted valid for one hour from the minting instant.
pub const SAS_TOKEN_LIFETIME_SECS: u64 = 60 * 60;

const SAS_PREFIX: &str = "SharedAccessSignature ";

// Keep unreserved URI characters readable in the encoded form.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

/// A parsed (or freshly minted) shared access signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedAccessSignature {
    /// Decoded resource URI, `<host>/devices/<device-id>`
    pub resource_uri: String,
    /// Hub host extracted from the resource URI
    pub host_name: String,
    /// Device id extracted from the resource URI path
    pub device_id: String,
    /// Unix expiry, seconds
    pub expiry: u64,
    /// The full signature string as sent on the wire
    pub raw: String,
}

impl SharedAccessSignature {
    /// Mint a signature for `resource_uri` under the base64 `key`, valid
    /// [`SAS_TOKEN_LIFETIME_SECS`] from now.
    pub fn mint(resource_uri: &str, key_b64: &str) -> Result<Self, AuthError> {
        let expiry = unix_now() + SAS_TOKEN_LIFETIME_SECS;
        Self::mint_at(resource_uri, key_b64, expiry)
    }

    /// Mint a signature with an explicit expiry instant.
    pub fn mint_at(resource_uri: &str, key_b64: &str, expiry: u64) -> Result<Self, AuthError> {
        if resource_uri.is_empty() {
            return Err(AuthError::MissingField("resource URI"));
        }
        let key = BASE64.decode(key_b64).map_err(|_| AuthError::InvalidKey)?;

        let encoded_uri = utf8_percent_encode(resource_uri, URI_ENCODE_SET).to_string();
        let to_sign = format!("{encoded_uri}\n{expiry}");

        let mut mac =
            HmacSha256::new_from_slice(&key).map_err(|_| AuthError::InvalidKey)?;
        mac.update(to_sign.as_bytes());
        let sig_b64 = BASE64.encode(mac.finalize().into_bytes());
        let encoded_sig = utf8_percent_encode(&sig_b64, URI_ENCODE_SET).to_string();

        let raw = format!("{SAS_PREFIX}sr={encoded_uri}&sig={encoded_sig}&se={expiry}");
        let (host_name, device_id) = split_resource_uri(resource_uri)?;

        Ok(Self {
            resource_uri: resource_uri.to_string(),
            host_name,
            device_id,
            expiry,
            raw,
        })
    }

    /// Parse a raw signature string, percent-decoding its resource URI and
    /// extracting host and device id from the path segments.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let body = raw
            .strip_prefix(SAS_PREFIX)
            .ok_or(AuthError::Malformed {
                field: "signature",
                reason: "missing SharedAccessSignature prefix".into(),
            })?;

        let mut sr = None;
        let mut se = None;
        let mut sig = None;
        for pair in body.split('&') {
            let (key, value) = pair.split_once('=').ok_or(AuthError::Malformed {
                field: "signature",
                reason: format!("field without '=': {pair}"),
            })?;
            match key {
                "sr" => sr = Some(value),
                "se" => se = Some(value),
                "sig" => sig = Some(value),
                _ => {}
            }
        }

        let sr = sr.ok_or(AuthError::MissingField("sr"))?;
        if sig.is_none() {
            return Err(AuthError::MissingField("sig"));
        }
        let expiry = se
            .ok_or(AuthError::MissingField("se"))?
            .parse::<u64>()
            .map_err(|e| AuthError::Malformed {
                field: "se",
                reason: e.to_string(),
            })?;

        let resource_uri = percent_decode_str(sr)
            .decode_utf8()
            .map_err(|e| AuthError::Malformed {
                field: "sr",
                reason: e.to_string(),
            })?
            .into_owned();
        let (host_name, device_id) = split_resource_uri(&resource_uri)?;

        Ok(Self {
            resource_uri,
            host_name,
            device_id,
            expiry,
            raw: raw.to_string(),
        })
    }

    /// Whether the signature has expired at `now` (unix seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }

    /// Time left until expiry from `now`, zero when already expired.
    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_secs(self.expiry.saturating_sub(now))
    }
}

/// Split `<host>/devices/<device-id>` into host and device id.
fn split_resource_uri(uri: &str) -> Result<(String, String), AuthError> {
    let mut segments = uri.split('/');
    let host = segments.next().unwrap_or_default();
    let devices = segments.next();
    let device_id = segments.next();
    match (host, devices, device_id) {
        (h, Some("devices"), Some(d)) if !h.is_empty() && !d.is_empty() => {
            Ok((h.to_string(), d.to_string()))
        }
        _ => Err(AuthError::Malformed {
            field: "sr",
            reason: format!("expected <host>/devices/<device-id>, got {uri}"),
        }),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "c2VjcmV0LWtleQ=="; // "secret-key"

    #[test]
    fn mint_has_expected_shape() {
        let sas =
            SharedAccessSignature::mint_at("myhub.wirehub.net/devices/dev-1", KEY, 1700000000)
                .unwrap();
        assert!(sas.raw.starts_with("SharedAccessSignature sr="));
        assert!(sas.raw.contains("myhub.wirehub.net%2Fdevices%2Fdev-1"));
        assert!(sas.raw.ends_with("&se=1700000000"));
        assert_eq!(sas.host_name, "myhub.wirehub.net");
        assert_eq!(sas.device_id, "dev-1");
    }

    #[test]
    fn mint_is_deterministic_for_fixed_expiry() {
        let a = SharedAccessSignature::mint_at("h.example/devices/d", KEY, 42).unwrap();
        let b = SharedAccessSignature::mint_at("h.example/devices/d", KEY, 42).unwrap();
        assert_eq!(a.raw, b.raw);
    }

    #[test]
    fn parse_recovers_minted_fields() {
        let minted =
            SharedAccessSignature::mint_at("myhub.wirehub.net/devices/dev-1", KEY, 1700000000)
                .unwrap();
        let parsed = SharedAccessSignature::parse(&minted.raw).unwrap();
        assert_eq!(parsed.resource_uri, "myhub.wirehub.net/devices/dev-1");
        assert_eq!(parsed.host_name, "myhub.wirehub.net");
        assert_eq!(parsed.device_id, "dev-1");
        assert_eq!(parsed.expiry, 1700000000);
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!(matches!(
            SharedAccessSignature::parse("sr=a&sig=b&se=1"),
            Err(AuthError::Malformed { field: "signature", .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_resource_path() {
        let raw = "SharedAccessSignature sr=host-only&sig=abc&se=10";
        assert!(matches!(
            SharedAccessSignature::parse(raw),
            Err(AuthError::Malformed { field: "sr", .. })
        ));
    }

    #[test]
    fn mint_rejects_bad_key() {
        assert_eq!(
            SharedAccessSignature::mint_at("h/devices/d", "not base64!!!", 1).unwrap_err(),
            AuthError::InvalidKey
        );
    }

    #[test]
    fn expiry_checks() {
        let sas = SharedAccessSignature::mint_at("h/devices/d", KEY, 100).unwrap();
        assert!(!sas.is_expired(99));
        assert!(sas.is_expired(100));
        assert_eq!(sas.remaining(40), Duration::from_secs(60));
        assert_eq!(sas.remaining(200), Duration::ZERO);
    }

    #[test]
    fn mint_lifetime_is_one_hour() {
        let sas = SharedAccessSignature::mint("h/devices/d", KEY).unwrap();
        let now = unix_now();
        // Allow a little slack for the clock read inside mint().
        assert!(sas.expiry >= now + SAS_TOKEN_LIFETIME_SECS - 2);
        assert!(sas.expiry <= now + SAS_TOKEN_LIFETIME_SECS + 2);
    }
}
