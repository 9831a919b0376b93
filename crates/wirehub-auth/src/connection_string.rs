//! Device connection-string parsing.
//!
//! A connection string is a `;`-separated list of `Key=Value` pairs. The
//! recognised keys are `HostName`, `DeviceId`, `SharedAccessKey`,
//! `SharedAccessKeyName`, `SharedAccessSignature` and `x509`. The
//! authentication mode is derived from which credential key is present.

use crate::AuthError;

/// How the device authenticates against the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// A symmetric key; signatures are minted and rotated by the client.
    SharedKey,
    /// A client certificate; no signature is ever minted or rotated.
    X509,
    /// A pre-minted signature supplied by the caller (token service).
    Bearer,
}

/// Parsed device connection string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionString {
    /// Fully qualified hub host, e.g. `myhub.wirehub.net`
    pub host_name: String,
    /// Device identifier registered with the hub
    pub device_id: String,
    /// Hub name, the first DNS label of the host
    pub hub_name: String,
    /// Base64 symmetric key (shared-key mode)
    pub shared_access_key: Option<String>,
    /// Key name, present for policy-scoped keys
    pub shared_access_key_name: Option<String>,
    /// Pre-minted signature (bearer mode)
    pub shared_access_signature: Option<String>,
    /// Authentication mode derived from the fields above
    pub auth_mode: AuthMode,
}

impl ConnectionString {
    /// Parse a connection string.
    ///
    /// `HostName` and `DeviceId` are required, and exactly one credential
    /// source must be present: `SharedAccessKey`, `x509=true`, or
    /// `SharedAccessSignature`.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        if raw.trim().is_empty() {
            return Err(AuthError::MissingField("connection string"));
        }

        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;
        let mut shared_access_key_name = None;
        let mut shared_access_signature = None;
        let mut x509 = false;

        for segment in raw.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            // SharedAccessSignature values contain '=' themselves, so split once.
            let (key, value) = segment.split_once('=').ok_or(AuthError::Malformed {
                field: "connection string",
                reason: format!("segment without '=': {segment}"),
            })?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                "SharedAccessKeyName" => shared_access_key_name = Some(value.to_string()),
                "SharedAccessSignature" => shared_access_signature = Some(value.to_string()),
                "x509" => x509 = value.eq_ignore_ascii_case("true"),
                _ => {} // unknown keys are ignored for forward compatibility
            }
        }

        let host_name = host_name.ok_or(AuthError::MissingField("HostName"))?;
        let device_id = device_id.ok_or(AuthError::MissingField("DeviceId"))?;
        if host_name.is_empty() {
            return Err(AuthError::MissingField("HostName"));
        }
        if device_id.is_empty() {
            return Err(AuthError::MissingField("DeviceId"));
        }

        let hub_name = host_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        if hub_name.is_empty() {
            return Err(AuthError::Malformed {
                field: "HostName",
                reason: "no hub name label".into(),
            });
        }

        let auth_mode = if x509 {
            AuthMode::X509
        } else if shared_access_key.is_some() {
            AuthMode::SharedKey
        } else if shared_access_signature.is_some() {
            AuthMode::Bearer
        } else {
            return Err(AuthError::MissingField(
                "SharedAccessKey, SharedAccessSignature or x509",
            ));
        };

        Ok(Self {
            host_name,
            device_id,
            hub_name,
            shared_access_key,
            shared_access_key_name,
            shared_access_signature,
            auth_mode,
        })
    }

    /// Resource URI this device authenticates against: `<host>/devices/<id>`.
    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }
}
