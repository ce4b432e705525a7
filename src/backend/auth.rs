//! Signed device authentication for the two-phase gateway handshake

use crate::{Result, TalkbackError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

/// Paired device credentials
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// PKCS#8 PEM encoded Ed25519 private key
    pub private_key_pem: String,
}

impl DeviceIdentity {
    pub fn signing_key(&self) -> Result<SigningKey> {
        SigningKey::from_pkcs8_pem(&self.private_key_pem).map_err(|e| {
            TalkbackError::Connection(format!(
                "invalid Ed25519 key for device {}: {}",
                self.device_id, e
            ))
        })
    }
}

/// Client parameters covered by the signature
#[derive(Clone, Debug)]
pub struct AuthParams<'a> {
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [&'a str],
    pub token: &'a str,
    pub nonce: &'a str,
}

/// `device` block of the second connect request
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    pub nonce: String,
}

/// Canonical string the gateway verifies
pub fn auth_payload(device_id: &str, params: &AuthParams<'_>, signed_at_ms: i64) -> String {
    let scopes = params.scopes.join(",");
    let signed_at = signed_at_ms.to_string();
    [
        "v2",
        device_id,
        params.client_id,
        params.client_mode,
        params.role,
        scopes.as_str(),
        signed_at.as_str(),
        params.token,
        params.nonce,
    ]
    .join("|")
}

/// Sign the challenge; key and signature are base64url without padding
pub fn build_device_auth(
    key: &SigningKey,
    device_id: &str,
    params: &AuthParams<'_>,
    signed_at_ms: i64,
) -> DeviceAuth {
    let payload = auth_payload(device_id, params, signed_at_ms);
    let signature = key.sign(payload.as_bytes());

    DeviceAuth {
        id: device_id.to_string(),
        public_key: URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes()),
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        signed_at: signed_at_ms,
        nonce: params.nonce.to_string(),
    }
}
