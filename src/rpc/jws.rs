//! JWS request bodies for ACME POSTs (RFC 8555 §6.2).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;

use crate::keys::{CryptoError, KeyPair};

/// Builds the flattened JSON serialization of a signed request body.
/// Before an account is bound the full JWK goes into the protected header;
/// afterwards `kid` carries the account URL. A `None` payload produces the
/// empty payload of a POST-as-GET.
pub fn sign_request(
    key: &KeyPair,
    kid: Option<&str>,
    nonce: &str,
    url: &str,
    payload: Option<&serde_json::Value>,
) -> Result<String, CryptoError> {
    let protected = match kid {
        Some(kid) => json!({
            "alg": "ES384",
            "kid": kid,
            "nonce": nonce,
            "url": url,
        }),
        None => json!({
            "alg": "ES384",
            "jwk": key.jwk()?,
            "nonce": nonce,
            "url": url,
        }),
    };

    let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload_b64 = match payload {
        Some(value) => URL_SAFE_NO_PAD.encode(value.to_string()),
        None => String::new(),
    };

    let signing_input = format!("{protected_b64}.{payload_b64}");
    let signature = key.sign_es384(signing_input.as_bytes())?;

    let body = json!({
        "protected": protected_b64,
        "payload": payload_b64,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    });
    Ok(body.to_string())
}
