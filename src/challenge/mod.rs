use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod dns;
mod http;
mod store;

pub use dns::Dns01Provider;
pub use http::Http01Provider;
pub use store::{
    ChallengeRecord, ChallengeStore, DEFAULT_READY_CAPACITY, PresentOutcome,
};

/// Challenge types the engine can satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            other => Err(anyhow!("unsupported challenge type: {other}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    /// A different proof is already pending for the domain; two challenges
    /// for the same identifier cannot be in flight at once.
    #[error("a different {challenge_type} proof is already pending for {domain}")]
    Conflict {
        domain: String,
        challenge_type: ChallengeType,
    },
}

/// Capability implemented once per challenge type: publish a proof for a
/// domain, flip local bookkeeping once the CA confirms it, and release the
/// proof when the order reaches a terminal state.
pub trait ChallengeProvider: Send + Sync {
    fn challenge_type(&self) -> ChallengeType;

    /// Publishes the proof. Repeat calls with identical parameters are
    /// no-ops, never errors.
    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), ProviderError>;

    /// Removes the proof. Tolerates being called with no prior `present`.
    fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), ProviderError>;

    /// Called once the CA confirms the authorization. Default does nothing.
    fn mark_validated(&self, _domain: &str, _token: &str, _key_auth: &str) {}
}

/// Key authorization for a challenge token: `<token>.<account thumbprint>`.
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{token}.{thumbprint}")
}

/// TXT record value for DNS-01: base64url(SHA-256(key authorization)).
pub fn dns_txt_value(key_auth: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()))
}

/// Record name the DNS-01 TXT value must be published under.
pub fn dns_record_name(domain: &str) -> String {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.starts_with("_acme-challenge.") {
        trimmed.to_string()
    } else {
        format!("_acme-challenge.{trimmed}")
    }
}

/// Well-known path the CA's HTTP-01 prober fetches over plain HTTP.
pub fn http_challenge_path(token: &str) -> String {
    format!("/.well-known/acme-challenge/{token}")
}
