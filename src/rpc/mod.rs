mod client;
mod jws;
pub mod resources;

pub use client::DirectoryClient;

use thiserror::Error;

use crate::keys::{CryptoError, KeyPair};
use resources::{AuthorizationResource, ChallengeResource, OrderResource, RegistrationHandle};

/// Borrowed signing context for requests made on behalf of a bound account.
#[derive(Clone, Copy)]
pub struct AccountSession<'a> {
    pub key: &'a KeyPair,
    pub account_url: &'a str,
}

#[derive(Error, Debug)]
pub enum RpcError {
    /// The directory already has an account for this key; retrieve it
    /// instead of registering.
    #[error("account already exists at this directory")]
    AccountExists,
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("CA rejected request to {url} ({status} {type_uri}): {detail}")]
    Protocol {
        url: String,
        status: u16,
        type_uri: String,
        detail: String,
    },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("gave up polling {url} after {attempts} attempt(s) over {elapsed_ms}ms: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        elapsed_ms: u128,
        last: String,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The CA-facing capability the engine drives. `DirectoryClient` speaks the
/// real protocol; tests substitute scripted implementations.
pub trait AcmeRpc: Send + Sync {
    /// Terms-of-service URL advertised by the directory, when present.
    fn terms_of_service(&self) -> Option<String> {
        None
    }

    /// Creates an account bound to `key`. Implementations signal
    /// `RpcError::AccountExists` when the directory already knows the key.
    fn register_account(
        &self,
        key: &KeyPair,
        contact_email: &str,
        terms_agreed: bool,
    ) -> Result<RegistrationHandle, RpcError>;

    /// Retrieves the registration already bound to `key`.
    fn fetch_existing_account(&self, key: &KeyPair) -> Result<RegistrationHandle, RpcError>;

    fn new_order(
        &self,
        session: &AccountSession<'_>,
        domains: &[String],
    ) -> Result<OrderResource, RpcError>;

    fn fetch_authorization(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<AuthorizationResource, RpcError>;

    /// Re-fetches an authorization from inside the poll loop. Split from
    /// `fetch_authorization` so instrumented implementations can observe
    /// polling traffic separately; the wire call is the same.
    fn poll_authorization(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<AuthorizationResource, RpcError> {
        self.fetch_authorization(session, url)
    }

    /// Tells the CA a challenge proof is in place and ready to be probed.
    fn ready_challenge(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<ChallengeResource, RpcError>;

    fn finalize_order(
        &self,
        session: &AccountSession<'_>,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderResource, RpcError>;

    fn fetch_order(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<OrderResource, RpcError>;

    /// Downloads the PEM chain for a finalized order.
    fn fetch_certificate(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<String, RpcError>;

    fn revoke_certificate(
        &self,
        session: &AccountSession<'_>,
        cert_der: &[u8],
        reason_code: u32,
    ) -> Result<(), RpcError>;
}
