use std::sync::Arc;

use crate::account::{AccountManager, TermsPolicy};
use crate::cancel::CancelToken;
use crate::challenge::{
    ChallengeProvider, ChallengeStore, ChallengeType, Dns01Provider, Http01Provider,
};
use crate::domain;
use crate::order::{CertificateBundle, IssuanceError, OrderCoordinator};
use crate::retry::PollSchedule;
use crate::revoke::{self, RevocationError, RevocationHandler};
use crate::rpc::{AcmeRpc, DirectoryClient, RpcError};

/// Let's Encrypt staging directory; the safe default for integrating
/// against a real CA without production rate limits.
pub const LETSENCRYPT_STAGING_DIRECTORY: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub directory_url: String,
    pub contact_email: String,
    pub poll: PollSchedule,
    pub ready_queue_capacity: usize,
}

impl EngineConfig {
    pub fn new(directory_url: impl Into<String>, contact_email: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email: contact_email.into(),
            poll: PollSchedule::default(),
            ready_queue_capacity: crate::challenge::DEFAULT_READY_CAPACITY,
        }
    }

    pub fn staging(contact_email: impl Into<String>) -> Self {
        Self::new(LETSENCRYPT_STAGING_DIRECTORY, contact_email)
    }
}

/// Top-level facade wiring the account manager, the per-type challenge
/// stores and providers, the order coordinator and the revocation handler
/// over one CA connection.
pub struct AcmeEngine {
    config: EngineConfig,
    rpc: Arc<dyn AcmeRpc>,
    accounts: AccountManager,
    coordinator: OrderCoordinator,
    revocation: RevocationHandler,
    http_store: Arc<ChallengeStore>,
    dns_store: Arc<ChallengeStore>,
    http_provider: Arc<Http01Provider>,
}

impl AcmeEngine {
    /// Connects to the configured directory with the real protocol client.
    pub fn connect(config: EngineConfig) -> Result<Self, RpcError> {
        let rpc = Arc::new(DirectoryClient::connect(&config.directory_url)?);
        Ok(Self::with_rpc(config, rpc))
    }

    /// Builds the engine over any CA capability; used by tests and
    /// embedders that bring their own transport.
    pub fn with_rpc(config: EngineConfig, rpc: Arc<dyn AcmeRpc>) -> Self {
        let http_store = Arc::new(ChallengeStore::with_capacity(config.ready_queue_capacity));
        let dns_store = Arc::new(ChallengeStore::with_capacity(config.ready_queue_capacity));
        let http_provider = Arc::new(Http01Provider::new(http_store.clone()));
        let dns_provider = Arc::new(Dns01Provider::new(dns_store.clone()));
        let providers: Vec<Arc<dyn ChallengeProvider>> =
            vec![http_provider.clone(), dns_provider];
        let coordinator = OrderCoordinator::new(rpc.clone(), providers, config.poll);
        let accounts = AccountManager::new(rpc.clone());
        let revocation = RevocationHandler::new(rpc.clone());
        Self {
            config,
            rpc,
            accounts,
            coordinator,
            revocation,
            http_store,
            dns_store,
            http_provider,
        }
    }

    /// Replaces the default accept-everything terms-of-service policy.
    pub fn with_terms_policy(mut self, terms: TermsPolicy) -> Self {
        self.accounts = AccountManager::with_terms_policy(self.rpc.clone(), terms);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Issues a certificate for the domain set using the requested
    /// challenge type, registering (or retrieving) an account for
    /// `contact_email` first.
    pub fn issue(
        &self,
        domains: Vec<String>,
        challenge_type: ChallengeType,
        contact_email: &str,
        cancel: &CancelToken,
    ) -> Result<CertificateBundle, IssuanceError> {
        let domains = domain::normalize_domain_set(domains)
            .map_err(|err| IssuanceError::InvalidDomains(err.to_string()))?;
        let account = self.accounts.ensure_account(contact_email)?;
        self.coordinator
            .issue(&account, &domains, challenge_type, cancel)
    }

    /// Revokes a previously issued certificate. The PEM is validated before
    /// any account or revocation RPC happens.
    pub fn revoke(&self, cert_pem: &[u8], reason_code: u32) -> Result<(), RevocationError> {
        revoke::decode_certificate(cert_pem)?;
        let account = self.accounts.ensure_account(&self.config.contact_email)?;
        self.revocation.revoke(cert_pem, &account, reason_code)
    }

    /// Diagnostic JSON export of the pending challenges for one type, each
    /// shaped `{type, identifier, content, verified}`.
    pub fn list_pending_challenges(
        &self,
        challenge_type: ChallengeType,
    ) -> serde_json::Result<String> {
        self.challenge_store(challenge_type).snapshot_json()
    }

    /// Store backing a challenge type, for collaborators that serve the
    /// proofs (web front-end, DNS publisher).
    pub fn challenge_store(&self, challenge_type: ChallengeType) -> &Arc<ChallengeStore> {
        match challenge_type {
            ChallengeType::Http01 => &self.http_store,
            ChallengeType::Dns01 => &self.dns_store,
        }
    }

    /// Response body for an HTTP-01 well-known path lookup.
    pub fn http_challenge_response(&self, token: &str) -> Option<String> {
        self.http_provider.stored_key_auth(token)
    }
}
