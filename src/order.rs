use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;
use x509_parser::pem::parse_x509_pem;

use crate::account::{Account, AccountError};
use crate::cancel::CancelToken;
use crate::challenge::{ChallengeProvider, ChallengeType, ProviderError, key_authorization};
use crate::keys::{self, CryptoError};
use crate::retry::PollSchedule;
use crate::rpc::resources::{AuthorizationStatus, OrderResource, OrderStatus, Problem};
use crate::rpc::{AccountSession, AcmeRpc, RpcError};

/// Issued certificate material handed back to the caller. The engine keeps
/// no reference to it after return; persistence is the caller's job.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    /// Leaf certificate PEM.
    pub certificate: String,
    /// Full chain PEM as served by the CA.
    pub chain: String,
    /// PEM of the key pair the certificate was issued for.
    pub private_key: String,
    /// Finalize URL of the issuing order.
    pub finalize_url: String,
    /// Location the chain was downloaded from, when the CA provided one.
    pub certificate_url: Option<String>,
    /// Leaf expiry, when the leaf parses as X.509.
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("invalid issuance request: {0}")]
    InvalidDomains(String),
    #[error("no provider registered for {challenge_type}")]
    NoProvider { challenge_type: ChallengeType },
    #[error("CA offered no {challenge_type} challenge for {domain}")]
    NoMatchingChallenge {
        domain: String,
        challenge_type: ChallengeType,
    },
    #[error("validation failed for {domain}: {reason}")]
    ChallengeValidationFailed { domain: String, reason: String },
    #[error("order became invalid during finalization")]
    OrderInvalid,
    #[error("finalized order exposed no certificate URL")]
    MissingCertificateUrl,
    #[error("issued chain is not usable PEM: {0}")]
    BadCertificateChain(String),
    #[error("issuance cancelled")]
    Cancelled,
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// One challenge chosen and published for an authorization; doubles as the
/// cleanup obligation for that authorization.
struct SelectedChallenge {
    domain: String,
    authorization_url: String,
    challenge_url: String,
    token: String,
    key_auth: String,
}

/// Drives one order through request → authorizations → challenge selection →
/// publication → polling → finalization → download, strictly in that
/// sequence, and releases every published proof on the way out no matter
/// how the order ends.
pub struct OrderCoordinator {
    rpc: Arc<dyn AcmeRpc>,
    providers: Vec<Arc<dyn ChallengeProvider>>,
    schedule: PollSchedule,
}

impl OrderCoordinator {
    pub fn new(
        rpc: Arc<dyn AcmeRpc>,
        providers: Vec<Arc<dyn ChallengeProvider>>,
        schedule: PollSchedule,
    ) -> Self {
        Self {
            rpc,
            providers,
            schedule,
        }
    }

    fn provider_for(
        &self,
        challenge_type: ChallengeType,
    ) -> Result<&Arc<dyn ChallengeProvider>, IssuanceError> {
        self.providers
            .iter()
            .find(|provider| provider.challenge_type() == challenge_type)
            .ok_or(IssuanceError::NoProvider { challenge_type })
    }

    pub fn issue(
        &self,
        account: &Account,
        domains: &[String],
        challenge_type: ChallengeType,
        cancel: &CancelToken,
    ) -> Result<CertificateBundle, IssuanceError> {
        let provider = self.provider_for(challenge_type)?;
        let order_id = Uuid::new_v4().as_simple().to_string();
        let mut published = Vec::new();
        let result = self.run(
            account,
            domains,
            challenge_type,
            provider.as_ref(),
            &mut published,
            cancel,
            &order_id,
        );
        self.release_published(provider.as_ref(), &published, &order_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        account: &Account,
        domains: &[String],
        challenge_type: ChallengeType,
        provider: &dyn ChallengeProvider,
        published: &mut Vec<SelectedChallenge>,
        cancel: &CancelToken,
        order_id: &str,
    ) -> Result<CertificateBundle, IssuanceError> {
        let session = account.session();
        info!("[order {order_id}] requesting order for {domains:?}");
        let order = self.rpc.new_order(&session, domains)?;

        // Inspect every authorization and choose the requested challenge
        // type for each before publishing anything.
        let thumbprint = account.key().thumbprint()?;
        let mut selected = Vec::with_capacity(order.authorizations.len());
        for authorization_url in &order.authorizations {
            let authorization = self.rpc.fetch_authorization(&session, authorization_url)?;
            let domain = authorization.identifier.value.clone();
            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.challenge_type == challenge_type.as_str())
                .ok_or_else(|| IssuanceError::NoMatchingChallenge {
                    domain: domain.clone(),
                    challenge_type,
                })?;
            selected.push(SelectedChallenge {
                domain,
                authorization_url: authorization_url.clone(),
                challenge_url: challenge.url.clone(),
                key_auth: key_authorization(&challenge.token, &thumbprint),
                token: challenge.token.clone(),
            });
        }

        for challenge in selected {
            provider.present(&challenge.domain, &challenge.token, &challenge.key_auth)?;
            debug!(
                "[order {order_id}] published {challenge_type} proof for {}",
                challenge.domain
            );
            published.push(challenge);
        }
        for challenge in published.iter() {
            self.rpc.ready_challenge(&session, &challenge.challenge_url)?;
        }

        // One authorization at a time; a single invalid fails the order.
        for challenge in published.iter() {
            self.await_authorization(&session, challenge, provider, cancel, order_id)?;
        }

        // All valid: finalize with a fresh key, independent of the account
        // key, then follow the order to its certificate.
        let certificate_key = keys::generate_key()?;
        let csr = keys::build_csr(domains, &certificate_key)?;
        info!("[order {order_id}] all authorizations valid; finalizing");
        let finalize_url = order.finalize.clone();
        let finalized = self.rpc.finalize_order(&session, &finalize_url, &csr)?;
        let ready = self.await_order(&session, &order, finalized, cancel, order_id)?;

        let certificate_url = ready
            .certificate
            .clone()
            .ok_or(IssuanceError::MissingCertificateUrl)?;
        let chain = self.rpc.fetch_certificate(&session, &certificate_url)?;
        let (certificate, not_after) = split_leaf(&chain)?;
        info!("[order {order_id}] certificate issued");

        Ok(CertificateBundle {
            certificate,
            chain,
            private_key: certificate_key.to_pkcs8_pem()?,
            finalize_url,
            certificate_url: Some(certificate_url),
            not_after,
        })
    }

    fn await_authorization(
        &self,
        session: &AccountSession<'_>,
        challenge: &SelectedChallenge,
        provider: &dyn ChallengeProvider,
        cancel: &CancelToken,
        order_id: &str,
    ) -> Result<(), IssuanceError> {
        let started = Instant::now();
        let mut backoff = self.schedule.backoff();
        let mut attempts = 0u32;
        let mut last_failure = String::from("authorization still pending");

        loop {
            if cancel.is_cancelled() {
                return Err(IssuanceError::Cancelled);
            }
            attempts += 1;
            match self
                .rpc
                .poll_authorization(session, &challenge.authorization_url)
            {
                Ok(authorization) => match authorization.status {
                    AuthorizationStatus::Valid => {
                        debug!(
                            "[order {order_id}] authorization valid for {} after {attempts} poll(s)",
                            challenge.domain
                        );
                        provider.mark_validated(
                            &challenge.domain,
                            &challenge.token,
                            &challenge.key_auth,
                        );
                        return Ok(());
                    }
                    AuthorizationStatus::Invalid => {
                        let reason = authorization
                            .challenges
                            .iter()
                            .filter_map(|challenge| challenge.error.as_ref())
                            .map(Problem::description)
                            .next()
                            .unwrap_or_else(|| "authorization reported invalid".to_string());
                        warn!(
                            "[order {order_id}] authorization invalid for {}: {reason}",
                            challenge.domain
                        );
                        return Err(IssuanceError::ChallengeValidationFailed {
                            domain: challenge.domain.clone(),
                            reason,
                        });
                    }
                    AuthorizationStatus::Pending => {
                        last_failure = "authorization still pending".to_string();
                    }
                    other => {
                        // deactivated / expired / revoked cannot recover
                        return Err(IssuanceError::ChallengeValidationFailed {
                            domain: challenge.domain.clone(),
                            reason: format!("authorization entered {other:?} state"),
                        });
                    }
                },
                Err(err) => {
                    // RPC failures inside the poll loop are retried until
                    // the schedule ceiling.
                    warn!(
                        "[order {order_id}] poll failed for {}: {err}",
                        challenge.domain
                    );
                    last_failure = err.to_string();
                }
            }

            let delay = backoff.next_delay();
            if started.elapsed() + delay > self.schedule.ceiling {
                return Err(RpcError::Exhausted {
                    url: challenge.authorization_url.clone(),
                    attempts,
                    elapsed_ms: started.elapsed().as_millis(),
                    last: last_failure,
                }
                .into());
            }
            if cancel.sleep(delay) {
                return Err(IssuanceError::Cancelled);
            }
        }
    }

    /// Follows the order through `processing` after finalization until the
    /// CA reports it valid.
    fn await_order(
        &self,
        session: &AccountSession<'_>,
        order: &OrderResource,
        mut current: OrderResource,
        cancel: &CancelToken,
        order_id: &str,
    ) -> Result<OrderResource, IssuanceError> {
        let poll_url = if current.url.is_empty() {
            order.url.clone()
        } else {
            current.url.clone()
        };
        let started = Instant::now();
        let mut backoff = self.schedule.backoff();
        let mut attempts = 0u32;
        let mut last_failure = String::from("order still processing");

        loop {
            match current.status {
                OrderStatus::Valid => return Ok(current),
                OrderStatus::Invalid => {
                    warn!("[order {order_id}] order reported invalid after finalization");
                    return Err(IssuanceError::OrderInvalid);
                }
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {}
            }
            if poll_url.is_empty() {
                return Err(RpcError::Malformed {
                    url: order.finalize.clone(),
                    reason: "no order URL to poll after finalization".to_string(),
                }
                .into());
            }

            let delay = backoff.next_delay();
            if started.elapsed() + delay > self.schedule.ceiling {
                return Err(RpcError::Exhausted {
                    url: poll_url,
                    attempts,
                    elapsed_ms: started.elapsed().as_millis(),
                    last: last_failure,
                }
                .into());
            }
            if cancel.sleep(delay) {
                return Err(IssuanceError::Cancelled);
            }

            attempts += 1;
            match self.rpc.fetch_order(session, &poll_url) {
                Ok(order) => current = order,
                Err(err) => {
                    warn!("[order {order_id}] order poll failed: {err}");
                    last_failure = err.to_string();
                }
            }
        }
    }

    /// Best-effort release of everything this order published. Failures are
    /// logged, never propagated; the issuance result stays authoritative.
    fn release_published(
        &self,
        provider: &dyn ChallengeProvider,
        published: &[SelectedChallenge],
        order_id: &str,
    ) {
        for challenge in published {
            if let Err(err) =
                provider.clean_up(&challenge.domain, &challenge.token, &challenge.key_auth)
            {
                warn!(
                    "[order {order_id}] cleanup failed for {}: {err}",
                    challenge.domain
                );
            }
        }
    }
}

fn split_leaf(chain_pem: &str) -> Result<(String, Option<DateTime<Utc>>), IssuanceError> {
    let blocks = pem::parse_many(chain_pem.as_bytes())
        .map_err(|err| IssuanceError::BadCertificateChain(err.to_string()))?;
    let leaf = blocks
        .first()
        .ok_or_else(|| IssuanceError::BadCertificateChain("empty chain".to_string()))?;
    let leaf_pem = pem::encode(leaf);
    let not_after = match parse_x509_pem(leaf_pem.as_bytes()) {
        Ok((_, block)) => block.parse_x509().ok().and_then(|cert| {
            Utc.timestamp_opt(cert.validity().not_after.timestamp(), 0)
                .single()
        }),
        Err(_) => None,
    };
    Ok((leaf_pem, not_after))
}
