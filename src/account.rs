use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::keys::{self, CryptoError, KeyPair};
use crate::rpc::resources::RegistrationHandle;
use crate::rpc::{AccountSession, AcmeRpc, RpcError};

/// Predicate over the directory's terms-of-service URL. The default policy
/// accepts.
pub type TermsPolicy = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// An ACME account: one contact address bound to one key pair and the
/// CA-side registration handle. Immutable after creation.
#[derive(Debug)]
pub struct Account {
    email: String,
    key: KeyPair,
    registration: RegistrationHandle,
}

impl Account {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn registration(&self) -> &RegistrationHandle {
        &self.registration
    }

    pub fn session(&self) -> AccountSession<'_> {
        AccountSession {
            key: &self.key,
            account_url: &self.registration.url,
        }
    }

    /// Account key PEM for external persistence; required for reusing the
    /// same account across processes.
    pub fn key_pem(&self) -> Result<String, CryptoError> {
        self.key.to_pkcs8_pem()
    }
}

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("terms of service at {url} were not accepted")]
    TermsRejected { url: String },
    #[error("account registration failed")]
    RegistrationFailed {
        #[source]
        source: RpcError,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Registers accounts against the configured directory, falling back to
/// retrieval when the CA reports the key as already bound.
pub struct AccountManager {
    rpc: Arc<dyn AcmeRpc>,
    terms: TermsPolicy,
}

impl AccountManager {
    pub fn new(rpc: Arc<dyn AcmeRpc>) -> Self {
        Self {
            rpc,
            terms: Arc::new(|_| true),
        }
    }

    pub fn with_terms_policy(rpc: Arc<dyn AcmeRpc>, terms: TermsPolicy) -> Self {
        Self { rpc, terms }
    }

    /// Generates a fresh key and ensures a registration exists for it.
    /// Every call creates a new key; callers wanting account reuse persist
    /// `Account::key_pem` themselves.
    pub fn ensure_account(&self, contact_email: &str) -> Result<Account, AccountError> {
        let key = keys::generate_key()?;

        if let Some(tos_url) = self.rpc.terms_of_service() {
            if !(self.terms)(&tos_url) {
                return Err(AccountError::TermsRejected { url: tos_url });
            }
            debug!("[account] accepted terms of service at {tos_url}");
        }

        let registration = match self.rpc.register_account(&key, contact_email, true) {
            Ok(handle) => {
                info!("[account] registered {contact_email}");
                handle
            }
            Err(RpcError::AccountExists) => {
                info!(
                    "[account] key already bound; retrieving existing registration for {contact_email}"
                );
                self.rpc
                    .fetch_existing_account(&key)
                    .map_err(|source| AccountError::RegistrationFailed { source })?
            }
            Err(source) => return Err(AccountError::RegistrationFailed { source }),
        };

        Ok(Account {
            email: contact_email.to_string(),
            key,
            registration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::rpc::resources::{
        AuthorizationResource, ChallengeResource, OrderResource,
    };

    #[derive(Default)]
    struct StubRpc {
        register_exists: bool,
        reject_registration: bool,
        register_calls: Mutex<u32>,
        fetch_existing_calls: Mutex<u32>,
        tos_url: Option<String>,
    }

    impl AcmeRpc for StubRpc {
        fn terms_of_service(&self) -> Option<String> {
            self.tos_url.clone()
        }

        fn register_account(
            &self,
            _key: &KeyPair,
            _contact_email: &str,
            _terms_agreed: bool,
        ) -> Result<RegistrationHandle, RpcError> {
            *self.register_calls.lock().unwrap() += 1;
            if self.register_exists {
                return Err(RpcError::AccountExists);
            }
            if self.reject_registration {
                return Err(RpcError::Protocol {
                    url: "https://ca.test/acme/new-account".to_string(),
                    status: 400,
                    type_uri: "urn:ietf:params:acme:error:invalidContact".to_string(),
                    detail: "contact rejected".to_string(),
                });
            }
            Ok(RegistrationHandle {
                url: "https://ca.test/acct/1".to_string(),
            })
        }

        fn fetch_existing_account(&self, _key: &KeyPair) -> Result<RegistrationHandle, RpcError> {
            *self.fetch_existing_calls.lock().unwrap() += 1;
            Ok(RegistrationHandle {
                url: "https://ca.test/acct/1".to_string(),
            })
        }

        fn new_order(
            &self,
            _session: &AccountSession<'_>,
            _domains: &[String],
        ) -> Result<OrderResource, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn fetch_authorization(
            &self,
            _session: &AccountSession<'_>,
            _url: &str,
        ) -> Result<AuthorizationResource, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn ready_challenge(
            &self,
            _session: &AccountSession<'_>,
            _url: &str,
        ) -> Result<ChallengeResource, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn finalize_order(
            &self,
            _session: &AccountSession<'_>,
            _finalize_url: &str,
            _csr_der: &[u8],
        ) -> Result<OrderResource, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn fetch_order(
            &self,
            _session: &AccountSession<'_>,
            _url: &str,
        ) -> Result<OrderResource, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn fetch_certificate(
            &self,
            _session: &AccountSession<'_>,
            _url: &str,
        ) -> Result<String, RpcError> {
            unimplemented!("not used by account tests")
        }

        fn revoke_certificate(
            &self,
            _session: &AccountSession<'_>,
            _cert_der: &[u8],
            _reason_code: u32,
        ) -> Result<(), RpcError> {
            unimplemented!("not used by account tests")
        }
    }

    #[test]
    fn fresh_registration_binds_the_contact() {
        let manager = AccountManager::new(Arc::new(StubRpc::default()));
        let account = manager.ensure_account("a@b.com").unwrap();
        assert_eq!(account.email(), "a@b.com");
        assert_eq!(account.registration().url, "https://ca.test/acct/1");
        // The key PEM is exportable for external account reuse.
        assert!(account.key_pem().unwrap().contains("PRIVATE KEY"));
    }

    #[test]
    fn existing_account_is_retrieved_not_surfaced_as_error() {
        let rpc = Arc::new(StubRpc {
            register_exists: true,
            ..StubRpc::default()
        });
        let manager = AccountManager::new(rpc.clone());
        let account = manager.ensure_account("a@b.com").unwrap();
        // Same externally observable fields as a fresh registration.
        assert_eq!(account.email(), "a@b.com");
        assert_eq!(account.registration().url, "https://ca.test/acct/1");
        assert_eq!(*rpc.fetch_existing_calls.lock().unwrap(), 1);
    }

    #[test]
    fn other_rpc_failures_surface_as_registration_failed() {
        let manager = AccountManager::new(Arc::new(StubRpc {
            reject_registration: true,
            ..StubRpc::default()
        }));
        let err = manager.ensure_account("a@b.com").unwrap_err();
        assert!(matches!(err, AccountError::RegistrationFailed { .. }));
    }

    #[test]
    fn rejected_terms_stop_before_any_registration_call() {
        let rpc = Arc::new(StubRpc {
            tos_url: Some("https://ca.test/terms".to_string()),
            ..StubRpc::default()
        });
        let manager =
            AccountManager::with_terms_policy(rpc.clone(), Arc::new(|_| false));
        let err = manager.ensure_account("a@b.com").unwrap_err();
        assert!(matches!(err, AccountError::TermsRejected { .. }));
        assert_eq!(*rpc.register_calls.lock().unwrap(), 0);
    }

    #[test]
    fn each_call_generates_a_new_key() {
        let manager = AccountManager::new(Arc::new(StubRpc::default()));
        let first = manager.ensure_account("a@b.com").unwrap();
        let second = manager.ensure_account("a@b.com").unwrap();
        assert_ne!(
            first.key().thumbprint().unwrap(),
            second.key().thumbprint().unwrap()
        );
    }
}
