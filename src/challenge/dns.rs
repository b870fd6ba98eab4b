use std::sync::Arc;

use log::{debug, info};

use super::store::{ChallengeRecord, ChallengeStore, PresentOutcome};
use super::{ChallengeProvider, ChallengeType, ProviderError, dns_record_name, dns_txt_value};

/// DNS-01 provider: computes the TXT digest for the key authorization and
/// tracks it for an external DNS publisher, signaling readiness through the
/// store's queue. No DNS API calls happen here.
pub struct Dns01Provider {
    store: Arc<ChallengeStore>,
}

impl Dns01Provider {
    pub fn new(store: Arc<ChallengeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ChallengeStore> {
        &self.store
    }
}

impl ChallengeProvider for Dns01Provider {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Dns01
    }

    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), ProviderError> {
        let value = dns_txt_value(key_auth);
        let record = ChallengeRecord::new(ChallengeType::Dns01, domain, value.clone(), token);
        match self.store.present(record) {
            PresentOutcome::Inserted => {
                info!(
                    "[dns-01] TXT {} = {value} ready for publication",
                    dns_record_name(domain)
                );
                Ok(())
            }
            PresentOutcome::Duplicate => {
                debug!("[dns-01] TXT record for {domain} already tracked");
                Ok(())
            }
            PresentOutcome::Conflict => Err(ProviderError::Conflict {
                domain: domain.to_string(),
                challenge_type: ChallengeType::Dns01,
            }),
        }
    }

    fn clean_up(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), ProviderError> {
        self.store.clean_up(domain, &dns_txt_value(key_auth));
        debug!("[dns-01] cleaned up TXT record for {domain}");
        Ok(())
    }

    fn mark_validated(&self, domain: &str, _token: &str, key_auth: &str) {
        self.store.mark_verified(domain, &dns_txt_value(key_auth));
    }
}
