use std::sync::Arc;

use log::{debug, info};

use super::store::{ChallengeRecord, ChallengeStore, PresentOutcome};
use super::{ChallengeProvider, ChallengeType, ProviderError, http_challenge_path};

/// HTTP-01 provider: records the key authorization the CA's prober expects
/// at the token's well-known path. Serving the path over plain HTTP is the
/// web front-end's job; this keeps the map it reads from.
pub struct Http01Provider {
    store: Arc<ChallengeStore>,
}

impl Http01Provider {
    pub fn new(store: Arc<ChallengeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ChallengeStore> {
        &self.store
    }

    /// Response body for a well-known path lookup while the token is
    /// pending.
    pub fn stored_key_auth(&self, token: &str) -> Option<String> {
        self.store.content_for_token(token)
    }
}

impl ChallengeProvider for Http01Provider {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Http01
    }

    fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), ProviderError> {
        let record = ChallengeRecord::new(ChallengeType::Http01, domain, key_auth, token);
        match self.store.present(record) {
            PresentOutcome::Inserted => {
                info!(
                    "[http-01] published {} for {domain}",
                    http_challenge_path(token)
                );
                Ok(())
            }
            PresentOutcome::Duplicate => {
                debug!("[http-01] proof for {domain} already published");
                Ok(())
            }
            PresentOutcome::Conflict => Err(ProviderError::Conflict {
                domain: domain.to_string(),
                challenge_type: ChallengeType::Http01,
            }),
        }
    }

    fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), ProviderError> {
        self.store.clean_up(domain, key_auth);
        debug!(
            "[http-01] cleaned up {} for {domain}",
            http_challenge_path(token)
        );
        Ok(())
    }

    fn mark_validated(&self, domain: &str, _token: &str, key_auth: &str) {
        self.store.mark_verified(domain, key_auth);
    }
}
