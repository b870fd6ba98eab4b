use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, info, warn};
use serde_json::json;

use crate::keys::KeyPair;

use super::resources::{
    AuthorizationResource, ChallengeResource, Directory, OrderResource, Problem,
    RegistrationHandle,
};
use super::{AccountSession, AcmeRpc, RpcError, jws};

const REPLAY_NONCE_HEADER: &str = "replay-nonce";
const JOSE_CONTENT_TYPE: &str = "application/jose+json";
const BAD_NONCE_TYPE: &str = "urn:ietf:params:acme:error:badNonce";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Speaks RFC 8555 to one CA directory: endpoint discovery at construction,
/// a pooled replay nonce per request, ES384-signed JWS bodies, problem+json
/// decoding. Each HTTP call carries the agent-level timeout, independent of
/// the engine's polling ceiling.
pub struct DirectoryClient {
    agent: ureq::Agent,
    directory: Directory,
    directory_url: String,
    nonces: Mutex<Vec<String>>,
}

impl DirectoryClient {
    /// Fetches the directory document and prepares the client.
    pub fn connect(directory_url: &str) -> Result<Self, RpcError> {
        let agent = ureq::AgentBuilder::new()
            .timeout(resolve_http_timeout())
            .build();
        let response = agent
            .get(directory_url)
            .call()
            .map_err(|err| transport(directory_url, &err))?;
        let directory: Directory = response.into_json().map_err(|err| RpcError::Malformed {
            url: directory_url.to_string(),
            reason: err.to_string(),
        })?;
        info!("[rpc] connected to directory {directory_url}");
        Ok(Self {
            agent,
            directory,
            directory_url: directory_url.to_string(),
            nonces: Mutex::new(Vec::new()),
        })
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn take_nonce(&self) -> Result<String, RpcError> {
        if let Some(nonce) = lock(&self.nonces).pop() {
            return Ok(nonce);
        }
        let url = self.directory.new_nonce.clone();
        let response = self
            .agent
            .head(&url)
            .call()
            .map_err(|err| transport(&url, &err))?;
        response
            .header(REPLAY_NONCE_HEADER)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed {
                url,
                reason: "no replay-nonce header".to_string(),
            })
    }

    fn remember_nonce(&self, response: &ureq::Response) {
        if let Some(nonce) = response.header(REPLAY_NONCE_HEADER) {
            lock(&self.nonces).push(nonce.to_string());
        }
    }

    /// Signed POST (POST-as-GET for a `None` payload) with one transparent
    /// retry when the CA reports a stale nonce.
    fn signed_post(
        &self,
        key: &KeyPair,
        kid: Option<&str>,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<ureq::Response, RpcError> {
        let mut retried = false;
        loop {
            let nonce = self.take_nonce()?;
            let body = jws::sign_request(key, kid, &nonce, url, payload)?;
            match self
                .agent
                .post(url)
                .set("Content-Type", JOSE_CONTENT_TYPE)
                .send_string(&body)
            {
                Ok(response) => {
                    self.remember_nonce(&response);
                    return Ok(response);
                }
                Err(ureq::Error::Status(status, response)) => {
                    self.remember_nonce(&response);
                    let problem: Problem = response.into_json().unwrap_or_default();
                    if problem.type_uri.as_deref() == Some(BAD_NONCE_TYPE) && !retried {
                        debug!("[rpc] stale nonce for {url}; retrying once");
                        retried = true;
                        continue;
                    }
                    return Err(protocol(url, status, &problem));
                }
                Err(err) => return Err(transport(url, &err)),
            }
        }
    }

    fn post_as_get<T: serde::de::DeserializeOwned>(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<T, RpcError> {
        let response = self.signed_post(session.key, Some(session.account_url), url, None)?;
        response.into_json().map_err(|err| RpcError::Malformed {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

impl AcmeRpc for DirectoryClient {
    fn terms_of_service(&self) -> Option<String> {
        self.directory
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.clone())
    }

    fn register_account(
        &self,
        key: &KeyPair,
        contact_email: &str,
        terms_agreed: bool,
    ) -> Result<RegistrationHandle, RpcError> {
        let url = self.directory.new_account.clone();
        let payload = json!({
            "termsOfServiceAgreed": terms_agreed,
            "contact": [format!("mailto:{contact_email}")],
        });
        let response = self.signed_post(key, None, &url, Some(&payload))?;
        // 200 instead of 201 means the key is already bound (RFC 8555 §7.3).
        if response.status() == 200 {
            debug!("[rpc] newAccount returned 200 for {contact_email}");
            return Err(RpcError::AccountExists);
        }
        let location = require_location(&url, &response)?;
        info!("[rpc] account registered at {location}");
        Ok(RegistrationHandle { url: location })
    }

    fn fetch_existing_account(&self, key: &KeyPair) -> Result<RegistrationHandle, RpcError> {
        let url = self.directory.new_account.clone();
        let payload = json!({ "onlyReturnExisting": true });
        let response = self.signed_post(key, None, &url, Some(&payload))?;
        let location = require_location(&url, &response)?;
        Ok(RegistrationHandle { url: location })
    }

    fn new_order(
        &self,
        session: &AccountSession<'_>,
        domains: &[String],
    ) -> Result<OrderResource, RpcError> {
        let url = self.directory.new_order.clone();
        let identifiers: Vec<serde_json::Value> = domains
            .iter()
            .map(|domain| json!({"type": "dns", "value": domain}))
            .collect();
        let payload = json!({ "identifiers": identifiers });
        let response = self.signed_post(session.key, Some(session.account_url), &url, Some(&payload))?;
        let location = response
            .header("location")
            .unwrap_or_default()
            .to_string();
        let mut order: OrderResource =
            response.into_json().map_err(|err| RpcError::Malformed {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        order.url = location;
        info!(
            "[rpc] order created for {} identifier(s), status {:?}",
            order.identifiers.len(),
            order.status
        );
        Ok(order)
    }

    fn fetch_authorization(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<AuthorizationResource, RpcError> {
        self.post_as_get(session, url)
    }

    fn ready_challenge(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<ChallengeResource, RpcError> {
        // The "please probe" signal is a POST with an empty JSON object.
        let response =
            self.signed_post(session.key, Some(session.account_url), url, Some(&json!({})))?;
        response.into_json().map_err(|err| RpcError::Malformed {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    fn finalize_order(
        &self,
        session: &AccountSession<'_>,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderResource, RpcError> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self.signed_post(
            session.key,
            Some(session.account_url),
            finalize_url,
            Some(&payload),
        )?;
        let location = response
            .header("location")
            .unwrap_or_default()
            .to_string();
        let mut order: OrderResource =
            response.into_json().map_err(|err| RpcError::Malformed {
                url: finalize_url.to_string(),
                reason: err.to_string(),
            })?;
        order.url = location;
        Ok(order)
    }

    fn fetch_order(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<OrderResource, RpcError> {
        let mut order: OrderResource = self.post_as_get(session, url)?;
        order.url = url.to_string();
        Ok(order)
    }

    fn fetch_certificate(
        &self,
        session: &AccountSession<'_>,
        url: &str,
    ) -> Result<String, RpcError> {
        let response = self.signed_post(session.key, Some(session.account_url), url, None)?;
        response.into_string().map_err(|err| RpcError::Malformed {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    fn revoke_certificate(
        &self,
        session: &AccountSession<'_>,
        cert_der: &[u8],
        reason_code: u32,
    ) -> Result<(), RpcError> {
        let url = self
            .directory
            .revoke_cert
            .clone()
            .ok_or_else(|| RpcError::Malformed {
                url: self.directory_url.clone(),
                reason: "directory does not advertise revokeCert".to_string(),
            })?;
        let payload = json!({
            "certificate": URL_SAFE_NO_PAD.encode(cert_der),
            "reason": reason_code,
        });
        self.signed_post(session.key, Some(session.account_url), &url, Some(&payload))?;
        info!("[rpc] certificate revoked (reason {reason_code})");
        Ok(())
    }
}

fn require_location(url: &str, response: &ureq::Response) -> Result<String, RpcError> {
    response
        .header("location")
        .map(str::to_string)
        .ok_or_else(|| RpcError::Malformed {
            url: url.to_string(),
            reason: "missing Location header".to_string(),
        })
}

fn transport(url: &str, err: &dyn std::fmt::Display) -> RpcError {
    RpcError::Transport {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

fn protocol(url: &str, status: u16, problem: &Problem) -> RpcError {
    RpcError::Protocol {
        url: url.to_string(),
        status,
        type_uri: problem.type_uri.clone().unwrap_or_default(),
        detail: problem.description(),
    }
}

fn resolve_http_timeout() -> Duration {
    let timeout = std::env::var("ACME_ENGINE_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[rpc] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
