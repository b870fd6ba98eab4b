//! End-to-end engine tests against an in-process scripted CA.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use acme_engine::rpc::resources::{
    AuthorizationResource, AuthorizationStatus, ChallengeResource, ChallengeStatus, Identifier,
    OrderResource, OrderStatus, RegistrationHandle,
};
use acme_engine::{
    AccountSession, AcmeEngine, AcmeRpc, CancelToken, ChallengeType, Dns01Provider, EngineConfig,
    KeyPair, PollSchedule, RevocationError, RpcError, dns_txt_value,
};

/// Scripted CA covering the full happy path: registration, one order over
/// two domains, authorizations that turn valid on the second poll, a
/// finalization that passes through `processing` once, and a two-block
/// certificate chain.
#[derive(Default)]
struct ScriptedCa {
    offered_types: Vec<&'static str>,
    poll_counts: Mutex<HashMap<String, u32>>,
    order_polls: Mutex<u32>,
    register_calls: Mutex<u32>,
    revoke_calls: Mutex<u32>,
}

impl ScriptedCa {
    fn new(offered_types: Vec<&'static str>) -> Self {
        Self {
            offered_types,
            ..Self::default()
        }
    }

    fn domains() -> Vec<&'static str> {
        vec!["a.example.com", "b.example.com"]
    }

    fn authorization(&self, domain: &str, status: AuthorizationStatus) -> AuthorizationResource {
        AuthorizationResource {
            identifier: Identifier::dns(domain),
            status,
            challenges: self
                .offered_types
                .iter()
                .map(|challenge_type| ChallengeResource {
                    challenge_type: challenge_type.to_string(),
                    url: format!("https://ca.test/chall/{domain}/{challenge_type}"),
                    token: format!("tok-{domain}"),
                    status: ChallengeStatus::Pending,
                    error: None,
                })
                .collect(),
            wildcard: false,
        }
    }

    fn chain() -> String {
        let leaf = pem_block(&[1, 2, 3]);
        let issuer = pem_block(&[4, 5, 6]);
        format!("{leaf}{issuer}")
    }
}

fn pem_block(contents: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", contents.to_vec()))
}

impl AcmeRpc for ScriptedCa {
    fn terms_of_service(&self) -> Option<String> {
        Some("https://ca.test/terms".to_string())
    }

    fn register_account(
        &self,
        _key: &KeyPair,
        _contact_email: &str,
        terms_agreed: bool,
    ) -> Result<RegistrationHandle, RpcError> {
        assert!(terms_agreed);
        *self.register_calls.lock().unwrap() += 1;
        Ok(RegistrationHandle {
            url: "https://ca.test/acct/1".to_string(),
        })
    }

    fn fetch_existing_account(&self, _key: &KeyPair) -> Result<RegistrationHandle, RpcError> {
        Ok(RegistrationHandle {
            url: "https://ca.test/acct/1".to_string(),
        })
    }

    fn new_order(
        &self,
        _session: &AccountSession<'_>,
        domains: &[String],
    ) -> Result<OrderResource, RpcError> {
        // The engine normalizes before ordering: sorted, deduplicated.
        assert_eq!(domains, ScriptedCa::domains().as_slice());
        Ok(OrderResource {
            status: OrderStatus::Pending,
            identifiers: domains.iter().map(|domain| Identifier::dns(domain.as_str())).collect(),
            authorizations: (0..domains.len())
                .map(|index| format!("https://ca.test/authz/{index}"))
                .collect(),
            finalize: "https://ca.test/finalize/1".to_string(),
            certificate: None,
            url: "https://ca.test/order/1".to_string(),
        })
    }

    fn fetch_authorization(
        &self,
        _session: &AccountSession<'_>,
        url: &str,
    ) -> Result<AuthorizationResource, RpcError> {
        let index: usize = url.rsplit('/').next().unwrap().parse().unwrap();
        Ok(self.authorization(ScriptedCa::domains()[index], AuthorizationStatus::Pending))
    }

    fn poll_authorization(
        &self,
        _session: &AccountSession<'_>,
        url: &str,
    ) -> Result<AuthorizationResource, RpcError> {
        let index: usize = url.rsplit('/').next().unwrap().parse().unwrap();
        let domain = ScriptedCa::domains()[index];
        let mut counts = self.poll_counts.lock().unwrap();
        let count = counts.entry(domain.to_string()).or_insert(0);
        *count += 1;
        let status = if *count >= 2 {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Pending
        };
        Ok(self.authorization(domain, status))
    }

    fn ready_challenge(
        &self,
        _session: &AccountSession<'_>,
        url: &str,
    ) -> Result<ChallengeResource, RpcError> {
        Ok(ChallengeResource {
            challenge_type: "dns-01".to_string(),
            url: url.to_string(),
            token: "tok".to_string(),
            status: ChallengeStatus::Processing,
            error: None,
        })
    }

    fn finalize_order(
        &self,
        _session: &AccountSession<'_>,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderResource, RpcError> {
        assert!(!csr_der.is_empty());
        Ok(OrderResource {
            status: OrderStatus::Processing,
            identifiers: vec![],
            authorizations: vec![],
            finalize: finalize_url.to_string(),
            certificate: None,
            url: "https://ca.test/order/1".to_string(),
        })
    }

    fn fetch_order(
        &self,
        _session: &AccountSession<'_>,
        url: &str,
    ) -> Result<OrderResource, RpcError> {
        *self.order_polls.lock().unwrap() += 1;
        Ok(OrderResource {
            status: OrderStatus::Valid,
            identifiers: vec![],
            authorizations: vec![],
            finalize: "https://ca.test/finalize/1".to_string(),
            certificate: Some("https://ca.test/cert/1".to_string()),
            url: url.to_string(),
        })
    }

    fn fetch_certificate(
        &self,
        _session: &AccountSession<'_>,
        _url: &str,
    ) -> Result<String, RpcError> {
        Ok(ScriptedCa::chain())
    }

    fn revoke_certificate(
        &self,
        _session: &AccountSession<'_>,
        _cert_der: &[u8],
        _reason_code: u32,
    ) -> Result<(), RpcError> {
        *self.revoke_calls.lock().unwrap() += 1;
        Ok(())
    }
}

fn engine_over(ca: Arc<ScriptedCa>) -> AcmeEngine {
    let mut config = EngineConfig::new("https://ca.test/directory", "ops@example.com");
    config.poll = PollSchedule {
        initial: std::time::Duration::from_millis(1),
        max_interval: std::time::Duration::from_millis(2),
        ceiling: std::time::Duration::from_secs(5),
    };
    AcmeEngine::with_rpc(config, ca)
}

#[test]
fn issues_a_dns01_certificate_end_to_end() {
    acme_engine::logging::init();
    let ca = Arc::new(ScriptedCa::new(vec!["http-01", "dns-01"]));
    let engine = engine_over(ca.clone());

    // Unsorted, duplicated, unnormalized input; the engine cleans it up.
    let domains = vec![
        "b.example.com".to_string(),
        "A.example.com.".to_string(),
        "b.example.com".to_string(),
    ];
    let bundle = engine
        .issue(
            domains,
            ChallengeType::Dns01,
            "ops@example.com",
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(bundle.certificate, pem_block(&[1, 2, 3]));
    assert_eq!(bundle.chain, ScriptedCa::chain());
    assert_eq!(bundle.finalize_url, "https://ca.test/finalize/1");
    assert_eq!(
        bundle.certificate_url.as_deref(),
        Some("https://ca.test/cert/1")
    );
    // The certificate key is a usable, freshly generated key pair.
    let key = KeyPair::from_pkcs8_pem(&bundle.private_key).unwrap();
    key.thumbprint().unwrap();

    assert_eq!(*ca.register_calls.lock().unwrap(), 1);
    assert!(*ca.order_polls.lock().unwrap() >= 1);

    // Cleanup ran for both domains; the ready queue still reports the two
    // publication events for the external DNS publisher.
    assert_eq!(
        engine.list_pending_challenges(ChallengeType::Dns01).unwrap(),
        "[]"
    );
    let store = engine.challenge_store(ChallengeType::Dns01);
    let mut ready_domains: Vec<String> = (0..2)
        .map(|_| store.next_ready().unwrap().identifier)
        .collect();
    ready_domains.sort();
    assert_eq!(ready_domains, vec!["a.example.com", "b.example.com"]);
    assert!(store.next_ready().is_none());
}

#[test]
fn http01_request_fails_cleanly_when_only_dns01_is_offered() {
    let ca = Arc::new(ScriptedCa::new(vec!["dns-01"]));
    let engine = engine_over(ca);

    let err = engine
        .issue(
            vec!["a.example.com".to_string(), "b.example.com".to_string()],
            ChallengeType::Http01,
            "ops@example.com",
            &CancelToken::new(),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        acme_engine::IssuanceError::NoMatchingChallenge { .. }
    ));
    assert_eq!(
        engine.list_pending_challenges(ChallengeType::Http01).unwrap(),
        "[]"
    );
    assert!(engine.http_challenge_response("tok-a.example.com").is_none());
}

#[test]
fn pending_challenges_are_listable_until_cleaned() {
    let ca = Arc::new(ScriptedCa::new(vec!["dns-01"]));
    let engine = engine_over(ca);

    // An external collaborator publishing through the same store sees its
    // record in the diagnostic export.
    let provider = Dns01Provider::new(engine.challenge_store(ChallengeType::Dns01).clone());
    acme_engine::ChallengeProvider::present(&provider, "manual.example.com", "tok", "tok.print")
        .unwrap();

    let snapshot = engine.list_pending_challenges(ChallengeType::Dns01).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(parsed[0]["type"], "dns-01");
    assert_eq!(parsed[0]["identifier"], "manual.example.com");
    assert_eq!(parsed[0]["content"], dns_txt_value("tok.print"));
    assert_eq!(parsed[0]["verified"], false);

    acme_engine::ChallengeProvider::clean_up(&provider, "manual.example.com", "tok", "tok.print")
        .unwrap();
    assert_eq!(
        engine.list_pending_challenges(ChallengeType::Dns01).unwrap(),
        "[]"
    );
}

#[test]
fn revocation_validates_the_pem_before_any_rpc() {
    let ca = Arc::new(ScriptedCa::new(vec!["dns-01"]));
    let engine = engine_over(ca.clone());

    let err = engine.revoke(b"garbage bytes", 0).unwrap_err();
    assert!(matches!(err, RevocationError::MalformedCertificate(_)));
    // Neither a registration nor a revocation round-trip happened.
    assert_eq!(*ca.register_calls.lock().unwrap(), 0);
    assert_eq!(*ca.revoke_calls.lock().unwrap(), 0);
}

#[test]
fn invalid_domain_sets_are_rejected_before_registration() {
    let ca = Arc::new(ScriptedCa::new(vec!["dns-01"]));
    let engine = engine_over(ca.clone());

    let err = engine
        .issue(
            vec![],
            ChallengeType::Dns01,
            "ops@example.com",
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, acme_engine::IssuanceError::InvalidDomains(_)));
    assert_eq!(*ca.register_calls.lock().unwrap(), 0);
}
