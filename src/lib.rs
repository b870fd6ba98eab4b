//! ACME (RFC 8555) certificate issuance engine: account lifecycle, the
//! order → authorization → challenge → finalization state machine,
//! pluggable challenge providers over a concurrency-safe challenge store,
//! and certificate revocation. The CA is reached through the `AcmeRpc`
//! capability; `DirectoryClient` is the production implementation.

mod account;
mod cancel;
pub mod challenge;
mod domain;
mod engine;
mod keys;
pub mod logging;
mod order;
mod retry;
mod revoke;
pub mod rpc;

pub use account::{Account, AccountError, AccountManager, TermsPolicy};
pub use cancel::CancelToken;
pub use challenge::{
    ChallengeProvider, ChallengeRecord, ChallengeStore, ChallengeType, Dns01Provider,
    Http01Provider, PresentOutcome, ProviderError, dns_record_name, dns_txt_value,
    http_challenge_path, key_authorization,
};
pub use domain::{normalize_domain, normalize_domain_set};
pub use engine::{AcmeEngine, EngineConfig, LETSENCRYPT_STAGING_DIRECTORY};
pub use keys::{CryptoError, KeyPair, build_csr, generate_key};
pub use order::{CertificateBundle, IssuanceError, OrderCoordinator};
pub use retry::PollSchedule;
pub use revoke::{REASON_UNSPECIFIED, RevocationError, RevocationHandler};
pub use rpc::{AccountSession, AcmeRpc, DirectoryClient, RpcError};
