use std::sync::Arc;

use log::info;
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

use crate::account::{Account, AccountError};
use crate::rpc::{AcmeRpc, RpcError};

/// RFC 5280 "unspecified" revocation reason, the default when the caller
/// has nothing more precise.
pub const REASON_UNSPECIFIED: u32 = 0;

#[derive(Error, Debug)]
pub enum RevocationError {
    /// Local decode failure; no request was made to the CA.
    #[error("certificate is not a well-formed PEM certificate: {0}")]
    MalformedCertificate(String),
    #[error("revocation was rejected by the CA")]
    Rpc {
        #[source]
        source: RpcError,
    },
    #[error(transparent)]
    Account(#[from] AccountError),
}

/// Decodes and validates a PEM certificate, returning its DER bytes.
pub(crate) fn decode_certificate(cert_pem: &[u8]) -> Result<Vec<u8>, RevocationError> {
    let (_, block) = parse_x509_pem(cert_pem)
        .map_err(|err| RevocationError::MalformedCertificate(err.to_string()))?;
    if block.label != "CERTIFICATE" {
        return Err(RevocationError::MalformedCertificate(format!(
            "unexpected PEM label {:?}",
            block.label
        )));
    }
    block
        .parse_x509()
        .map_err(|err| RevocationError::MalformedCertificate(err.to_string()))?;
    Ok(block.contents)
}

/// Revokes previously issued certificates through the CA capability.
pub struct RevocationHandler {
    rpc: Arc<dyn AcmeRpc>,
}

impl RevocationHandler {
    pub fn new(rpc: Arc<dyn AcmeRpc>) -> Self {
        Self { rpc }
    }

    /// Validates the certificate locally before spending a round-trip on
    /// the CA, then submits the revocation under the account key.
    pub fn revoke(
        &self,
        cert_pem: &[u8],
        account: &Account,
        reason_code: u32,
    ) -> Result<(), RevocationError> {
        let der = decode_certificate(cert_pem)?;
        self.rpc
            .revoke_certificate(&account.session(), &der, reason_code)
            .map_err(|source| RevocationError::Rpc { source })?;
        info!("[revoke] certificate revoked (reason {reason_code})");
        Ok(())
    }
}
