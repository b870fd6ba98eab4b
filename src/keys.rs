use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{MessageDigest, hash};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509ReqBuilder};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

// P-384 for account and certificate keys; JWS signatures are ES384.
const CURVE: Nid = Nid::SECP384R1;
const COORDINATE_LEN: i32 = 48;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("key is not usable as an EC key: {0}")]
    WrongKeyType(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("CSR construction failed: {0}")]
    Csr(String),
    #[error("key serialization failed: {0}")]
    Serialization(String),
}

/// An EC P-384 key pair. Generated fresh for every account and every
/// certificate request; callers that need reuse persist the PEM externally.
#[derive(Debug)]
pub struct KeyPair {
    pkey: PKey<Private>,
}

/// Generates a new P-384 key pair. Stateless and safe to call from any
/// number of tasks; fails only when the crypto backend does.
pub fn generate_key() -> Result<KeyPair, CryptoError> {
    let group =
        EcGroup::from_curve_name(CURVE).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let ec = EcKey::generate(&group).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let pkey = PKey::from_ec_key(ec).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    Ok(KeyPair { pkey })
}

impl KeyPair {
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let pkey = PKey::private_key_from_pem(pem.as_bytes())
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        pkey.ec_key()
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        Ok(Self { pkey })
    }

    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        let pem = self
            .pkey
            .private_key_to_pem_pkcs8()
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        String::from_utf8(pem).map_err(|_| {
            CryptoError::Serialization("key PEM contained invalid UTF-8".to_string())
        })
    }

    fn coordinates(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let ec = self
            .pkey
            .ec_key()
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let group = EcGroup::from_curve_name(CURVE)
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let mut ctx =
            BigNumContext::new().map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let mut x = BigNum::new().map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let mut y = BigNum::new().map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        ec.public_key()
            .affine_coordinates(&group, &mut x, &mut y, &mut ctx)
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let x = x
            .to_vec_padded(COORDINATE_LEN)
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let y = y
            .to_vec_padded(COORDINATE_LEN)
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        Ok((x, y))
    }

    /// Public key as a JWK object for the JWS protected header.
    pub fn jwk(&self) -> Result<serde_json::Value, CryptoError> {
        let (x, y) = self.coordinates()?;
        Ok(json!({
            "crv": "P-384",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        }))
    }

    /// RFC 7638 JWK thumbprint: SHA-256 over the required members in
    /// lexicographic order, base64url without padding.
    pub fn thumbprint(&self) -> Result<String, CryptoError> {
        let (x, y) = self.coordinates()?;
        let canonical = format!(
            r#"{{"crv":"P-384","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y),
        );
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }

    /// ECDSA-SHA384 signature in the raw `r || s` form JOSE expects,
    /// both halves left-padded to the coordinate length.
    pub fn sign_es384(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = hash(MessageDigest::sha384(), data)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        let ec = self
            .pkey
            .ec_key()
            .map_err(|e| CryptoError::WrongKeyType(e.to_string()))?;
        let sig =
            EcdsaSig::sign(&digest, &ec).map_err(|e| CryptoError::Signing(e.to_string()))?;
        let mut out = sig
            .r()
            .to_vec_padded(COORDINATE_LEN)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        out.extend(
            sig.s()
                .to_vec_padded(COORDINATE_LEN)
                .map_err(|e| CryptoError::Signing(e.to_string()))?,
        );
        Ok(out)
    }

    pub(crate) fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }
}

/// Builds a DER-encoded CSR for the domain set: CN is the first domain, all
/// domains go into the SAN extension, signed SHA-384 with `key`.
pub fn build_csr(domains: &[String], key: &KeyPair) -> Result<Vec<u8>, CryptoError> {
    let primary = domains
        .first()
        .ok_or_else(|| CryptoError::Csr("domain set is empty".to_string()))?;

    let mut name = X509NameBuilder::new().map_err(csr_err)?;
    name.append_entry_by_nid(Nid::COMMONNAME, primary)
        .map_err(csr_err)?;
    let name = name.build();

    let mut builder = X509ReqBuilder::new().map_err(csr_err)?;
    builder.set_subject_name(&name).map_err(csr_err)?;
    builder.set_pubkey(key.pkey()).map_err(csr_err)?;

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let san = san.build(&builder.x509v3_context(None)).map_err(csr_err)?;
    let mut extensions = Stack::new().map_err(csr_err)?;
    extensions.push(san).map_err(csr_err)?;
    builder.add_extensions(&extensions).map_err(csr_err)?;

    builder
        .sign(key.pkey(), MessageDigest::sha384())
        .map_err(csr_err)?;
    builder.build().to_der().map_err(csr_err)
}

fn csr_err(err: openssl::error::ErrorStack) -> CryptoError {
    CryptoError::Csr(err.to_string())
}
