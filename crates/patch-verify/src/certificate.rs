use std::fmt;
use std::hash::{Hash, Hasher};

use openssl::x509::{X509, X509Ref, X509VerifyResult};
use sha2::{Digest, Sha256};

use crate::error::PackageError;

/// An X.509 certificate compared by its exact DER encoding.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Result<Self, PackageError> {
        let der = x509
            .to_der()
            .map_err(|err| PackageError::openssl("cannot encode certificate", err))?;
        Ok(Self { x509, der })
    }

    pub fn from_der(der: &[u8]) -> Result<Self, PackageError> {
        let x509 = X509::from_der(der)
            .map_err(|err| PackageError::openssl("not an X.509 certificate", err))?;
        Self::from_x509(x509)
    }

    /// Every certificate in a PEM bundle; text outside the PEM blocks is ignored.
    pub fn from_pem_bundle(pem: &[u8]) -> Result<Vec<Self>, PackageError> {
        if !pem.windows(10).any(|w| w == b"-----BEGIN") {
            return Ok(Vec::new());
        }
        X509::stack_from_pem(pem)
            .map_err(|err| PackageError::openssl("invalid PEM certificate bundle", err))?
            .into_iter()
            .map(Self::from_x509)
            .collect()
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    /// Hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Distinguished name rendered as `CN=..., O=...`.
    pub fn subject(&self) -> String {
        self.x509
            .subject_name()
            .entries()
            .map(|entry| {
                let key = entry.object().nid().short_name().unwrap_or("?");
                let value = String::from_utf8_lossy(entry.data().as_slice());
                format!("{key}={value}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn issued(&self, subject: &Certificate) -> bool {
        self.x509.issued(&subject.x509) == X509VerifyResult::OK
    }

    pub fn is_self_issued(&self) -> bool {
        self.issued(self)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl Hash for Certificate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.der.hash(state);
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("sha256", &self.fingerprint())
            .finish()
    }
}

/// Signer certificate chain, leaf first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    /// Walk from `leaf` through `pool` by issuer until a self-issued
    /// certificate or a missing issuer ends the chain.
    pub fn build(leaf: Certificate, pool: &[Certificate]) -> Self {
        let mut certificates = vec![leaf];
        while certificates.len() <= pool.len() {
            let Some(current) = certificates.last() else {
                break;
            };
            if current.is_self_issued() {
                break;
            }
            let issuer = pool
                .iter()
                .find(|candidate| candidate.issued(current) && !certificates.contains(candidate));
            match issuer {
                Some(issuer) => certificates.push(issuer.clone()),
                None => break,
            }
        }
        Self { certificates }
    }

    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}
