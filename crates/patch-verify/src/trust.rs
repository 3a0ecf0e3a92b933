use std::fs;
use std::path::Path;

use indexmap::IndexSet;
use tracing::debug;

use crate::certificate::Certificate;
use crate::error::PackageError;

const EMBEDDED_PEM: &[u8] = include_bytes!("../trust/embedded.pem");

/// Certificates whose exact DER encoding marks a signer as trusted.
#[derive(Clone, Debug, Default)]
pub struct TrustedCertificates {
    certificates: IndexSet<Certificate>,
}

impl TrustedCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store compiled into this crate.
    pub fn embedded() -> Result<Self, PackageError> {
        let mut trusted = Self::new();
        trusted.add_pem(EMBEDDED_PEM)?;
        Ok(trusted)
    }

    /// Only the certificates in the PEM files at `paths`.
    pub fn from_pem_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, PackageError> {
        let mut trusted = Self::new();
        for path in paths {
            trusted.add_pem_file(path.as_ref())?;
        }
        Ok(trusted)
    }

    pub fn add(&mut self, certificate: Certificate) -> bool {
        self.certificates.insert(certificate)
    }

    /// Returns how many new certificates the bundle contributed.
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<usize, PackageError> {
        let added = Certificate::from_pem_bundle(pem)?
            .into_iter()
            .filter(|cert| self.certificates.insert(cert.clone()))
            .count();
        Ok(added)
    }

    pub fn add_pem_file(&mut self, path: &Path) -> Result<usize, PackageError> {
        let pem = fs::read(path)?;
        let added = self.add_pem(&pem)?;
        debug!(path = %path.display(), added, "loaded trusted certificates");
        Ok(added)
    }

    pub fn contains(&self, certificate: &Certificate) -> bool {
        self.certificates.contains(certificate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl FromIterator<Certificate> for TrustedCertificates {
    fn from_iter<I: IntoIterator<Item = Certificate>>(iter: I) -> Self {
        Self {
            certificates: iter.into_iter().collect(),
        }
    }
}

impl Extend<Certificate> for TrustedCertificates {
    fn extend<I: IntoIterator<Item = Certificate>>(&mut self, iter: I) {
        self.certificates.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_store_parses() {
        let trusted = TrustedCertificates::embedded().expect("embedded store");
        assert!(trusted.iter().all(|cert| !cert.der().is_empty()));
    }

    #[test]
    fn comment_only_bundle_adds_nothing() {
        let mut trusted = TrustedCertificates::new();
        assert_eq!(trusted.add_pem(b"# nothing here\n").expect("bundle"), 0);
        assert!(trusted.is_empty());
    }
}
