use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use tracing::debug;

use crate::archive::ArchiveContents;
use crate::certificate::{Certificate, CertificateChain};
use crate::error::PackageError;
use crate::properties::Properties;
use crate::signature::{self, SignedContents};

/// Metadata entry every patch archive carries at its root.
pub const PATCH_PROPERTIES_ENTRY: &str = "patch.properties";

/// Keys of `patch.properties`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchProperty {
    Id,
    Description,
    RollbackAllowed,
    RollbackForId,
    JavaBinary,
}

impl PatchProperty {
    pub const ALL: [PatchProperty; 5] = [
        Self::Id,
        Self::Description,
        Self::RollbackAllowed,
        Self::RollbackForId,
        Self::JavaBinary,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Description => "DESCRIPTION",
            Self::RollbackAllowed => "ROLLBACK_ALLOWED",
            Self::RollbackForId => "ROLLBACK_FOR_ID",
            Self::JavaBinary => "JAVA_BINARY",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Self::Id | Self::Description | Self::RollbackAllowed)
    }
}

/// A parsed, signature-checked patch archive.
#[derive(Clone, Debug)]
pub struct PatchPackage {
    archive: PathBuf,
    properties: Properties,
    chains: Vec<CertificateChain>,
}

impl PatchPackage {
    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    pub fn property(&self, property: PatchProperty) -> Option<&str> {
        self.properties.get(property.key())
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn id(&self) -> &str {
        self.property(PatchProperty::Id).unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        self.property(PatchProperty::Description).unwrap_or_default()
    }

    pub fn rollback_allowed(&self) -> bool {
        self.property(PatchProperty::RollbackAllowed)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
    }

    /// Id of the patch this one reverts, if it is a rollback patch.
    pub fn rollback_for_id(&self) -> Option<&str> {
        self.property(PatchProperty::RollbackForId)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn java_binary(&self) -> Option<&str> {
        self.property(PatchProperty::JavaBinary)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn certificate_chains(&self) -> &[CertificateChain] {
        &self.chains
    }

    /// Distinct leaf certificates across all signer chains.
    pub fn signer_certificates(&self) -> Vec<&Certificate> {
        self.chains
            .iter()
            .map(CertificateChain::leaf)
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Open an archive, require every entry to be signed and load its metadata.
pub fn parse(archive: &Path) -> Result<PatchPackage, PackageError> {
    let contents = ArchiveContents::open(archive)?;
    let (package, _) = parse_contents(archive, &contents)?;
    Ok(package)
}

pub(crate) fn parse_contents(
    archive: &Path,
    contents: &ArchiveContents,
) -> Result<(PatchPackage, SignedContents), PackageError> {
    let signed = signature::scan(contents)?;

    let metadata = contents.get(PATCH_PROPERTIES_ENTRY).ok_or_else(|| {
        PackageError::format(format!("archive has no `{PATCH_PROPERTIES_ENTRY}` entry"))
    })?;
    let properties = Properties::from_bytes(metadata);

    for property in PatchProperty::ALL {
        if property.is_required() && !properties.contains_key(property.key()) {
            return Err(PackageError::MissingProperty {
                name: property.key(),
            });
        }
    }
    if let Some(value) = properties.get(PatchProperty::RollbackAllowed.key()) {
        let value = value.trim();
        if !value.eq_ignore_ascii_case("true") && !value.eq_ignore_ascii_case("false") {
            return Err(PackageError::format(format!(
                "{} must be `true` or `false`, got `{value}`",
                PatchProperty::RollbackAllowed.key()
            )));
        }
    }

    let package = PatchPackage {
        archive: archive.to_path_buf(),
        properties,
        chains: signed.chains.clone(),
    };
    debug!(
        patch_id = package.id(),
        signers = package.chains.len(),
        "parsed patch package"
    );
    Ok((package, signed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_keys_and_requirements() {
        let required: Vec<_> = PatchProperty::ALL
            .into_iter()
            .filter(|p| p.is_required())
            .map(PatchProperty::key)
            .collect();
        assert_eq!(required, ["ID", "DESCRIPTION", "ROLLBACK_ALLOWED"]);
        assert_eq!(PatchProperty::JavaBinary.key(), "JAVA_BINARY");
    }
}
