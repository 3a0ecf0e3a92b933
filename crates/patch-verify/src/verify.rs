//! Trust verification: the parser's signature scan plus manifest structure
//! checks and the exact-identity signer policy.

use std::path::Path;

use tracing::{debug, warn};

use crate::archive::ArchiveContents;
use crate::error::PackageError;
use crate::manifest::{MAIN_CLASS, Manifest};
use crate::package::{PatchPackage, parse_contents};
use crate::trust::TrustedCertificates;

/// Parse `archive` and accept it only if every signer is trusted.
///
/// The effective trust set is the embedded store plus `trusted`. A signer is
/// trusted when its leaf certificate is byte-identical to a member of that
/// set; issuers are never consulted.
pub fn verify(archive: &Path, trusted: &TrustedCertificates) -> Result<PatchPackage, PackageError> {
    let contents = ArchiveContents::open(archive)?;
    let (package, signed) = parse_contents(archive, &contents)?;

    check_structure(&signed.manifest, &contents)?;

    let mut effective = TrustedCertificates::embedded()?;
    effective.extend(trusted.iter().cloned());

    for leaf in package.signer_certificates() {
        if !effective.contains(leaf) {
            warn!(
                patch_id = package.id(),
                subject = %leaf.subject(),
                sha256 = %leaf.fingerprint(),
                "rejecting untrusted signer"
            );
            return Err(PackageError::Trust {
                subject: leaf.subject(),
                fingerprint: leaf.fingerprint(),
            });
        }
    }

    debug!(patch_id = package.id(), "patch package verified");
    Ok(package)
}

/// The main class and every manifest section must name an archive entry.
///
/// `Class-Path` items resolve next to the archive, not inside it, and are not
/// checked.
fn check_structure(manifest: &Manifest, contents: &ArchiveContents) -> Result<(), PackageError> {
    let main_class = manifest
        .main()
        .get(MAIN_CLASS)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PackageError::format(format!("manifest has no `{MAIN_CLASS}` attribute")))?;
    let class_entry = class_entry_name(main_class);
    if !contents.contains(&class_entry) {
        return Err(PackageError::format(format!(
            "main class `{main_class}` has no entry `{class_entry}`"
        )));
    }

    for (name, _) in manifest.entries() {
        if !contents.contains(name) {
            return Err(PackageError::format(format!(
                "manifest declares `{name}` which is not in the archive"
            )));
        }
    }

    Ok(())
}

fn class_entry_name(main_class: &str) -> String {
    let class = main_class.strip_suffix(".class").unwrap_or(main_class);
    format!("{}.class", class.replace('.', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_class_maps_to_class_file() {
        assert_eq!(class_entry_name("com.example.Patch"), "com/example/Patch.class");
        assert_eq!(class_entry_name("Patch"), "Patch.class");
    }
}
