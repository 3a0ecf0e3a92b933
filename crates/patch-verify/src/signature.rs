//! Per-entry signature checks over a JAR-style signed archive.
//!
//! Trust chain for one entry: its content digest must match the manifest
//! section for it, the manifest (or that section) must match the digests in a
//! signer's `.SF` file, and the `.SF` bytes must verify against the PKCS#7
//! block of the same alias. The certificates found in the verifying blocks
//! become the package's signer chains.

use indexmap::{IndexMap, IndexSet};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::X509;
use openssl::x509::store::X509StoreBuilder;
use tracing::{debug, warn};

use crate::archive::{ArchiveContents, SignerFiles, is_signature_related};
use crate::certificate::{Certificate, CertificateChain};
use crate::error::PackageError;
use crate::manifest::{DigestAlgorithm, MANIFEST_NAME, Manifest, Section};

/// Outcome of a successful signature scan.
#[derive(Clone, Debug)]
pub struct SignedContents {
    pub manifest: Manifest,
    /// Distinct signer chains across all entries, leaf first.
    pub chains: Vec<CertificateChain>,
}

/// Check that every non-metadata entry is signed by at least one valid signer.
pub fn scan(contents: &ArchiveContents) -> Result<SignedContents, PackageError> {
    let manifest_bytes = contents
        .get(MANIFEST_NAME)
        .ok_or_else(|| PackageError::format("archive has no manifest"))?;
    let manifest = Manifest::parse(manifest_bytes)?;

    let mut chains: IndexSet<CertificateChain> = IndexSet::new();
    let mut covered: IndexMap<String, Vec<usize>> = IndexMap::new();

    for signer in contents.signers() {
        let signer_chains = verify_block(&signer, contents)?;
        let entries = signed_entries(&signer, contents, &manifest)?;
        debug!(
            alias = signer.alias,
            entries = entries.len(),
            signers = signer_chains.len(),
            "verified signature file"
        );
        for chain in signer_chains {
            let (index, _) = chains.insert_full(chain);
            for entry in &entries {
                let signers = covered.entry(entry.clone()).or_default();
                if !signers.contains(&index) {
                    signers.push(index);
                }
            }
        }
    }

    for (name, bytes) in contents.iter() {
        if is_signature_related(name) {
            continue;
        }
        check_entry_digest(&manifest, name, bytes)?;
        if covered.get(name).is_none_or(Vec::is_empty) {
            warn!(entry = name, "archive entry is not signed");
            return Err(PackageError::signature(format!("entry `{name}` is not signed")));
        }
    }

    Ok(SignedContents {
        manifest,
        chains: chains.into_iter().collect(),
    })
}

/// Verify the PKCS#7 block over the `.SF` bytes and return one chain per signer.
fn verify_block(
    signer: &SignerFiles<'_>,
    contents: &ArchiveContents,
) -> Result<Vec<CertificateChain>, PackageError> {
    let Some((block_name, block)) = signer.block else {
        return Err(PackageError::signature(format!(
            "signature file `{}` has no signature block",
            signer.signature_file
        )));
    };
    let signature_file = contents
        .get(signer.signature_file)
        .ok_or_else(|| PackageError::format(format!("missing `{}`", signer.signature_file)))?;

    let pkcs7 = Pkcs7::from_der(block).map_err(|err| {
        PackageError::openssl(&format!("cannot parse signature block `{block_name}`"), err)
    })?;
    let extra = Stack::<X509>::new()
        .map_err(|err| PackageError::openssl("cannot allocate certificate stack", err))?;
    let store = X509StoreBuilder::new()
        .map_err(|err| PackageError::openssl("cannot allocate certificate store", err))?
        .build();

    // No chain validation here; trust is decided by exact certificate identity.
    pkcs7
        .verify(
            &extra,
            &store,
            Some(signature_file),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .map_err(|err| {
            PackageError::openssl(
                &format!(
                    "signature block `{block_name}` does not verify `{}`",
                    signer.signature_file
                ),
                err,
            )
        })?;

    let pool = pkcs7
        .signed()
        .and_then(|signed| signed.certificates())
        .map(|stack| {
            stack
                .iter()
                .map(|cert| Certificate::from_x509(cert.to_owned()))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let leaves = pkcs7
        .signers(&extra, Pkcs7Flags::empty())
        .map_err(|err| PackageError::openssl("cannot resolve signer certificates", err))?;
    let chains = leaves
        .iter()
        .map(|leaf| Certificate::from_x509(leaf.to_owned()).map(|c| CertificateChain::build(c, &pool)))
        .collect::<Result<Vec<_>, _>>()?;

    if chains.is_empty() {
        return Err(PackageError::signature(format!(
            "signature block `{block_name}` carries no signer certificate"
        )));
    }
    Ok(chains)
}

/// Entries the `.SF` file vouches for, after checking its manifest digests.
fn signed_entries(
    signer: &SignerFiles<'_>,
    contents: &ArchiveContents,
    manifest: &Manifest,
) -> Result<Vec<String>, PackageError> {
    let sf_name = signer.signature_file;
    let sf_bytes = contents
        .get(sf_name)
        .ok_or_else(|| PackageError::format(format!("missing `{sf_name}`")))?;
    let sf = Manifest::parse(sf_bytes)?;

    let whole = sf.main().digests("-Digest-Manifest");
    if whole.is_empty() {
        return Err(PackageError::signature(format!(
            "`{sf_name}` does not sign the manifest"
        )));
    }
    let whole_manifest_ok = all_match(&whole, manifest.raw(), sf_name)?;

    if !whole_manifest_ok {
        debug!(
            signature_file = sf_name,
            "manifest digest differs, checking individual sections"
        );
        let main_attrs = sf.main().digests("-Digest-Manifest-Main-Attributes");
        if !main_attrs.is_empty()
            && !all_match(&main_attrs, manifest.section_bytes(manifest.main()), sf_name)?
        {
            return Err(PackageError::signature(format!(
                "manifest main attributes were modified after `{sf_name}` was signed"
            )));
        }
    }

    let mut entries = Vec::new();
    for (name, section) in sf.entries() {
        let digests = section.digests("-Digest");
        if digests.is_empty() {
            debug!(signature_file = sf_name, entry = name, "section carries no digest");
            continue;
        }
        let manifest_section = manifest.entry(name).ok_or_else(|| {
            PackageError::signature(format!(
                "`{sf_name}` signs `{name}` which has no manifest section"
            ))
        })?;
        if !whole_manifest_ok
            && !all_match(&digests, manifest.section_bytes(manifest_section), sf_name)?
        {
            return Err(PackageError::signature(format!(
                "manifest section for `{name}` was modified after `{sf_name}` was signed"
            )));
        }
        entries.push(name.to_string());
    }
    Ok(entries)
}

fn check_entry_digest(manifest: &Manifest, name: &str, bytes: &[u8]) -> Result<(), PackageError> {
    let section: &Section = manifest.entry(name).ok_or_else(|| {
        PackageError::signature(format!("entry `{name}` is not listed in the manifest"))
    })?;
    let digests = section.digests("-Digest");
    if digests.is_empty() {
        return Err(PackageError::signature(format!(
            "entry `{name}` has no digest in the manifest"
        )));
    }
    if !all_match(&digests, bytes, MANIFEST_NAME)? {
        return Err(PackageError::signature(format!(
            "digest mismatch for entry `{name}`"
        )));
    }
    Ok(())
}

/// True when every recognised digest matches; unknown algorithms are errors.
fn all_match(
    digests: &[(Result<DigestAlgorithm, String>, &str)],
    bytes: &[u8],
    origin: &str,
) -> Result<bool, PackageError> {
    let mut matched = false;
    for (alg, expected) in digests {
        let alg = alg.as_ref().map_err(|name| {
            PackageError::signature(format!("unsupported digest algorithm `{name}` in `{origin}`"))
        })?;
        if alg.encoded_digest(bytes) != *expected {
            return Ok(false);
        }
        matched = true;
    }
    Ok(matched)
}
