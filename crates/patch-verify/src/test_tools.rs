//! Builders for signed patch archives used by the tests of this workspace.
//!
//! Keys and certificates are generated on the fly; nothing here is meant for
//! producing real patches.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::archive::ArchiveContents;
use crate::certificate::Certificate;
use crate::manifest::{CLASS_PATH, DigestAlgorithm, MAIN_CLASS, MANIFEST_NAME};
use crate::package::{PATCH_PROPERTIES_ENTRY, PatchProperty};
use crate::properties::Properties;
use crate::trust::TrustedCertificates;

pub const DEFAULT_ALIAS: &str = "MYKEY";
pub const DEFAULT_MAIN_CLASS: &str = "com.example.patch.PatchMain";

const LINE_LIMIT: usize = 72;

/// A throwaway RSA key with its certificate and the certificates above it.
pub struct TestSigner {
    alias: String,
    key: PKey<Private>,
    certificate: X509,
    issuers: Vec<X509>,
}

impl TestSigner {
    /// Self-signed signer.
    pub fn generate(common_name: &str) -> Result<Self> {
        let key = generate_key()?;
        let certificate = build_certificate(common_name, &key, None)?;
        Ok(Self {
            alias: DEFAULT_ALIAS.to_string(),
            key,
            certificate,
            issuers: Vec::new(),
        })
    }

    /// Signer whose certificate is issued by `authority`.
    pub fn issued_by(common_name: &str, authority: &TestSigner) -> Result<Self> {
        let key = generate_key()?;
        let certificate = build_certificate(common_name, &key, Some(authority))?;
        let mut issuers = vec![authority.certificate.clone()];
        issuers.extend(authority.issuers.iter().cloned());
        Ok(Self {
            alias: DEFAULT_ALIAS.to_string(),
            key,
            certificate,
            issuers,
        })
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn certificate(&self) -> Result<Certificate> {
        Ok(Certificate::from_x509(self.certificate.clone())?)
    }

    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_pem()?)
    }

    /// Write the signer certificate as PEM into `dir` and return the path.
    pub fn write_certificate(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.pem", self.alias.to_ascii_lowercase()));
        fs::write(&path, self.certificate_pem()?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// A trust set holding only this signer.
    pub fn trusted(&self) -> Result<TrustedCertificates> {
        Ok(std::iter::once(self.certificate()?).collect())
    }

    fn sign(&self, signature_file: &[u8]) -> Result<Vec<u8>> {
        let mut extra = Stack::new()?;
        for issuer in &self.issuers {
            extra.push(issuer.clone())?;
        }
        let block = Pkcs7::sign(
            &self.certificate,
            &self.key,
            &extra,
            signature_file,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )?;
        Ok(block.to_der()?)
    }
}

fn generate_key() -> Result<PKey<Private>> {
    let rsa = Rsa::generate(2048)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn build_certificate(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<&TestSigner>,
) -> Result<X509> {
    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_text("CN", common_name)?;
    name_builder.append_entry_by_text("O", "Patch Test")?;
    let name = name_builder.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    match issuer {
        Some(issuer) => {
            builder.set_issuer_name(issuer.certificate.subject_name())?;
            builder.sign(&issuer.key, MessageDigest::sha256())?;
        }
        None => {
            builder.set_issuer_name(&name)?;
            builder.sign(key, MessageDigest::sha256())?;
        }
    }
    Ok(builder.build())
}

/// Assembles a patch archive and signs every entry.
#[derive(Clone, Debug)]
pub struct PatchBuilder {
    properties: Properties,
    main_class: Option<String>,
    entries: IndexMap<String, Vec<u8>>,
    class_path: Option<String>,
}

impl PatchBuilder {
    pub fn new(id: &str) -> Self {
        let mut properties = Properties::new();
        properties.insert(PatchProperty::Id.key(), id);
        properties.insert(PatchProperty::Description.key(), format!("test patch {id}"));
        properties.insert(PatchProperty::RollbackAllowed.key(), "true");
        Self {
            properties,
            main_class: Some(DEFAULT_MAIN_CLASS.to_string()),
            entries: IndexMap::new(),
            class_path: None,
        }
    }

    pub fn description(self, description: &str) -> Self {
        self.property(PatchProperty::Description.key(), description)
    }

    pub fn rollback_allowed(self, allowed: bool) -> Self {
        self.property(PatchProperty::RollbackAllowed.key(), &allowed.to_string())
    }

    pub fn rollback_for(self, id: &str) -> Self {
        self.property(PatchProperty::RollbackForId.key(), id)
    }

    pub fn java_binary(self, binary: &str) -> Self {
        self.property(PatchProperty::JavaBinary.key(), binary)
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn without_property(mut self, key: &str) -> Self {
        self.properties.remove(key);
        self
    }

    /// `None` leaves the `Main-Class` attribute and class entry out.
    pub fn main_class(mut self, main_class: Option<&str>) -> Self {
        self.main_class = main_class.map(str::to_string);
        self
    }

    pub fn class_path(mut self, class_path: &str) -> Self {
        self.class_path = Some(class_path.to_string());
        self
    }

    pub fn entry(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.to_string(), bytes.into());
        self
    }

    /// Archive bytes signed by `signer`.
    pub fn build(&self, signer: &TestSigner) -> Result<Vec<u8>> {
        self.build_signed_by(&[signer])
    }

    /// Archive bytes where each signer covers every entry.
    pub fn build_signed_by(&self, signers: &[&TestSigner]) -> Result<Vec<u8>> {
        let content = self.content();
        let (manifest, sections) = render_manifest(self.main_attributes(), &content);

        let mut archive: IndexMap<String, Vec<u8>> = IndexMap::new();
        archive.insert(MANIFEST_NAME.to_string(), manifest.clone());
        for signer in signers {
            let signature_file = render_signature_file(&manifest, &sections);
            let block = signer.sign(&signature_file)?;
            archive.insert(format!("META-INF/{}.SF", signer.alias), signature_file);
            archive.insert(format!("META-INF/{}.RSA", signer.alias), block);
        }
        archive.extend(content);
        write_zip(&archive)
    }

    /// Build with `signer` and write the archive to `path`.
    pub fn write(&self, signer: &TestSigner, path: &Path) -> Result<PathBuf> {
        let bytes = self.build(signer)?;
        fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path.to_path_buf())
    }

    fn content(&self) -> IndexMap<String, Vec<u8>> {
        let mut content = IndexMap::new();
        let rendered = self.properties.render(Some("test patch"));
        content.insert(PATCH_PROPERTIES_ENTRY.to_string(), rendered.into_bytes());
        if let Some(main_class) = &self.main_class {
            let entry = format!("{}.class", main_class.replace('.', "/"));
            content.insert(entry, class_file_stub(main_class));
        }
        content.extend(self.entries.clone());
        content
    }

    fn main_attributes(&self) -> Vec<(&'static str, String)> {
        let mut attributes = vec![
            ("Manifest-Version", "1.0".to_string()),
            ("Created-By", "patch-verify test tools".to_string()),
        ];
        if let Some(main_class) = &self.main_class {
            attributes.push((MAIN_CLASS, main_class.clone()));
        }
        if let Some(class_path) = &self.class_path {
            attributes.push((CLASS_PATH, class_path.clone()));
        }
        attributes
    }
}

fn class_file_stub(main_class: &str) -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x00, 0x34];
    bytes.extend_from_slice(main_class.as_bytes());
    bytes
}

/// Rendered manifest plus each entry section's name and raw bytes.
fn render_manifest(
    main: Vec<(&'static str, String)>,
    content: &IndexMap<String, Vec<u8>>,
) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
    let mut manifest = Vec::new();
    for (key, value) in &main {
        write_header(&mut manifest, key, value);
    }
    manifest.extend_from_slice(b"\r\n");

    let mut sections = Vec::new();
    for (name, bytes) in content {
        let mut section = Vec::new();
        write_header(&mut section, "Name", name);
        let alg = DigestAlgorithm::Sha256;
        write_header(
            &mut section,
            &format!("{}-Digest", alg.name()),
            &alg.encoded_digest(bytes),
        );
        section.extend_from_slice(b"\r\n");
        manifest.extend_from_slice(&section);
        sections.push((name.clone(), section));
    }
    (manifest, sections)
}

fn render_signature_file(manifest: &[u8], sections: &[(String, Vec<u8>)]) -> Vec<u8> {
    let alg = DigestAlgorithm::Sha256;
    let main_len = manifest
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(manifest.len(), |pos| pos + 4);

    let mut sf = Vec::new();
    write_header(&mut sf, "Signature-Version", "1.0");
    write_header(
        &mut sf,
        &format!("{}-Digest-Manifest-Main-Attributes", alg.name()),
        &alg.encoded_digest(&manifest[..main_len]),
    );
    write_header(
        &mut sf,
        &format!("{}-Digest-Manifest", alg.name()),
        &alg.encoded_digest(manifest),
    );
    write_header(&mut sf, "Created-By", "patch-verify test tools");
    sf.extend_from_slice(b"\r\n");

    for (name, section) in sections {
        write_header(&mut sf, "Name", name);
        write_header(
            &mut sf,
            &format!("{}-Digest", alg.name()),
            &alg.encoded_digest(section),
        );
        sf.extend_from_slice(b"\r\n");
    }
    sf
}

/// `key: value` folded at 72 bytes with single-space continuation lines.
fn write_header(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let mut rest = line.as_str();
    let mut limit = LINE_LIMIT;
    let mut first = true;
    while !rest.is_empty() {
        let mut split = rest.len().min(limit);
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        if !first {
            out.push(b' ');
        }
        out.extend_from_slice(&rest.as_bytes()[..split]);
        out.extend_from_slice(b"\r\n");
        rest = &rest[split..];
        limit = LINE_LIMIT - 1;
        first = false;
    }
}

/// Zip `entries` in order.
pub fn write_zip(entries: &IndexMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("adding {name}"))?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Re-zip `archive` after `edit` changed its entries; signatures are left as they were.
pub fn rewrite_archive<F>(archive: &[u8], edit: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut IndexMap<String, Vec<u8>>) -> Result<()>,
{
    let mut entries = ArchiveContents::from_reader(Cursor::new(archive))?.into_entries();
    edit(&mut entries)?;
    write_zip(&entries)
}

/// Apply a textual edit to one entry of `entries`.
pub fn edit_text<F>(entries: &mut IndexMap<String, Vec<u8>>, name: &str, edit: F) -> Result<()>
where
    F: FnOnce(String) -> String,
{
    let bytes = entries
        .get_mut(name)
        .with_context(|| format!("archive has no entry `{name}`"))?;
    let text = String::from_utf8(std::mem::take(bytes))
        .with_context(|| format!("entry `{name}` is not text"))?;
    *bytes = edit(text).into_bytes();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_headers_are_folded() {
        let mut out = Vec::new();
        let name = "x".repeat(100);
        write_header(&mut out, "Name", &name);
        let text = String::from_utf8(out).expect("ascii");
        let lines: Vec<_> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 72);
        assert!(lines[1].starts_with(' '));
        assert_eq!(lines[0].len() + lines[1].len() - 1, "Name: ".len() + 100);
    }
}
