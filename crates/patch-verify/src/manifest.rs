//! JAR manifest syntax shared by `META-INF/MANIFEST.MF` and the `.SF`
//! signature files.
//!
//! Besides the parsed attributes, every section remembers the byte range it
//! occupied (terminating blank line included) because signature files carry
//! digests of those raw bytes.

use std::ops::Range;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::PackageError;

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
pub const MAIN_CLASS: &str = "Main-Class";
pub const CLASS_PATH: &str = "Class-Path";
const NAME: &str = "Name";

/// Digest algorithms accepted in manifests and signature files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 3] = [Self::Sha256, Self::Sha384, Self::Sha512];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(name))
    }

    pub fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha384 => Sha384::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }

    /// Base64 digest as written into manifest attributes.
    pub fn encoded_digest(self, bytes: &[u8]) -> String {
        STANDARD.encode(self.digest(bytes))
    }
}

/// One manifest section: ordered attributes plus its raw byte range.
#[derive(Clone, Debug, Default)]
pub struct Section {
    attributes: IndexMap<String, String>,
    raw: Range<usize>,
}

impl Section {
    /// Case-insensitive attribute lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every `<ALG><suffix>` attribute in this section, e.g. suffix `-Digest`.
    ///
    /// Unknown algorithms are reported by name so callers can reject them.
    pub fn digests(&self, suffix: &str) -> Vec<(Result<DigestAlgorithm, String>, &str)> {
        self.attributes
            .iter()
            .filter_map(|(key, value)| {
                let split = key.len().checked_sub(suffix.len())?;
                let (alg, tail) = (key.get(..split)?, key.get(split..)?);
                if !tail.eq_ignore_ascii_case(suffix) || alg.is_empty() {
                    return None;
                }
                let alg = DigestAlgorithm::from_name(alg).ok_or_else(|| alg.to_string());
                Some((alg, value.as_str()))
            })
            .collect()
    }

    pub fn raw_range(&self) -> Range<usize> {
        self.raw.clone()
    }
}

/// Parsed manifest or signature file.
#[derive(Clone, Debug)]
pub struct Manifest {
    raw: Vec<u8>,
    main: Section,
    entries: IndexMap<String, Section>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, PackageError> {
        let mut sections: Vec<Section> = Vec::new();
        let mut current = Section::default();
        let mut last_key: Option<String> = None;
        let mut section_start = 0;
        let mut pos = 0;

        while pos < bytes.len() {
            let (line, next) = next_line(bytes, pos);
            if line.is_empty() {
                if !current.attributes.is_empty() || sections.is_empty() {
                    current.raw = section_start..next;
                    sections.push(std::mem::take(&mut current));
                }
                last_key = None;
                section_start = next;
                pos = next;
                continue;
            }

            let text = std::str::from_utf8(line)
                .map_err(|_| PackageError::format("manifest line is not valid UTF-8"))?;

            if let Some(continued) = text.strip_prefix(' ') {
                let Some(value) = last_key
                    .as_ref()
                    .and_then(|key| current.attributes.get_mut(key))
                else {
                    return Err(PackageError::format(
                        "manifest continuation line without a preceding attribute",
                    ));
                };
                value.push_str(continued);
            } else {
                let (key, value) = text.split_once(": ").ok_or_else(|| {
                    PackageError::format(format!("invalid manifest header `{text}`"))
                })?;
                if key.is_empty() {
                    return Err(PackageError::format("empty manifest attribute name"));
                }
                current.attributes.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            pos = next;
        }

        if !current.attributes.is_empty() || sections.is_empty() {
            current.raw = section_start..bytes.len();
            sections.push(current);
        }

        let mut iter = sections.into_iter();
        let main = iter.next().unwrap_or_default();
        let mut entries = IndexMap::new();
        for section in iter {
            let name = section
                .get(NAME)
                .ok_or_else(|| PackageError::format("manifest entry section lacks a `Name` header"))?
                .to_string();
            if entries.insert(name.clone(), section).is_some() {
                return Err(PackageError::format(format!(
                    "duplicate manifest section for `{name}`"
                )));
            }
        }

        Ok(Self {
            raw: bytes.to_vec(),
            main,
            entries,
        })
    }

    pub fn main(&self) -> &Section {
        &self.main
    }

    pub fn entry(&self, name: &str) -> Option<&Section> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Raw bytes of a section as they appear in the file.
    pub fn section_bytes(&self, section: &Section) -> &[u8] {
        self.raw.get(section.raw_range()).unwrap_or_default()
    }
}

/// Returns the line content (terminator excluded) and the offset after it.
fn next_line(bytes: &[u8], start: usize) -> (&[u8], usize) {
    let rest = &bytes[start..];
    match rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
        Some(idx) => {
            let mut next = start + idx + 1;
            if rest[idx] == b'\r' && rest.get(idx + 1) == Some(&b'\n') {
                next += 1;
            }
            (&rest[..idx], next)
        }
        None => (rest, bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Manifest-Version: 1.0\r\n\
Main-Class: com.example.Patch\r\n\
\r\n\
Name: patch.properties\r\n\
SHA-256-Digest: abc=\r\n\
\r\n\
Name: com/example/a-very-long-directory-name/that-keeps-going/Patch.cl\r\n ass\r\n\
SHA-256-Digest: def=\r\n\
\r\n";

    #[test]
    fn parses_sections_and_continuations() {
        let manifest = Manifest::parse(SAMPLE.as_bytes()).expect("manifest");
        assert_eq!(manifest.main().get("main-class"), Some("com.example.Patch"));
        assert_eq!(manifest.entries().count(), 2);

        let long = manifest
            .entry("com/example/a-very-long-directory-name/that-keeps-going/Patch.class")
            .expect("continued name");
        assert_eq!(long.get("SHA-256-Digest"), Some("def="));
    }

    #[test]
    fn section_bytes_include_the_terminating_blank_line() {
        let manifest = Manifest::parse(SAMPLE.as_bytes()).expect("manifest");
        let section = manifest.entry("patch.properties").expect("section");
        assert_eq!(
            manifest.section_bytes(section),
            b"Name: patch.properties\r\nSHA-256-Digest: abc=\r\n\r\n"
        );
        assert_eq!(
            manifest.section_bytes(manifest.main()),
            b"Manifest-Version: 1.0\r\nMain-Class: com.example.Patch\r\n\r\n"
        );
    }

    #[test]
    fn digest_attributes_are_classified_by_algorithm() {
        let manifest = Manifest::parse(
            b"Signature-Version: 1.0\nSHA-256-Digest-Manifest: x\nMD5-Digest-Manifest: y\n\n",
        )
        .expect("manifest");
        let digests = manifest.main().digests("-Digest-Manifest");
        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0].0, Ok(DigestAlgorithm::Sha256));
        assert_eq!(digests[1].0, Err("MD5".to_string()));
        assert!(manifest.main().digests("-Digest-Manifest-Main-Attributes").is_empty());
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(Manifest::parse(b"Manifest-Version 1.0\n\n").is_err());
        assert!(Manifest::parse(b" dangling\n\n").is_err());
        assert!(Manifest::parse(b"A: 1\n\nSHA-256-Digest: x\n\n").is_err());
    }
}
