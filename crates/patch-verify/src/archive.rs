use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;
use zip::ZipArchive;

use crate::error::PackageError;

const META_INF: &str = "META-INF/";
const SIGNATURE_BLOCK_EXTENSIONS: [&str; 3] = [".RSA", ".DSA", ".EC"];

/// Fully read contents of a patch archive, keyed by entry name in archive order.
///
/// Every entry is read to the end while loading so a truncated or corrupt
/// member fails here rather than halfway through verification. Buffers grow
/// with the bytes actually read; the size a header declares is only compared
/// afterwards.
#[derive(Clone, Debug)]
pub struct ArchiveContents {
    entries: IndexMap<String, Vec<u8>>,
}

impl ArchiveContents {
    pub fn open(path: &Path) -> Result<Self, PackageError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read + std::io::Seek>(reader: R) -> Result<Self, PackageError> {
        let mut archive =
            ZipArchive::new(reader).map_err(|err| PackageError::zip("cannot open archive", err))?;

        let mut entries = IndexMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .map_err(|err| PackageError::zip("cannot read archive entry", err))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let declared = file.size();
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            if bytes.len() as u64 != declared {
                return Err(PackageError::format(format!(
                    "entry `{name}` declares {declared} bytes but holds {}",
                    bytes.len()
                )));
            }
            debug!(entry = %name, size = bytes.len(), "read archive entry");
            if entries.insert(name.clone(), bytes).is_some() {
                return Err(PackageError::format(format!(
                    "duplicate archive entry `{name}`"
                )));
            }
        }

        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn into_entries(self) -> IndexMap<String, Vec<u8>> {
        self.entries
    }

    /// Signature files (`META-INF/<ALIAS>.SF`) paired with their block file, if any.
    pub fn signers(&self) -> Vec<SignerFiles<'_>> {
        self.names()
            .filter_map(|name| {
                let alias = meta_inf_file(name)?.strip_suffix_ignore_case(".SF")?;
                let block = SIGNATURE_BLOCK_EXTENSIONS.iter().find_map(|ext| {
                    let block_name = format!("{META_INF}{alias}{ext}");
                    self.entries
                        .get_key_value(&block_name)
                        .map(|(k, v)| (k.as_str(), v.as_slice()))
                });
                Some(SignerFiles {
                    alias,
                    signature_file: name,
                    block,
                })
            })
            .collect()
    }
}

/// The files making up one signer's signature.
#[derive(Clone, Copy, Debug)]
pub struct SignerFiles<'a> {
    pub alias: &'a str,
    pub signature_file: &'a str,
    pub block: Option<(&'a str, &'a [u8])>,
}

/// Entries that carry signature metadata and are therefore not signed themselves.
pub fn is_signature_related(name: &str) -> bool {
    if name.eq_ignore_ascii_case(crate::manifest::MANIFEST_NAME) {
        return true;
    }
    let Some(file) = meta_inf_file(name) else {
        return false;
    };
    let upper = file.to_ascii_uppercase();
    upper.ends_with(".SF")
        || SIGNATURE_BLOCK_EXTENSIONS
            .iter()
            .any(|ext| upper.ends_with(ext))
        || upper.starts_with("SIG-")
}

/// File name directly under `META-INF/`; `None` for nested paths or other directories.
fn meta_inf_file(name: &str) -> Option<&str> {
    let prefix = name.get(..META_INF.len())?;
    if !prefix.eq_ignore_ascii_case(META_INF) {
        return None;
    }
    let file = &name[META_INF.len()..];
    (!file.is_empty() && !file.contains('/')).then_some(file)
}

trait StripSuffixIgnoreCase {
    fn strip_suffix_ignore_case(&self, suffix: &str) -> Option<&str>;
}

impl StripSuffixIgnoreCase for str {
    fn strip_suffix_ignore_case(&self, suffix: &str) -> Option<&str> {
        let split = self.len().checked_sub(suffix.len())?;
        let tail = self.get(split..)?;
        (tail.eq_ignore_ascii_case(suffix) && split > 0).then(|| &self[..split])
    }
}
