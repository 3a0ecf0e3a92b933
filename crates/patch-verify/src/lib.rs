//! Parsing and trust verification of signed patch archives.

pub mod archive;
pub mod certificate;
pub mod error;
pub mod manifest;
pub mod package;
pub mod properties;
pub mod signature;
pub mod trust;
pub mod verify;

pub use certificate::{Certificate, CertificateChain};
pub use error::PackageError;
pub use package::{PATCH_PROPERTIES_ENTRY, PatchPackage, PatchProperty, parse};
pub use properties::Properties;
pub use trust::TrustedCertificates;
pub use verify::verify;

pub mod test_tools;
