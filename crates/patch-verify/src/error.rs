use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("malformed patch archive: {message}")]
    ArchiveFormat {
        message: String,
        #[source]
        source: Option<zip::result::ZipError>,
    },
    #[error("signature check failed: {0}")]
    Signature(String),
    #[error("untrusted signer certificate {subject} (sha256 {fingerprint})")]
    Trust { subject: String, fingerprint: String },
    #[error("required patch property `{name}` is missing")]
    MissingProperty { name: &'static str },
    #[error("I/O error while reading patch archive: {0}")]
    Io(#[from] io::Error),
}

impl PackageError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::ArchiveFormat {
            message: message.into(),
            source: None,
        }
    }

    pub fn zip(message: impl Into<String>, source: zip::result::ZipError) -> Self {
        match source {
            zip::result::ZipError::Io(err) => Self::Io(err),
            other => Self::ArchiveFormat {
                message: message.into(),
                source: Some(other),
            },
        }
    }

    pub fn signature(message: impl Into<String>) -> Self {
        Self::Signature(message.into())
    }

    pub fn openssl(context: &str, err: openssl::error::ErrorStack) -> Self {
        Self::Signature(format!("{context}: {err}"))
    }
}
