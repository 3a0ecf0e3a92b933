use std::fmt;
use std::io;
use std::path::PathBuf;

use patch_verify::PackageError;
use thiserror::Error;

const MAX_ID_LEN: usize = 128;

/// Coarse classification of a [`PatchError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ArchiveFormat,
    Signature,
    Trust,
    StateConflict,
    Io,
    ProcessExecution,
    InvalidId,
    NotFound,
    Status,
    Config,
}

/// Errors surfaced by every patch manager operation.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid patch archive: {0}")]
    ArchiveFormat(#[source] PackageError),
    #[error("patch signature rejected: {0}")]
    Signature(#[source] PackageError),
    #[error("patch signer rejected: {0}")]
    Trust(#[source] PackageError),
    #[error("patch `{id}`: {message}")]
    StateConflict { id: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("installer for patch `{id}` failed: {message}")]
    ProcessExecution {
        id: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("invalid patch id `{0}`")]
    InvalidId(String),
    #[error("patch `{0}` is not in the repository")]
    NotFound(String),
    #[error("status record {path} is invalid: {message}")]
    Status { path: PathBuf, message: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArchiveFormat(_) => ErrorKind::ArchiveFormat,
            Self::Signature(_) => ErrorKind::Signature,
            Self::Trust(_) => ErrorKind::Trust,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::Io { .. } => ErrorKind::Io,
            Self::ProcessExecution { .. } => ErrorKind::ProcessExecution,
            Self::InvalidId(_) => ErrorKind::InvalidId,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Status { .. } => ErrorKind::Status,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn state_conflict(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateConflict {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn process(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessExecution {
            id: id.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn status(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Status {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<PackageError> for PatchError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::Signature(_) => Self::Signature(err),
            PackageError::Trust { .. } => Self::Trust(err),
            PackageError::Io(source) => Self::io("cannot read patch archive", source),
            PackageError::ArchiveFormat { .. } | PackageError::MissingProperty { .. } => {
                Self::ArchiveFormat(err)
            }
        }
    }
}

impl From<serde_json::Error> for PatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_yaml_bw::Error> for PatchError {
    fn from(err: serde_yaml_bw::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A patch identifier that is safe to use as a file name stem.
///
/// Ids start with an ASCII letter or digit, continue with letters, digits,
/// `.`, `_` or `-`, and are at most 128 bytes long.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchId(String);

impl PatchId {
    pub fn new(id: impl Into<String>) -> Result<Self, PatchError> {
        let id = id.into();
        let mut bytes = id.bytes();
        let valid = id.len() <= MAX_ID_LEN
            && bytes.next().is_some_and(|b| b.is_ascii_alphanumeric())
            && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(PatchError::InvalidId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PatchId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        for id in ["p1", "Patch-2024.10_fix", "9"] {
            assert_eq!(PatchId::new(id).expect(id).as_str(), id);
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        for id in ["", "../p1", "a/b", ".hidden", "-flag", "p 1", "a\\b", "ü"] {
            let err = PatchId::new(id).expect_err(id);
            assert_eq!(err.kind(), ErrorKind::InvalidId);
        }
        assert!(PatchId::new("x".repeat(129)).is_err());
        assert!(PatchId::new("x".repeat(128)).is_ok());
    }

    #[test]
    fn package_errors_keep_their_kind() {
        let err: PatchError = PackageError::signature("bad").into();
        assert_eq!(err.kind(), ErrorKind::Signature);
        let err: PatchError = PackageError::MissingProperty { name: "ID" }.into();
        assert_eq!(err.kind(), ErrorKind::ArchiveFormat);
        let err: PatchError = PackageError::Trust {
            subject: "CN=x".into(),
            fingerprint: "00".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Trust);
    }
}
