//! Append-only record of patch operations.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::status::now_millis;
use crate::types::PatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Upload,
    Install,
    Rollback,
    Delete,
    List,
    Status,
    Property,
    AutoDelete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: now_millis(),
            action,
            patch_id: None,
            nodes: Vec::new(),
            message: None,
        }
    }

    pub fn patch(mut self, id: impl Into<String>) -> Self {
        self.patch_id = Some(id.into());
        self
    }

    pub fn nodes(mut self, nodes: &[String]) -> Self {
        self.nodes = nodes.to_vec();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Sink for audit records. Records are only ever appended.
pub trait AuditLog: Send + Sync {
    fn record(&self, record: AuditRecord) -> Result<(), PatchError>;

    /// Every record in append order.
    fn records(&self) -> Result<Vec<AuditRecord>, PatchError>;
}

/// One JSON document per line in an append-only file.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    append: Mutex<()>,
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: io::Error) -> PatchError {
        PatchError::io(format!("audit log {}", self.path.display()), err)
    }
}

impl AuditLog for FileAuditLog {
    fn record(&self, record: AuditRecord) -> Result<(), PatchError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|err| self.io_error(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        line.push(b'\n');

        let _append = self.append.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        file.write_all(&line).map_err(|err| self.io_error(err))?;
        file.sync_data().map_err(|err| self.io_error(err))
    }

    fn records(&self) -> Result<Vec<AuditRecord>, PatchError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| self.io_error(err))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable audit record"
                ),
            }
        }
        Ok(records)
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, record: AuditRecord) -> Result<(), PatchError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<AuditRecord>, PatchError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
