//! Node properties persisted in a Java properties file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use patch_verify::Properties;
use tracing::debug;

use crate::storage;
use crate::types::PatchError;

pub const AUTO_DELETE_PROPERTY: &str = "patch.autoDelete";

#[derive(Debug)]
pub struct NodeProperties {
    path: PathBuf,
    values: Mutex<Properties>,
}

impl NodeProperties {
    /// Load `path`; a missing file starts out empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PatchError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) => Properties::from_bytes(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Properties::new(),
            Err(err) => {
                return Err(PatchError::io(
                    format!("cannot read {}", path.display()),
                    err,
                ));
            }
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values().get(name).map(str::to_string)
    }

    /// Store `value` and return the previous one.
    pub fn set(&self, name: &str, value: &str) -> Result<Option<String>, PatchError> {
        let mut values = self.values();
        let mut updated = values.clone();
        let previous = updated.insert(name, value);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                PatchError::io(format!("cannot create {}", parent.display()), err)
            })?;
        }
        let rendered = updated.render(Some("node properties"));
        storage::write_atomic(&self.path, rendered.as_bytes()).map_err(|err| {
            PatchError::io(format!("cannot write {}", self.path.display()), err)
        })?;
        *values = updated;
        debug!(property = name, "stored node property");
        Ok(previous)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name)
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
    }

    fn values(&self) -> MutexGuard<'_, Properties> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.properties");

        let node = NodeProperties::open(&path).unwrap();
        assert_eq!(node.get("a"), None);
        assert_eq!(node.set("a", "1").unwrap(), None);
        assert_eq!(node.set("a", "2").unwrap(), Some("1".to_string()));
        node.set(AUTO_DELETE_PROPERTY, "TRUE").unwrap();

        let reopened = NodeProperties::open(&path).unwrap();
        assert_eq!(reopened.get("a").as_deref(), Some("2"));
        assert_eq!(reopened.get_bool(AUTO_DELETE_PROPERTY), Some(true));
    }
}
