//! Durable per-patch lifecycle records stored as `<id>.status` property files.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use patch_verify::Properties;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage;
use crate::types::{PatchError, PatchId};

pub const STATUS_EXTENSION: &str = "status";

/// Lifecycle state of a patch on this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchState {
    None,
    Uploaded,
    Installed,
    RolledBack,
    Error,
}

impl PatchState {
    pub const ALL: [PatchState; 5] = [
        Self::None,
        Self::Uploaded,
        Self::Installed,
        Self::RolledBack,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Uploaded => "UPLOADED",
            Self::Installed => "INSTALLED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Error => "ERROR",
        }
    }

    /// Whether the state's history may be discarded along with the archive.
    ///
    /// `ERROR` reports false: its archive may still be removed, but the
    /// record itself is kept.
    pub fn allow_delete(self) -> bool {
        matches!(self, Self::None | Self::Uploaded | Self::RolledBack)
    }

    /// States from which `install` may start.
    pub fn can_install(self) -> bool {
        matches!(self, Self::Uploaded | Self::RolledBack)
    }
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == value.trim())
            .ok_or_else(|| format!("unknown patch state `{value}`"))
    }
}

/// Keys of a status file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusField {
    Id,
    Description,
    State,
    RollbackForId,
    StatusMsg,
    LastMod,
}

impl StatusField {
    pub const ALL: [StatusField; 6] = [
        Self::Id,
        Self::Description,
        Self::State,
        Self::RollbackForId,
        Self::StatusMsg,
        Self::LastMod,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Description => "DESCRIPTION",
            Self::State => "STATE",
            Self::RollbackForId => "ROLLBACK_FOR_ID",
            Self::StatusMsg => "STATUS_MSG",
            Self::LastMod => "LAST_MOD",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Self::Id | Self::Description | Self::State)
    }
}

/// Lifecycle record of one patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PatchStatus {
    pub id: String,
    pub description: String,
    pub state: PatchState,
    pub rollback_for_id: Option<String>,
    pub status_message: Option<String>,
    /// Epoch milliseconds of the last save.
    pub last_modified: u64,
}

impl PatchStatus {
    pub fn new(id: impl Into<String>, description: impl Into<String>, state: PatchState) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            state,
            rollback_for_id: None,
            status_message: None,
            last_modified: 0,
        }
    }

    /// Default answer for an id that has no status file.
    pub fn none(id: &PatchId) -> Self {
        Self::new(id.as_str(), "", PatchState::None)
    }

    pub fn field(&self, field: StatusField) -> Option<String> {
        match field {
            StatusField::Id => Some(self.id.clone()),
            StatusField::Description => Some(self.description.clone()),
            StatusField::State => Some(self.state.as_str().to_string()),
            StatusField::RollbackForId => self.rollback_for_id.clone(),
            StatusField::StatusMsg => self.status_message.clone(),
            StatusField::LastMod => Some(self.last_modified.to_string()),
        }
    }

    pub fn to_properties(&self) -> Properties {
        StatusField::ALL
            .into_iter()
            .filter_map(|field| self.field(field).map(|value| (field.key(), value)))
            .collect()
    }

    pub fn from_properties(properties: &Properties) -> Result<Self, String> {
        check_required(properties)?;
        let get = |field: StatusField| properties.get(field.key()).map(str::to_string);

        let state = properties
            .get(StatusField::State.key())
            .unwrap_or_default()
            .parse()?;
        let last_modified = match properties.get(StatusField::LastMod.key()) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| format!("invalid LAST_MOD `{value}`"))?,
            None => 0,
        };
        Ok(Self {
            id: get(StatusField::Id).unwrap_or_default(),
            description: get(StatusField::Description).unwrap_or_default(),
            state,
            rollback_for_id: get(StatusField::RollbackForId).filter(|v| !v.is_empty()),
            status_message: get(StatusField::StatusMsg),
            last_modified,
        })
    }
}

fn check_required(properties: &Properties) -> Result<(), String> {
    for field in StatusField::ALL.into_iter().filter(|f| f.is_required()) {
        if !properties.contains_key(field.key()) {
            return Err(format!("missing required field {}", field.key()));
        }
    }
    if properties
        .get(StatusField::Id.key())
        .is_some_and(|id| id.trim().is_empty())
    {
        return Err("empty ID".into());
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Reads and writes `<id>.status` files in one directory.
#[derive(Clone, Debug)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, id: &PatchId) -> PathBuf {
        self.dir.join(format!("{id}.{STATUS_EXTENSION}"))
    }

    /// The persisted status, or `None` when the id has never been saved.
    pub fn load(&self, id: &PatchId) -> Result<Option<PatchStatus>, PatchError> {
        let path = self.path(id);
        if !path.is_file() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    /// Persisted status or a transient `NONE` status.
    pub fn get(&self, id: &PatchId) -> Result<PatchStatus, PatchError> {
        Ok(self.load(id)?.unwrap_or_else(|| PatchStatus::none(id)))
    }

    pub(crate) fn read(&self, path: &Path) -> Result<PatchStatus, PatchError> {
        let bytes = fs::read(path)
            .map_err(|err| PatchError::io(format!("cannot read {}", path.display()), err))?;
        let properties = Properties::from_bytes(&bytes);
        PatchStatus::from_properties(&properties).map_err(|message| PatchError::status(path, message))
    }

    /// Stamp `LAST_MOD` and atomically replace the status file.
    pub fn save(&self, status: &PatchStatus) -> Result<PatchStatus, PatchError> {
        let id = PatchId::new(status.id.as_str())?;
        let mut saved = status.clone();
        saved.last_modified = now_millis();

        let properties = saved.to_properties();
        let path = self.path(&id);
        check_required(&properties).map_err(|message| PatchError::status(&path, message))?;

        let rendered = properties.render(Some("patch status"));
        let round_trip = Properties::parse(&rendered);
        check_required(&round_trip).map_err(|message| PatchError::status(&path, message))?;

        storage::write_atomic(&path, rendered.as_bytes())
            .map_err(|err| PatchError::io(format!("cannot write {}", path.display()), err))?;
        debug!(patch_id = %id, state = %saved.state, "saved patch status");
        Ok(saved)
    }

    /// Every `<id>.status` file in the directory, sorted by id.
    pub fn entries(&self) -> Result<Vec<(String, PathBuf)>, PatchError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PatchError::io(
                    format!("cannot list {}", self.dir.display()),
                    err,
                ));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| {
                PatchError::io(format!("cannot list {}", self.dir.display()), err)
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATUS_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                entries.push((id.to_string(), path.clone()));
            }
        }
        entries.sort();
        Ok(entries)
    }
}
