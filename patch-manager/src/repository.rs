//! On-disk patch repository: `<id>.jar` archives next to `<id>.status` records.

use std::fs;
use std::path::{Path, PathBuf};

use patch_verify::{PackageError, PatchPackage, TrustedCertificates};
use tracing::{debug, info, instrument, warn};

use crate::locks::{IdGuard, IdLocks};
use crate::status::{PatchState, PatchStatus, StatusStore};
use crate::storage;
use crate::types::{PatchError, PatchId};

pub const ARCHIVE_EXTENSION: &str = "jar";

#[derive(Debug)]
pub struct PackageRepository {
    dir: PathBuf,
    statuses: StatusStore,
    trusted: TrustedCertificates,
    locks: IdLocks,
}

impl PackageRepository {
    /// Open (creating if needed) the repository at `dir`.
    ///
    /// `trusted` is the signer set every archive is re-verified against on read.
    pub fn open(dir: impl Into<PathBuf>, trusted: TrustedCertificates) -> Result<Self, PatchError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| PatchError::io(format!("cannot create {}", dir.display()), err))?;
        Ok(Self {
            statuses: StatusStore::new(&dir),
            dir,
            trusted,
            locks: IdLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn trusted(&self) -> &TrustedCertificates {
        &self.trusted
    }

    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    pub fn archive_path(&self, id: &PatchId) -> PathBuf {
        self.dir.join(format!("{id}.{ARCHIVE_EXTENSION}"))
    }

    pub fn has_archive(&self, id: &PatchId) -> bool {
        self.archive_path(id).is_file()
    }

    /// Hold `ids` until the guard is dropped.
    pub fn lock(&self, ids: &[&PatchId]) -> IdGuard<'_> {
        self.locks.lock(ids)
    }

    /// Persisted status or a transient `NONE`.
    pub fn status(&self, id: &PatchId) -> Result<PatchStatus, PatchError> {
        self.statuses.get(id)
    }

    pub fn save_status(&self, status: &PatchStatus) -> Result<PatchStatus, PatchError> {
        self.statuses.save(status)
    }

    /// Copy a verified package into the repository and mark it `UPLOADED`.
    #[instrument(skip(self, package), fields(patch_id = package.id()))]
    pub fn save(&self, package: &PatchPackage) -> Result<PatchStatus, PatchError> {
        let id = PatchId::new(package.id())?;
        let _guard = self.lock(&[&id]);

        if let Some(current) = self.statuses.load(&id)? {
            if current.state == PatchState::Installed {
                warn!("refusing to overwrite an installed patch");
                return Err(PatchError::state_conflict(
                    id.as_str(),
                    "is installed and cannot be overwritten",
                ));
            }
        }

        let target = self.archive_path(&id);
        debug!(archive = %target.display(), "storing patch archive");
        storage::copy_atomic(package.archive_path(), &target)
            .map_err(|err| PatchError::io(format!("cannot store {}", target.display()), err))?;

        let mut status = PatchStatus::new(id.as_str(), package.description(), PatchState::Uploaded);
        status.rollback_for_id = package.rollback_for_id().map(str::to_string);
        let saved = self.statuses.save(&status)?;
        info!("patch stored");
        Ok(saved)
    }

    /// Load and re-verify the stored archive.
    #[instrument(skip(self), fields(patch_id = %id))]
    pub fn get(&self, id: &PatchId) -> Result<PatchPackage, PatchError> {
        let path = self.archive_path(id);
        if !path.is_file() {
            return Err(PatchError::NotFound(id.to_string()));
        }
        let package = patch_verify::verify(&path, &self.trusted)?;
        if package.id() != id.as_str() {
            return Err(PatchError::ArchiveFormat(PackageError::format(format!(
                "archive stored as `{id}` declares id `{}`",
                package.id()
            ))));
        }
        Ok(package)
    }

    /// Remove the archive; `UPLOADED` falls back to `NONE`, other states are kept.
    #[instrument(skip(self), fields(patch_id = %id))]
    pub fn delete(&self, id: &PatchId) -> Result<PatchStatus, PatchError> {
        let _guard = self.lock(&[id]);
        self.delete_locked(id)
    }

    /// [`delete`](Self::delete) for callers already holding the id lock.
    pub(crate) fn delete_locked(&self, id: &PatchId) -> Result<PatchStatus, PatchError> {
        let current = self.statuses.load(id)?;
        if let Some(status) = &current {
            if status.state == PatchState::Installed {
                warn!("refusing to delete an installed patch");
                return Err(PatchError::state_conflict(
                    id.as_str(),
                    "is installed and cannot be deleted",
                ));
            }
        }

        let path = self.archive_path(id);
        let removed = storage::remove_if_exists(&path)
            .map_err(|err| PatchError::io(format!("cannot delete {}", path.display()), err))?;
        debug!(removed, "patch archive removed");

        match current {
            Some(status) if status.state == PatchState::Uploaded => {
                let mut demoted = status;
                demoted.state = PatchState::None;
                self.statuses.save(&demoted)
            }
            Some(status) => Ok(status),
            None => Ok(PatchStatus::none(id)),
        }
    }

    /// Every readable status, sorted by id; unreadable records are skipped.
    #[instrument(skip(self))]
    pub fn list(&self, ignore_deleted: bool) -> Result<Vec<PatchStatus>, PatchError> {
        let mut statuses = Vec::new();
        for (name, path) in self.statuses.entries()? {
            let status = match self.statuses.read(&path) {
                Ok(status) => status,
                Err(err) => {
                    warn!(status_file = %path.display(), error = %err, "skipping unreadable patch status");
                    continue;
                }
            };
            if status.id != name {
                warn!(status_file = %path.display(), id = %status.id, "skipping status filed under another id");
                continue;
            }
            if ignore_deleted {
                match PatchId::new(name.as_str()) {
                    Ok(id) if self.has_archive(&id) => {}
                    _ => continue,
                }
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Ids of patches that declare themselves a rollback for `id`.
    pub fn rollbacks_for(&self, id: &PatchId) -> Result<Vec<String>, PatchError> {
        Ok(self
            .list(false)?
            .into_iter()
            .filter(|status| status.rollback_for_id.as_deref() == Some(id.as_str()))
            .map(|status| status.id)
            .collect())
    }
}
