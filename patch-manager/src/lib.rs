//! Patch repository, lifecycle status store, audit log and installer
//! orchestration for signed patch packages.

pub mod audit;
pub mod config;
pub mod installer;
pub mod locks;
pub mod node;
pub mod repository;
pub mod service;
pub mod status;
mod storage;
pub mod types;

pub use audit::{AuditAction, AuditLog, AuditRecord, FileAuditLog, MemoryAuditLog};
pub use config::{ManagerConfig, load_manager_config};
pub use installer::{InstallCommand, InstallOutcome, Launcher, ProcessLauncher};
pub use repository::PackageRepository;
pub use service::PatchService;
pub use status::{PatchState, PatchStatus, StatusField, StatusStore};
pub use types::{ErrorKind, PatchError, PatchId};

/// Build a [`PatchService`] from a JSON or YAML configuration file.
pub fn load_service(path: &std::path::Path) -> Result<PatchService, PatchError> {
    let config = load_manager_config(path)?;
    PatchService::new(config)
}
