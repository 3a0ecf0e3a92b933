//! Public operation surface: upload, install with rollback bookkeeping,
//! delete, list, status and node properties.

use std::io::Write;
use std::sync::Arc;

use patch_verify::{PackageError, PatchPackage, TrustedCertificates};
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditAction, AuditLog, AuditRecord, FileAuditLog};
use crate::config::ManagerConfig;
use crate::installer::{InstallCommand, Launcher, ProcessLauncher};
use crate::node::{AUTO_DELETE_PROPERTY, NodeProperties};
use crate::repository::PackageRepository;
use crate::status::{PatchState, PatchStatus};
use crate::types::{PatchError, PatchId};

pub struct PatchService {
    config: ManagerConfig,
    repository: PackageRepository,
    launcher: Arc<dyn Launcher>,
    audit: Arc<dyn AuditLog>,
    node: NodeProperties,
}

impl PatchService {
    /// Service with the process launcher and a file audit log, as configured.
    pub fn new(config: ManagerConfig) -> Result<Self, PatchError> {
        let trusted = TrustedCertificates::from_pem_files(&config.trusted_certificates)?;
        let repository = PackageRepository::open(&config.repository_dir, trusted)?;
        let node = NodeProperties::open(config.properties_path())?;
        let audit = Arc::new(FileAuditLog::new(config.audit_log_path()));
        Ok(Self {
            config,
            repository,
            launcher: Arc::new(ProcessLauncher),
            audit,
            node,
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn repository(&self) -> &PackageRepository {
        &self.repository
    }

    pub fn audit_log(&self) -> &dyn AuditLog {
        self.audit.as_ref()
    }

    /// Verify an uploaded archive and store it as `UPLOADED`.
    #[instrument(skip(self, archive), fields(size = archive.len()))]
    pub fn upload(&self, archive: &[u8]) -> Result<PatchStatus, PatchError> {
        info!("uploading patch");
        self.store_upload(archive)
            .inspect_err(|err| error!(error = %err, "patch upload failed"))
    }

    fn store_upload(&self, archive: &[u8]) -> Result<PatchStatus, PatchError> {
        let mut staged = tempfile::Builder::new()
            .prefix(".upload.")
            .suffix(".jar")
            .tempfile_in(self.repository.dir())
            .map_err(|err| PatchError::io("cannot stage upload", err))?;
        staged
            .write_all(archive)
            .and_then(|()| staged.flush())
            .map_err(|err| PatchError::io("cannot stage upload", err))?;

        let package = patch_verify::verify(staged.path(), self.repository.trusted())?;
        self.require_node_trust(&package)?;

        let status = self.repository.save(&package)?;
        self.record_audit(AuditRecord::new(AuditAction::Upload).patch(status.id.as_str()));
        info!(patch_id = %status.id, "patch uploaded");
        Ok(status)
    }

    /// Every signer must be one of this node's configured certificates,
    /// even when the embedded store already vouched for it.
    fn require_node_trust(&self, package: &PatchPackage) -> Result<(), PatchError> {
        for leaf in package.signer_certificates() {
            if !self.repository.trusted().contains(leaf) {
                warn!(subject = %leaf.subject(), "signer is not configured on this node");
                return Err(PatchError::Trust(PackageError::Trust {
                    subject: leaf.subject(),
                    fingerprint: leaf.fingerprint(),
                }));
            }
        }
        Ok(())
    }

    /// Run the installer for `id` on `node_ids`.
    ///
    /// A non-zero exit leaves the patch in `ERROR` and is reported as
    /// [`PatchError::ProcessExecution`]; the installer output is kept as the
    /// status message either way.
    #[instrument(skip(self, node_ids), fields(patch_id = id, nodes = node_ids.len()))]
    pub fn install(&self, id: &str, node_ids: &[String]) -> Result<PatchStatus, PatchError> {
        let id = PatchId::new(id)?;
        info!("installing patch");
        self.install_locked(&id, node_ids)
            .inspect_err(|err| error!(error = %err, "patch install failed"))
    }

    fn install_locked(&self, id: &PatchId, node_ids: &[String]) -> Result<PatchStatus, PatchError> {
        let declared = self.repository.status(id)?.rollback_for_id;
        let target = declared.as_deref().map(PatchId::new).transpose()?;
        let mut ids = vec![id];
        ids.extend(target.as_ref());
        let _guard = self.repository.lock(&ids);

        let status = self.repository.status(id)?;
        if !status.state.can_install() {
            return Err(PatchError::state_conflict(
                id.as_str(),
                format!("cannot be installed from state {}", status.state),
            ));
        }
        if status.rollback_for_id != declared {
            return Err(PatchError::state_conflict(
                id.as_str(),
                "was replaced while the install was starting",
            ));
        }

        let package = self.repository.get(id)?;
        if package.rollback_for_id() != declared.as_deref() {
            return Err(PatchError::state_conflict(
                id.as_str(),
                "archive and status disagree on the rollback target",
            ));
        }
        let rollback = match &target {
            Some(target) => Some(self.check_rollback_target(id, target)?),
            None => None,
        };

        let java = package
            .java_binary()
            .unwrap_or(self.config.java_binary.as_str());
        let command = InstallCommand::build(
            &self.config.launcher_wrapper,
            java,
            &self.config.endpoint_properties,
            node_ids,
            &self.repository.archive_path(id),
        );
        debug!(command = %command, "running installer");

        let outcome = match self.launcher.launch(&command) {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("cannot launch installer: {err}");
                self.finish_failed(&status, node_ids, &message)?;
                return Err(PatchError::ProcessExecution {
                    id: id.to_string(),
                    message,
                    source: Some(err),
                });
            }
        };

        if !outcome.success() {
            let exit = match outcome.exit_code {
                Some(code) => format!("installer exited with code {code}"),
                None => "installer was terminated by a signal".to_string(),
            };
            self.finish_failed(&status, node_ids, &outcome.output)?;
            return Err(PatchError::process(id.as_str(), exit));
        }

        let mut installed = status;
        installed.state = PatchState::Installed;
        installed.status_message = Some(outcome.output);
        let installed = self.repository.save_status(&installed)?;
        self.record_audit(
            AuditRecord::new(AuditAction::Install)
                .patch(id.as_str())
                .nodes(node_ids),
        );
        info!("patch installed");

        if let Some(mut rolled_back) = rollback {
            let target_id = PatchId::new(rolled_back.id.as_str())?;
            rolled_back.state = PatchState::RolledBack;
            rolled_back.status_message = Some(format!("rolled back by {id}"));
            self.repository.save_status(&rolled_back)?;
            self.record_audit(
                AuditRecord::new(AuditAction::Rollback)
                    .patch(target_id.as_str())
                    .nodes(node_ids)
                    .message(format!("rolled back by {id}")),
            );
            info!(target = %target_id, "patch rolled back");
            self.auto_delete(&target_id);
        }
        Ok(installed)
    }

    /// The rollback target must be installed and allow rollback.
    fn check_rollback_target(
        &self,
        id: &PatchId,
        target: &PatchId,
    ) -> Result<PatchStatus, PatchError> {
        let target_status = self.repository.status(target)?;
        if target_status.state != PatchState::Installed {
            return Err(PatchError::state_conflict(
                id.as_str(),
                format!(
                    "rolls back `{target}` which is {} rather than INSTALLED",
                    target_status.state
                ),
            ));
        }
        let target_package = self.repository.get(target)?;
        if !target_package.rollback_allowed() {
            return Err(PatchError::state_conflict(
                id.as_str(),
                format!("rolls back `{target}` which does not allow rollback"),
            ));
        }
        Ok(target_status)
    }

    fn finish_failed(
        &self,
        status: &PatchStatus,
        node_ids: &[String],
        message: &str,
    ) -> Result<(), PatchError> {
        let mut failed = status.clone();
        failed.state = PatchState::Error;
        failed.status_message = Some(message.to_string());
        self.repository.save_status(&failed)?;
        self.record_audit(
            AuditRecord::new(AuditAction::Install)
                .patch(failed.id.as_str())
                .nodes(node_ids)
                .message(message),
        );
        if let Ok(id) = PatchId::new(failed.id.as_str()) {
            self.auto_delete(&id);
        }
        Ok(())
    }

    /// Drop an archive that is no longer needed, when auto-delete is on.
    fn auto_delete(&self, id: &PatchId) {
        if !self.get_auto_delete() {
            return;
        }
        match self.repository.delete_locked(id) {
            Ok(status) => {
                debug!(patch_id = %id, state = %status.state, "auto-deleted patch archive");
                self.record_audit(AuditRecord::new(AuditAction::AutoDelete).patch(id.as_str()));
            }
            Err(err) => warn!(patch_id = %id, error = %err, "auto-delete failed"),
        }
    }

    /// Remove the stored archive of `id`.
    #[instrument(skip(self))]
    pub fn delete_package_archive(&self, id: &str) -> Result<PatchStatus, PatchError> {
        let id = PatchId::new(id)?;
        info!(patch_id = %id, "deleting patch archive");
        let status = self
            .repository
            .delete(&id)
            .inspect_err(|err| error!(patch_id = %id, error = %err, "patch delete failed"))?;
        self.record_audit(
            AuditRecord::new(AuditAction::Delete)
                .patch(id.as_str())
                .message(status.state.as_str()),
        );
        Ok(status)
    }

    #[instrument(skip(self))]
    pub fn list_patches(
        &self,
        ignore_deleted: bool,
        ignore_none_status: bool,
    ) -> Result<Vec<PatchStatus>, PatchError> {
        let statuses: Vec<_> = self
            .repository
            .list(ignore_deleted)?
            .into_iter()
            .filter(|status| !(ignore_none_status && status.state == PatchState::None))
            .collect();
        self.record_audit(
            AuditRecord::new(AuditAction::List).message(format!("{} patches", statuses.len())),
        );
        Ok(statuses)
    }

    #[instrument(skip(self))]
    pub fn get_status(&self, id: &str) -> Result<PatchStatus, PatchError> {
        let id = PatchId::new(id)?;
        let status = self.repository.status(&id)?;
        self.record_audit(
            AuditRecord::new(AuditAction::Status)
                .patch(id.as_str())
                .message(status.state.as_str()),
        );
        Ok(status)
    }

    pub fn get_property(&self, name: &str, default: &str) -> String {
        self.node.get(name).unwrap_or_else(|| default.to_string())
    }

    /// Store a node property and return its previous value.
    #[instrument(skip(self, value))]
    pub fn set_property(&self, name: &str, value: &str) -> Result<Option<String>, PatchError> {
        info!("setting node property");
        let previous = self
            .node
            .set(name, value)
            .inspect_err(|err| error!(error = %err, "cannot store node property"))?;
        self.record_audit(
            AuditRecord::new(AuditAction::Property).message(format!("{name}={value}")),
        );
        Ok(previous)
    }

    pub fn get_auto_delete(&self) -> bool {
        self.node
            .get_bool(AUTO_DELETE_PROPERTY)
            .unwrap_or(self.config.auto_delete)
    }

    /// Switch auto-delete and return the previous setting.
    pub fn set_auto_delete(&self, enabled: bool) -> Result<bool, PatchError> {
        let previous = self.get_auto_delete();
        self.set_property(AUTO_DELETE_PROPERTY, &enabled.to_string())?;
        Ok(previous)
    }

    /// Audit failures are logged; the operation they describe already happened.
    fn record_audit(&self, record: AuditRecord) {
        let action = record.action;
        if let Err(err) = self.audit.record(record) {
            error!(?action, error = %err, "cannot write audit record");
        }
    }
}
