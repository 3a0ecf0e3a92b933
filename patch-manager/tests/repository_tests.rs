mod common;

use std::fs;
use std::path::PathBuf;

use common::{archive, signer};
use patch_manager::{ErrorKind, PackageRepository, PatchId, PatchState};
use patch_verify::PatchPackage;
use patch_verify::test_tools::{PatchBuilder, edit_text, rewrite_archive};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    repository: PackageRepository,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let trusted = signer().trusted().expect("trusted");
    let repository = PackageRepository::open(dir.path().join("repo"), trusted).expect("repository");
    Fixture { dir, repository }
}

fn id(value: &str) -> PatchId {
    PatchId::new(value).expect("id")
}

impl Fixture {
    fn package(&self, builder: PatchBuilder) -> PatchPackage {
        let name = format!("incoming-{}.jar", self.dir.path().read_dir().unwrap().count());
        let path: PathBuf = self.dir.path().join(name);
        fs::write(&path, archive(builder)).expect("write archive");
        patch_verify::verify(&path, self.repository.trusted()).expect("verified")
    }
}

#[test]
fn save_stores_archive_and_uploaded_status() {
    let f = fixture();
    let package = f.package(PatchBuilder::new("p2").rollback_for("p1").description("revert"));
    let status = f.repository.save(&package).expect("save");

    assert_eq!(status.state, PatchState::Uploaded);
    assert_eq!(status.rollback_for_id.as_deref(), Some("p1"));
    assert!(status.last_modified > 0);
    assert!(f.repository.has_archive(&id("p2")));

    let loaded = f.repository.get(&id("p2")).expect("get");
    assert_eq!(loaded.description(), "revert");
    assert_eq!(loaded.archive_path(), f.repository.archive_path(&id("p2")));
}

#[test]
fn get_reverifies_stored_archive() {
    let f = fixture();
    f.repository
        .save(&f.package(PatchBuilder::new("p1")))
        .expect("save");

    let stored = f.repository.archive_path(&id("p1"));
    let tampered = rewrite_archive(&fs::read(&stored).unwrap(), |entries| {
        edit_text(entries, "patch.properties", |text| text.replace("test patch", "evil patch"))
    })
    .expect("tamper");
    fs::write(&stored, tampered).unwrap();

    let err = f.repository.get(&id("p1")).expect_err("tampered");
    assert_eq!(err.kind(), ErrorKind::Signature);
}

#[test]
fn get_without_archive_is_not_found() {
    let f = fixture();
    let err = f.repository.get(&id("ghost")).expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn save_over_installed_is_refused() {
    let f = fixture();
    let package = f.package(PatchBuilder::new("p1"));
    let mut status = f.repository.save(&package).expect("save");
    status.state = PatchState::Installed;
    f.repository.save_status(&status).expect("mark installed");

    let err = f.repository.save(&package).expect_err("installed");
    assert_eq!(err.kind(), ErrorKind::StateConflict);
    assert_eq!(
        f.repository.status(&id("p1")).unwrap().state,
        PatchState::Installed
    );
}

#[test]
fn delete_keeps_history_for_error_state() {
    let f = fixture();
    let package = f.package(PatchBuilder::new("p1"));
    let mut status = f.repository.save(&package).expect("save");
    status.state = PatchState::Error;
    status.status_message = Some("exit 1".into());
    f.repository.save_status(&status).expect("mark error");

    let deleted = f.repository.delete(&id("p1")).expect("delete");
    assert_eq!(deleted.state, PatchState::Error);
    assert_eq!(deleted.status_message.as_deref(), Some("exit 1"));
    assert!(!f.repository.has_archive(&id("p1")));

    // Deleting an unknown id is a no-op.
    let none = f.repository.delete(&id("ghost")).expect("delete unknown");
    assert_eq!(none.state, PatchState::None);
}

#[test]
fn rollbacks_for_scans_statuses() {
    let f = fixture();
    for builder in [
        PatchBuilder::new("p1"),
        PatchBuilder::new("r1").rollback_for("p1"),
        PatchBuilder::new("r2").rollback_for("p1"),
        PatchBuilder::new("other").rollback_for("p9"),
    ] {
        f.repository.save(&f.package(builder)).expect("save");
    }
    assert_eq!(f.repository.rollbacks_for(&id("p1")).unwrap(), ["r1", "r2"]);
    assert!(f.repository.rollbacks_for(&id("r1")).unwrap().is_empty());
}

#[test]
fn list_skips_records_filed_under_another_name() {
    let f = fixture();
    f.repository
        .save(&f.package(PatchBuilder::new("p1")))
        .expect("save");
    let rendered = fs::read(f.repository.statuses().path(&id("p1"))).unwrap();
    fs::write(f.repository.dir().join("p1-copy.status"), rendered).unwrap();

    let listed = f.repository.list(false).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "p1");
}
