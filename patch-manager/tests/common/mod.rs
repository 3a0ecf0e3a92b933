#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use patch_manager::{
    InstallCommand, InstallOutcome, Launcher, ManagerConfig, MemoryAuditLog, PatchService,
};
use patch_verify::test_tools::{PatchBuilder, TestSigner};
use tempfile::TempDir;

pub fn signer() -> &'static TestSigner {
    static SIGNER: OnceLock<TestSigner> = OnceLock::new();
    SIGNER.get_or_init(|| TestSigner::generate("Node Patch Signer").expect("signer"))
}

pub fn stranger() -> &'static TestSigner {
    static SIGNER: OnceLock<TestSigner> = OnceLock::new();
    SIGNER.get_or_init(|| TestSigner::generate("Stranger").expect("signer"))
}

/// Signed by the node's trusted signer.
pub fn archive(builder: PatchBuilder) -> Vec<u8> {
    builder.build(signer()).expect("build patch")
}

enum Script {
    Exit { code: Option<i32>, output: String },
    SpawnError,
}

/// Records commands instead of running them.
pub struct StubLauncher {
    script: Mutex<Script>,
    commands: Mutex<Vec<InstallCommand>>,
    delay: Mutex<Duration>,
}

impl StubLauncher {
    pub fn exiting(code: i32, output: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::Exit {
                code: Some(code),
                output: output.to_string(),
            }),
            commands: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Every launch sleeps this long before returning.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_exit(&self, code: i32, output: &str) {
        *self.script.lock().unwrap() = Script::Exit {
            code: Some(code),
            output: output.to_string(),
        };
    }

    pub fn fail_to_spawn(&self) {
        *self.script.lock().unwrap() = Script::SpawnError;
    }

    pub fn commands(&self) -> Vec<InstallCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl Launcher for StubLauncher {
    fn launch(&self, command: &InstallCommand) -> io::Result<InstallOutcome> {
        self.commands.lock().unwrap().push(command.clone());
        let delay = *self.delay.lock().unwrap();
        thread::sleep(delay);
        match &*self.script.lock().unwrap() {
            Script::Exit { code, output } => Ok(InstallOutcome {
                exit_code: *code,
                output: output.clone(),
            }),
            Script::SpawnError => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no such file or directory",
            )),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub service: PatchService,
    pub launcher: Arc<StubLauncher>,
    pub audit: Arc<MemoryAuditLog>,
}

impl Harness {
    pub fn repo_dir(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.repo_dir().join(format!("{id}.jar"))
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let pem = signer().write_certificate(dir.path()).expect("signer pem");

    let mut config = ManagerConfig::new(dir.path().join("repo"));
    config.trusted_certificates = vec![pem];
    config
        .endpoint_properties
        .insert("node.endpoint".into(), "https://localhost:8443".into());
    configure(&mut config);

    let launcher = StubLauncher::exiting(0, "installed\n");
    let audit = Arc::new(MemoryAuditLog::new());
    let service = PatchService::new(config)
        .expect("service")
        .with_launcher(launcher.clone())
        .with_audit_log(audit.clone());
    Harness {
        dir,
        service,
        launcher,
        audit,
    }
}
