//! Command line and process launch for the external installer.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};

use indexmap::IndexMap;
use tracing::debug;

pub const TARGET_NODE_IDS_PROPERTY: &str = "target.node.ids";

/// `[wrapper...] <java> -Dk=v... [-Dtarget.node.ids=..] -jar <archive>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl InstallCommand {
    pub fn build(
        wrapper: &[String],
        java_binary: &str,
        endpoint_properties: &IndexMap<String, String>,
        node_ids: &[String],
        archive: &Path,
    ) -> Self {
        let mut argv: Vec<String> = wrapper.to_vec();
        argv.push(java_binary.to_string());
        argv.extend(
            endpoint_properties
                .iter()
                .map(|(key, value)| format!("-D{key}={value}")),
        );
        if !node_ids.is_empty() {
            argv.push(format!("-D{TARGET_NODE_IDS_PROPERTY}={}", node_ids.join(",")));
        }
        argv.push("-jar".to_string());
        argv.push(archive.display().to_string());

        let program = argv.remove(0);
        Self {
            program,
            args: argv,
        }
    }
}

impl fmt::Display for InstallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a finished installer process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Standard output and standard error as written to one shared pipe, so
    /// their interleaving is kept. Bytes that are not UTF-8 are replaced.
    pub output: String,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the installer to completion.
pub trait Launcher: Send + Sync {
    fn launch(&self, command: &InstallCommand) -> io::Result<InstallOutcome>;
}

/// Spawns the installer as a child process and waits for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, command: &InstallCommand) -> io::Result<InstallOutcome> {
        debug!(command = %command, "launching installer");
        let (mut reader, writer) = io::pipe()?;
        // The command's copies of the write end must be gone before reading.
        let mut child = {
            let mut process = Command::new(&command.program);
            process
                .args(&command.args)
                .stdin(Stdio::null())
                .stdout(writer.try_clone()?)
                .stderr(writer);
            process.spawn()?
        };

        let mut output = Vec::new();
        let read = reader.read_to_end(&mut output);
        let status = child.wait()?;
        read?;
        Ok(InstallOutcome {
            exit_code: status.code(),
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builds_wrapped_command() {
        let mut endpoint = IndexMap::new();
        endpoint.insert("node.endpoint".to_string(), "https://localhost:8443".to_string());
        endpoint.insert("node.user".to_string(), "admin".to_string());

        let command = InstallCommand::build(
            &["sudo".to_string(), "-n".to_string()],
            "/opt/jdk/bin/java",
            &endpoint,
            &["node1".to_string(), "node2".to_string()],
            &PathBuf::from("/repo/p1.jar"),
        );

        assert_eq!(command.program, "sudo");
        assert_eq!(
            command.args,
            [
                "-n",
                "/opt/jdk/bin/java",
                "-Dnode.endpoint=https://localhost:8443",
                "-Dnode.user=admin",
                "-Dtarget.node.ids=node1,node2",
                "-jar",
                "/repo/p1.jar",
            ]
        );
    }

    #[test]
    fn omits_node_ids_when_empty() {
        let command = InstallCommand::build(
            &[],
            "java",
            &IndexMap::new(),
            &[],
            &PathBuf::from("p1.jar"),
        );
        assert_eq!(command.to_string(), "java -jar p1.jar");
    }

    #[cfg(unix)]
    #[test]
    fn process_launcher_captures_output_and_exit_code() {
        let command = InstallCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err >&2; exit 3".into()],
        };
        let outcome = ProcessLauncher.launch(&command).unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert_eq!(outcome.output, "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn process_launcher_keeps_stream_interleaving() {
        let command = InstallCommand {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "echo one; echo two >&2; echo three; echo four >&2".into(),
            ],
        };
        let outcome = ProcessLauncher.launch(&command).unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output, "one\ntwo\nthree\nfour\n");
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let command = InstallCommand {
            program: "/nonexistent/java-for-patch-tests".into(),
            args: Vec::new(),
        };
        assert!(ProcessLauncher.launch(&command).is_err());
    }
}
