use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::PatchError;

const DEFAULT_JAVA_BINARY: &str = "java";
const NODE_PROPERTIES_FILE: &str = "node.properties";
const AUDIT_LOG_FILE: &str = "audit.log";

/// Node-level settings for the patch manager.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ManagerConfig {
    pub repository_dir: PathBuf,
    /// PEM files holding the signers this node accepts.
    #[serde(default)]
    pub trusted_certificates: Vec<PathBuf>,
    #[serde(default = "default_java_binary")]
    pub java_binary: String,
    /// Passed to the installer as `-Dkey=value`, in this order.
    #[serde(default)]
    pub endpoint_properties: IndexMap<String, String>,
    /// Argv prefix such as `["sudo", "-n"]` used to run the installer.
    #[serde(default)]
    pub launcher_wrapper: Vec<String>,
    #[serde(default)]
    pub properties_file: Option<PathBuf>,
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    #[serde(default)]
    pub auto_delete: bool,
}

fn default_java_binary() -> String {
    DEFAULT_JAVA_BINARY.to_string()
}

impl ManagerConfig {
    pub fn new(repository_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository_dir: repository_dir.into(),
            trusted_certificates: Vec::new(),
            java_binary: default_java_binary(),
            endpoint_properties: IndexMap::new(),
            launcher_wrapper: Vec::new(),
            properties_file: None,
            audit_log: None,
            auto_delete: false,
        }
    }

    pub fn properties_path(&self) -> PathBuf {
        self.properties_file
            .clone()
            .unwrap_or_else(|| self.repository_dir.join(NODE_PROPERTIES_FILE))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.repository_dir.join(AUDIT_LOG_FILE))
    }

    fn validate(&self) -> Result<(), PatchError> {
        if self.repository_dir.as_os_str().is_empty() {
            return Err(PatchError::Config("repository_dir must not be empty".into()));
        }
        if self.java_binary.trim().is_empty() {
            return Err(PatchError::Config("java_binary must not be empty".into()));
        }
        if let Some(key) = self
            .endpoint_properties
            .keys()
            .find(|key| key.is_empty() || key.contains(char::is_whitespace))
        {
            return Err(PatchError::Config(format!(
                "invalid endpoint property name `{key}`"
            )));
        }
        Ok(())
    }
}

/// Load a [`ManagerConfig`] from JSON or YAML.
pub fn load_manager_config(path: &Path) -> Result<ManagerConfig, PatchError> {
    let content = fs::read_to_string(path)
        .map_err(|err| PatchError::io(format!("cannot read {}", path.display()), err))?;
    parse_manager_config(path, &content)
}

fn parse_manager_config(path: &Path, content: &str) -> Result<ManagerConfig, PatchError> {
    let config: ManagerConfig = if is_json(path, content) {
        serde_json::from_str(content)?
    } else {
        serde_yaml_bw::from_str(content)?
    };
    config.validate()?;
    Ok(config)
}

fn is_json(path: &Path, content: &str) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if matches!(ext, "json") {
            return true;
        }
        if matches!(ext, "yaml" | "yml") {
            return false;
        }
    }

    content
        .chars()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| c == '{' || c == '[')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json() {
        let config = parse_manager_config(
            Path::new("manager.json"),
            r#"{"repository_dir":"/var/lib/patches","endpoint_properties":{"b":"2","a":"1"}}"#,
        )
        .unwrap();

        assert_eq!(config.repository_dir, PathBuf::from("/var/lib/patches"));
        assert_eq!(config.java_binary, "java");
        let keys: Vec<_> = config.endpoint_properties.keys().collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(
            config.properties_path(),
            PathBuf::from("/var/lib/patches/node.properties")
        );
    }

    #[test]
    fn parses_yaml() {
        let config = parse_manager_config(
            Path::new("manager.yaml"),
            r#"
repository_dir: /var/lib/patches
java_binary: /opt/jdk/bin/java
launcher_wrapper: [sudo, -n]
trusted_certificates:
  - /etc/patches/signer.pem
auto_delete: true
audit_log: /var/log/patches/audit.log
        "#,
        )
        .unwrap();

        assert_eq!(config.java_binary, "/opt/jdk/bin/java");
        assert_eq!(config.launcher_wrapper, ["sudo", "-n"]);
        assert_eq!(config.trusted_certificates.len(), 1);
        assert!(config.auto_delete);
        assert_eq!(
            config.audit_log_path(),
            PathBuf::from("/var/log/patches/audit.log")
        );
    }

    #[test]
    fn sniffs_json_without_extension() {
        let config = parse_manager_config(
            Path::new("manager.conf"),
            r#"  {"repository_dir":"repo"}"#,
        )
        .unwrap();
        assert_eq!(config.repository_dir, PathBuf::from("repo"));
    }

    #[test]
    fn rejects_blank_java_binary() {
        let err = parse_manager_config(
            Path::new("manager.json"),
            r#"{"repository_dir":"repo","java_binary":" "}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::Config(_)));
    }
}
