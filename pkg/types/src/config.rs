use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Leadership agent configuration file (YAML).
///
/// Example `agent-config.yaml`:
/// ```yaml
/// data-dir: /var/lib/leasekeeper/data
/// writer-id: machine-0
/// unit: mysql/0
/// lease-duration-secs: 30
/// max-sleep-secs: 60
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "writer-id")]
    pub writer_id: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "lease-duration-secs")]
    pub lease_duration_secs: Option<u64>,
    #[serde(default, alias = "max-sleep-secs")]
    pub max_sleep_secs: Option<u64>,
}

impl AgentConfigFile {
    /// Read the agent config at `path`. A missing file yields an empty
    /// config so every setting falls back to CLI flags and defaults.
    /// Unknown keys are rejected rather than silently ignored.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading agent config {}", path.display())),
        };
        serde_yaml::from_str(&content).with_context(|| format!("parsing agent config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("agent-config-{}-{}.yaml", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = AgentConfigFile::load("/nonexistent/leasekeeper.yaml").unwrap();
        assert!(cfg.unit.is_none());
        assert!(cfg.writer_id.is_none());
    }

    #[test]
    fn test_load_reads_file() {
        let path = write_config("ok", "unit: mysql/0\nmax-sleep-secs: 20\n");
        let cfg = AgentConfigFile::load(&path).unwrap();
        assert_eq!(cfg.unit.as_deref(), Some("mysql/0"));
        assert_eq!(cfg.max_sleep_secs, Some(20));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let path = write_config("unknown", "unit: mysql/0\nlease-duration: 30\n");
        let err = AgentConfigFile::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(&path.display().to_string()));
        assert!(format!("{:#}", err).contains("lease-duration"));
        std::fs::remove_file(&path).unwrap();

        let path = write_config("malformed", "unit: [mysql/0\n");
        let err = AgentConfigFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing agent config"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_kebab_case_aliases() {
        let yaml = "data-dir: /var/lib/lk\nwriter-id: machine-3\nunit: mysql/1\nlease-duration-secs: 45\n";
        let cfg: AgentConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.data_dir.as_deref(), Some("/var/lib/lk"));
        assert_eq!(cfg.writer_id.as_deref(), Some("machine-3"));
        assert_eq!(cfg.unit.as_deref(), Some("mysql/1"));
        assert_eq!(cfg.lease_duration_secs, Some(45));
        assert_eq!(cfg.max_sleep_secs, None);
    }
}
