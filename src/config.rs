//! Workbench configuration
//!
//! Loaded once from an optional `koan.toml` next to the workbench root,
//! with the interpreter executable overridable through the environment.
//! Everything has a sensible default so the crate works with no
//! configuration file at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::identity::TestConvention;

/// Environment variable overriding the interpreter executable
const ENV_PYTHON: &str = "KOAN_PYTHON";

/// Runtime configuration for the koan workbench host
#[derive(Debug, Clone)]
pub struct KoanConfig {
    /// Interpreter executable name or path
    pub python_executable: String,
    /// Script that rewrites a function body inside the exercise file
    pub updater_script: PathBuf,
    /// Script that extracts challenge metadata from the exercise file
    pub parser_script: PathBuf,
    /// Delay before a live code edit is persisted
    pub debounce: Duration,
    /// Deadline for one test-subprocess run
    pub test_timeout: Duration,
    /// Unittest naming convention
    pub convention: TestConvention,
}

impl Default for KoanConfig {
    fn default() -> Self {
        Self {
            python_executable: "python".to_string(),
            updater_script: PathBuf::from("resources/python/updater.py"),
            parser_script: PathBuf::from("resources/python/parse_ast.py"),
            debounce: Duration::from_millis(1000),
            test_timeout: Duration::from_secs(30),
            convention: TestConvention::default(),
        }
    }
}

/// Raw TOML shape of `koan.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawKoanConfig {
    python_executable: Option<String>,
    updater_script: Option<PathBuf>,
    parser_script: Option<PathBuf>,
    debounce_ms: Option<u64>,
    test_timeout_secs: Option<u64>,
    convention: Option<TestConvention>,
}

impl KoanConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any omitted field. The `KOAN_PYTHON` environment variable wins over
    /// both the file and the default for the interpreter executable.
    pub fn load(path: &Path) -> anyhow::Result<KoanConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let raw: RawKoanConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Self::from_raw(raw))
    }

    /// Defaults plus the environment override; used when no `koan.toml`
    /// exists.
    pub fn from_env() -> KoanConfig {
        Self::from_raw(RawKoanConfig::default())
    }

    fn from_raw(raw: RawKoanConfig) -> KoanConfig {
        let defaults = KoanConfig::default();
        let python_executable = std::env::var(ENV_PYTHON)
            .ok()
            .or(raw.python_executable)
            .unwrap_or(defaults.python_executable);

        KoanConfig {
            python_executable,
            updater_script: raw.updater_script.unwrap_or(defaults.updater_script),
            parser_script: raw.parser_script.unwrap_or(defaults.parser_script),
            debounce: raw
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            test_timeout: raw
                .test_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.test_timeout),
            convention: raw.convention.unwrap_or(defaults.convention),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = KoanConfig::default();
        assert_eq!(config.python_executable, "python");
        assert_eq!(config.debounce, Duration::from_millis(1000));
        assert_eq!(config.convention.test_class, "Testing");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
debounce_ms = 1500
test_timeout_secs = 5

[convention]
test_class = "KoanTests"
strip_prefix = "C01."
"#
        )
        .unwrap();

        let config = KoanConfig::load(file.path()).unwrap();
        assert_eq!(config.debounce, Duration::from_millis(1500));
        assert_eq!(config.test_timeout, Duration::from_secs(5));
        assert_eq!(config.convention.test_class, "KoanTests");
        assert_eq!(config.convention.strip_prefix.as_deref(), Some("C01."));
        // untouched fields keep their defaults
        assert_eq!(config.updater_script, PathBuf::from("resources/python/updater.py"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(KoanConfig::load(Path::new("/nonexistent/koan.toml")).is_err());
    }
}
