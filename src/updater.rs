//! Exercise file updater
//!
//! Delegates function-body rewriting to an external script that parses the
//! exercise file, swaps the named function's body, and prints the full
//! updated file content to stdout. The caller applies that content as a
//! whole-document edit; on failure the document is left untouched.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::python::{Python, PythonOptions};

/// Rewrites one function body inside the exercise file
#[async_trait]
pub trait CodeUpdater: Send + Sync {
    /// Returns the full updated file content to write back verbatim.
    async fn update(&self, exercise_file: &Path, member_id: &str, code: &str) -> Result<String>;
}

/// The production updater: external interpreter + updater script
pub struct PythonUpdater {
    python: Python,
    script: PathBuf,
}

impl PythonUpdater {
    pub fn new(python: Python, script: impl Into<PathBuf>) -> Self {
        Self {
            python,
            script: script.into(),
        }
    }
}

#[async_trait]
impl CodeUpdater for PythonUpdater {
    async fn update(&self, exercise_file: &Path, member_id: &str, code: &str) -> Result<String> {
        debug!(member_id, file = %exercise_file.display(), "Updating function body");

        let args = [
            self.script.as_os_str(),
            exercise_file.as_os_str(),
            member_id.as_ref(),
            code.as_ref(),
        ];
        let result = self.python.execute(args, &PythonOptions::new()).await?;

        if result.exit_code != Some(0) {
            bail!(
                "Updater exited with code {:?}: {}",
                result.exit_code,
                result.stderr_text().trim()
            );
        }
        Ok(result.stdout_text())
    }
}
