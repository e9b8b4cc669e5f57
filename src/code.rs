//! Challenge metadata extraction
//!
//! The exercise file is introspected by an external parser script that
//! prints one JSON document of challenge records. This module wraps that
//! collaborator behind a trait so the session controller can be exercised
//! with a fake source in tests.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::messaging::ChallengeData;
use crate::python::{Python, PythonOptions};

/// Produces the challenge list for an exercise file
#[async_trait]
pub trait ChallengeSource: Send + Sync {
    async fn challenges(&self, exercise_file: &Path) -> Result<Vec<ChallengeData>>;
}

/// Wire shape of the parser script's output
#[derive(Debug, Deserialize)]
struct ParserOutput {
    challenges: Vec<ChallengeData>,
}

/// The production source: external interpreter + parser script
pub struct PythonChallengeSource {
    python: Python,
    script: PathBuf,
}

impl PythonChallengeSource {
    pub fn new(python: Python, script: impl Into<PathBuf>) -> Self {
        Self {
            python,
            script: script.into(),
        }
    }
}

#[async_trait]
impl ChallengeSource for PythonChallengeSource {
    async fn challenges(&self, exercise_file: &Path) -> Result<Vec<ChallengeData>> {
        debug!(file = %exercise_file.display(), "Parsing challenges");

        let args = [self.script.as_os_str(), exercise_file.as_os_str()];
        let result = self.python.execute(args, &PythonOptions::new()).await?;

        if result.exit_code != Some(0) {
            bail!(
                "Challenge parser exited with code {:?}: {}",
                result.exit_code,
                result.stderr_text().trim()
            );
        }

        let stdout = result.stdout_text();
        if stdout.trim().is_empty() {
            bail!("Challenge parser produced no output");
        }

        let parsed: ParserOutput = serde_json::from_str(&stdout)
            .context("Invalid data format returned from challenge parser")?;
        Ok(parsed.challenges)
    }
}
