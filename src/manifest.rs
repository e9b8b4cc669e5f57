//! Koan manifest parsing
//!
//! A koan manifest is a small JSON document naming the three Python files
//! that make up one exercise unit. It is re-parsed from the owning
//! document's text on every load and on every external change, and is the
//! single source of truth for resolving the sibling file paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The three Python files associated with one koan unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Learner-edited exercise file
    pub exercise: String,
    /// Unit-test file
    pub test: String,
    /// Reference solution file
    pub solution: String,
}

/// Why a manifest failed to decode
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest field '{0}' is empty")]
    EmptyField(&'static str),
}

impl Manifest {
    /// Parse a manifest from document text. All three fields must be
    /// present and non-empty; a manifest that fails here aborts session
    /// initialization for that document only.
    pub fn parse(text: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_json::from_str(text)?;

        if manifest.exercise.is_empty() {
            return Err(ManifestError::EmptyField("exercise"));
        }
        if manifest.test.is_empty() {
            return Err(ManifestError::EmptyField("test"));
        }
        if manifest.solution.is_empty() {
            return Err(ManifestError::EmptyField("solution"));
        }
        Ok(manifest)
    }

    /// Resolve the exercise file path relative to the manifest's directory.
    pub fn exercise_path(&self, manifest_dir: &Path) -> PathBuf {
        manifest_dir.join(&self.exercise)
    }

    /// Resolve the test file path relative to the manifest's directory.
    pub fn test_path(&self, manifest_dir: &Path) -> PathBuf {
        manifest_dir.join(&self.test)
    }

    /// Resolve the solution file path relative to the manifest's directory.
    pub fn solution_path(&self, manifest_dir: &Path) -> PathBuf {
        manifest_dir.join(&self.solution)
    }
}
