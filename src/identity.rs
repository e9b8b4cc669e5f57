//! Test identity resolution
//!
//! Maps a `{source file, challenge name}` pair to the fully-qualified dotted
//! identity the external unittest runner understands. The convention is a
//! naming rule, not an import-resolution model: one test class per exercise
//! module, test methods named `test_<challenge>`. Exercises that do not
//! follow the rule are out of contract.

use std::path::Path;

use serde::Deserialize;

/// Naming convention for deriving unittest identities.
///
/// All parts are configurable so that project-specific path shapes can be
/// corrected in configuration instead of in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestConvention {
    /// Unit-test class name inside the test module
    pub test_class: String,
    /// Module name used when the source path yields no usable file name
    pub default_module: String,
    /// Optional prefix removed from the resolved identity
    pub strip_prefix: Option<String>,
}

impl Default for TestConvention {
    fn default() -> Self {
        Self {
            test_class: "Testing".to_string(),
            default_module: "exercise_test".to_string(),
            strip_prefix: None,
        }
    }
}

impl TestConvention {
    /// Derive the dotted test identity for one challenge.
    ///
    /// The path is split on both `/` and `\` so identities stay stable for
    /// paths recorded on either platform. Pure, no I/O. An empty or
    /// extension-less path falls back to `default_module` so a best-effort
    /// identity is always derivable.
    pub fn resolve(&self, source_file: &Path, challenge_name: &str) -> String {
        let module = self.module_name(source_file);
        let identity = format!("{}.{}.test_{}", module, self.test_class, challenge_name);

        match &self.strip_prefix {
            Some(prefix) => identity
                .strip_prefix(prefix.as_str())
                .map(str::to_string)
                .unwrap_or(identity),
            None => identity,
        }
    }

    /// Extract the Python module name from a source file path.
    pub fn module_name(&self, source_file: &Path) -> String {
        let text = source_file.to_string_lossy();
        let file_name = text
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .last()
            .unwrap_or_default();

        let module = file_name.strip_suffix(".py").unwrap_or(file_name);
        if module.is_empty() {
            self.default_module.clone()
        } else {
            module.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_resolve_basic() {
        let convention = TestConvention::default();
        let path = PathBuf::from("/koans/unit01/ex_test.py");
        assert_eq!(
            convention.resolve(&path, "challenge_01"),
            "ex_test.Testing.test_challenge_01"
        );
    }

    #[test]
    fn test_resolve_backslash_path() {
        let convention = TestConvention::default();
        let path = PathBuf::from(r"C:\koans\unit01\ex_test.py");
        assert_eq!(
            convention.resolve(&path, "challenge_02"),
            "ex_test.Testing.test_challenge_02"
        );
    }

    #[test]
    fn test_resolve_empty_path_falls_back() {
        let convention = TestConvention::default();
        assert_eq!(
            convention.resolve(&PathBuf::from(""), "challenge_01"),
            "exercise_test.Testing.test_challenge_01"
        );
    }

    #[test]
    fn test_resolve_is_pure() {
        let convention = TestConvention::default();
        let path = PathBuf::from("koans/ex_test.py");
        let first = convention.resolve(&path, "challenge_03");
        let second = convention.resolve(&path, "challenge_03");
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_strip_prefix() {
        let convention = TestConvention {
            strip_prefix: Some("C01.".to_string()),
            ..TestConvention::default()
        };
        let path = PathBuf::from("/koans/C01.py");
        assert_eq!(
            convention.resolve(&path, "challenge_01"),
            "Testing.test_challenge_01"
        );
    }

    #[test]
    fn test_module_name_without_extension() {
        let convention = TestConvention::default();
        assert_eq!(
            convention.module_name(&PathBuf::from("/a/b/ex_test")),
            "ex_test"
        );
    }
}
