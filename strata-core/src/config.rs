#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Knobs for a checking run.
///
/// Read from a `strata.toml` either as top-level keys or under a
/// `[checker]` table:
///
/// ```toml
/// [checker]
/// max_errors = 25
/// fail_fast = false
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckerConfig {
    /// Checking stops once this many errors are recorded. `0` disables the limit.
    pub max_errors: usize,
    /// Stop after the first error.
    pub fail_fast: bool,
    /// Record warnings.
    pub warnings: bool,
    /// Trace the flow state at every statement (`tracing` at `trace` level).
    pub debug_flow: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_errors: 10,
            fail_fast: false,
            warnings: true,
            debug_flow: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    checker: Option<CheckerConfig>,
}

impl CheckerConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(src)?;
        if table.contains_key("checker") {
            let file: ConfigFile = toml::from_str(src)?;
            return Ok(file.checker.unwrap_or_default());
        }
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(CheckerConfig::from_toml_str("").unwrap(), CheckerConfig::default());
    }

    #[test]
    fn checker_table_is_accepted() {
        let cfg = CheckerConfig::from_toml_str(
            r#"
[package]
name = "demo"

[checker]
max_errors = 3
fail_fast = true
"#,
        );
        // `[package]` is not ours, but it is ignored because `[checker]` is present.
        let cfg = cfg.unwrap();
        assert_eq!(cfg.max_errors, 3);
        assert!(cfg.fail_fast);
        assert!(cfg.warnings);
    }

    #[test]
    fn top_level_keys_are_accepted() {
        let cfg = CheckerConfig::from_toml_str("warnings = false\ndebug_flow = true\n").unwrap();
        assert!(!cfg.warnings);
        assert!(cfg.debug_flow);
        assert_eq!(cfg.max_errors, 10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = CheckerConfig::from_toml_str("max_errorz = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = CheckerConfig::load("/nonexistent/strata.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
