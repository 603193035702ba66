//! Configuration for stexls.
//!
//! Loaded from `.stexls/config.toml` under the workspace root. Every
//! field is optional; accessors supply the defaults, so a partial file
//! only overrides what it names. CLI flags override the file.
//!
//! Example config.toml:
//! ```toml
//! [lint]
//! format = "{relative_file}:{line}:{column} {severity} - {message} ({code})"
//! diagnostic_level = "information"
//! include = ["smglom/.*"]
//! ignore = [".*/drafts/.*"]
//! jobs = 4
//! max_file_size_kb = 100
//!
//! [trefier]
//! enabled = false
//! max_file_size_kb = 50
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use stexls_core::DiagnosticSeverity;

pub const DEFAULT_FORMAT: &str =
    "{relative_file}:{line}:{column} {severity} - {message} ({code})";

/// Lint configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LintConfig {
    /// Message template, see the lint command for the variables.
    pub format: Option<String>,
    /// Lowest severity that is reported ("error", "warning", ...).
    pub diagnostic_level: Option<String>,
    /// Only files matching ANY of these regexes are linted.
    pub include: Vec<String>,
    /// Files matching ANY of these regexes are skipped.
    pub ignore: Vec<String>,
    /// Worker threads for batch compilation. Default: all cores.
    pub jobs: Option<usize>,
    /// Larger files are linted shallowly.
    pub max_file_size_kb: Option<u64>,
}

impl LintConfig {
    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or(DEFAULT_FORMAT)
    }

    pub fn diagnostic_level(&self) -> DiagnosticSeverity {
        self.diagnostic_level
            .as_deref()
            .and_then(DiagnosticSeverity::parse)
            .unwrap_or(DiagnosticSeverity::Information)
    }

    pub fn max_file_size_kb(&self) -> u64 {
        self.max_file_size_kb.unwrap_or(100)
    }
}

/// Trefier tagger configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TrefierConfig {
    pub enabled: Option<bool>,
    pub max_file_size_kb: Option<u64>,
}

impl TrefierConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn max_file_size_kb(&self) -> u64 {
        self.max_file_size_kb.unwrap_or(50)
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StexlsConfig {
    pub lint: LintConfig,
    pub trefier: TrefierConfig,
    /// Object-cache directory, relative to the workspace root unless
    /// absolute. Default: `.stexls/objects`.
    pub outdir: Option<PathBuf>,
}

impl StexlsConfig {
    /// Loads `.stexls/config.toml` under `root`; missing or malformed
    /// files yield the defaults.
    pub fn load(root: &Path) -> Self {
        let path = root.join(".stexls").join("config.toml");
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| toml::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// The resolved object-cache directory.
    pub fn outdir(&self, root: &Path) -> PathBuf {
        match &self.outdir {
            Some(outdir) if outdir.is_absolute() => outdir.clone(),
            Some(outdir) => root.join(outdir),
            None => root.join(".stexls").join("objects"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StexlsConfig::default();
        assert_eq!(config.lint.format(), DEFAULT_FORMAT);
        assert_eq!(
            config.lint.diagnostic_level(),
            DiagnosticSeverity::Information
        );
        assert!(!config.trefier.enabled());
        assert_eq!(
            config.outdir(Path::new("/w")),
            PathBuf::from("/w/.stexls/objects")
        );
    }

    #[test]
    fn test_load_project_config() {
        let dir = TempDir::new().unwrap();
        let stexls_dir = dir.path().join(".stexls");
        std::fs::create_dir_all(&stexls_dir).unwrap();
        let mut file = std::fs::File::create(stexls_dir.join("config.toml")).unwrap();
        writeln!(
            file,
            r#"
[lint]
diagnostic_level = "warning"
jobs = 2
ignore = ["drafts/.*"]
"#
        )
        .unwrap();

        let config = StexlsConfig::load(dir.path());
        assert_eq!(config.lint.diagnostic_level(), DiagnosticSeverity::Warning);
        assert_eq!(config.lint.jobs, Some(2));
        assert_eq!(config.lint.ignore, vec!["drafts/.*".to_string()]);
        // unspecified fields keep their defaults
        assert_eq!(config.lint.format(), DEFAULT_FORMAT);
        assert_eq!(config.lint.max_file_size_kb(), 100);
    }

    #[test]
    fn test_missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let config = StexlsConfig::load(dir.path());
        assert!(config.lint.include.is_empty());
    }
}
