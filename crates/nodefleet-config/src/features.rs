//! Reloadable feature spec.
//!
//! A small TOML file toggling optional behavior at runtime:
//!
//! ```toml
//! [features]
//! auto_pull = true
//! topology_rescan = false
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::ConfigLoader;

/// Feature toggles read from the spec file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

impl FeatureSpec {
    /// Read the spec file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Read the spec file; a missing file means no features.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(e) if e.is_not_found() => Ok(Self::default()),
            other => other,
        }
    }

    /// Parse spec content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = ConfigLoader::expand_env_vars(content)?;
        Ok(toml::from_str(&expanded)?)
    }

    /// Check a feature. Unknown features are disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    /// Names of the enabled features.
    pub fn enabled(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Features whose value differs from `other`.
    pub fn changed_from(&self, other: &FeatureSpec) -> Vec<String> {
        let mut names: Vec<&String> = self.features.keys().chain(other.features.keys()).collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter(|name| self.is_enabled(name) != other.is_enabled(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_features() {
        let spec = FeatureSpec::parse(
            r#"
            [features]
            auto_pull = true
            topology_rescan = false
            "#,
        )
        .unwrap();
        assert!(spec.is_enabled("auto_pull"));
        assert!(!spec.is_enabled("topology_rescan"));
        assert!(!spec.is_enabled("unknown"));
        assert_eq!(spec.enabled(), vec!["auto_pull"]);
    }

    #[test]
    fn test_missing_file_is_empty_spec() {
        let spec = FeatureSpec::load_or_default(Path::new("/nonexistent/features.toml")).unwrap();
        assert_eq!(spec, FeatureSpec::default());
        assert!(FeatureSpec::load(Path::new("/nonexistent/features.toml")).is_err());
    }

    #[test]
    fn test_reload_picks_up_rewritten_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[features]\nauto_pull = true").unwrap();
        let before = FeatureSpec::load(file.path()).unwrap();
        assert!(before.is_enabled("auto_pull"));

        fs::write(file.path(), "[features]\nauto_pull = false\nexports = true\n").unwrap();
        let after = FeatureSpec::load(file.path()).unwrap();
        assert!(!after.is_enabled("auto_pull"));
        assert!(after.is_enabled("exports"));
        assert_eq!(after.changed_from(&before), vec!["auto_pull", "exports"]);
    }

    #[test]
    fn test_changed_from() {
        let old = FeatureSpec::parse("[features]\nauto_pull = true\nlegacy = true").unwrap();
        let new = FeatureSpec::parse("[features]\nauto_pull = false\nlegacy = true\nexports = true").unwrap();
        assert_eq!(new.changed_from(&old), vec!["auto_pull", "exports"]);
    }

    #[test]
    fn test_invalid_spec() {
        assert!(FeatureSpec::parse("[features]\nauto_pull = \"yes\"").is_err());
    }
}
