//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::NodefleetConfig;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<NodefleetConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<NodefleetConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: NodefleetConfig = toml::from_str(&expanded)?;
        config.expand_paths();
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<NodefleetConfig, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = NodefleetConfig::default();
                config.expand_paths();
                Ok(config)
            }
        }
    }

    /// Expand environment variables written `${VAR}` or `${VAR:-default}`.
    pub(crate) fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

        let mut result = String::with_capacity(content.len());
        let mut last = 0;
        for cap in re.captures_iter(content) {
            let Some(whole) = cap.get(0) else { continue };
            let var_name = &cap[1];
            let value = match (std::env::var(var_name), cap.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotSet(var_name.to_string())),
            };
            result.push_str(&content[last..whole.start()]);
            result.push_str(&value);
            last = whole.end();
        }
        result.push_str(&content[last..]);

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.nodefleet`).
    pub fn expand_path(path: &Path) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.hub.port, 4433);
        assert!(config.rpc.serialize_blocking);
    }

    #[test]
    fn test_load_sections() {
        let content = r#"
            [hub]
            listen = "0.0.0.0"
            port = 9000

            [services]
            restart_cooldown_secs = 2

            [images]
            store_dir = "/srv/images"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.hub.listen, "0.0.0.0");
        assert_eq!(config.hub.port, 9000);
        assert_eq!(config.services.restart_cooldown_secs, 2);
        assert_eq!(config.images.store_dir, PathBuf::from("/srv/images"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[rpc]").unwrap();
        writeln!(file, "call_timeout_secs = 5").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.rpc.call_timeout_secs, 5);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/nodefleet.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: unique test-only variable
        unsafe {
            std::env::set_var("NODEFLEET_TEST_CONFIG_VAR", "test_value");
        }
        let content = "value = \"${NODEFLEET_TEST_CONFIG_VAR}/x\"";
        let expanded = ConfigLoader::expand_env_vars(content).unwrap();
        assert_eq!(expanded, "value = \"test_value/x\"");
        unsafe {
            std::env::remove_var("NODEFLEET_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_default() {
        let content = "dir = \"${NODEFLEET_UNSET_VAR_98765:-/var/lib/nodefleet}\"";
        let expanded = ConfigLoader::expand_env_vars(content).unwrap();
        assert_eq!(expanded, "dir = \"/var/lib/nodefleet\"");
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${NONEXISTENT_TEST_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(v)) if v == "NONEXISTENT_TEST_VAR_12345"));
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let content = "value = \"no variables here\"";
        let expanded = ConfigLoader::expand_env_vars(content).unwrap();
        assert_eq!(expanded, content);
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(
            ConfigLoader::expand_path(Path::new("/usr/local/bin")),
            PathBuf::from("/usr/local/bin")
        );
        let expanded = ConfigLoader::expand_path(Path::new("~/test"));
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("test"));
    }

    #[test]
    fn test_paths_expanded_on_load() {
        let content = r#"
            [daemon]
            log_dir = "~/nodefleet-logs"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert!(!config.daemon.log_dir.starts_with("~"));
    }
}
