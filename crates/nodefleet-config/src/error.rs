//! Errors raised while reading the server configuration or the feature spec.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration or feature-spec file does not exist.
    #[error("{0} does not exist")]
    NotFound(String),

    /// A `${...}` reference could not be expanded.
    #[error("Malformed placeholder: {0}")]
    InvalidFormat(String),

    /// Rejected by the validator; `field` is the dotted TOML path.
    #[error("{field} is invalid: {message}")]
    InvalidValue { field: String, message: String },

    #[error("${{{0}}} is referenced but unset and has no default")]
    EnvVarNotSet(String),

    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Whether the error only says the file is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_names_the_field() {
        let err = ConfigError::InvalidValue {
            field: "hub.port".to_string(),
            message: "must not be 0".to_string(),
        };
        assert_eq!(err.to_string(), "hub.port is invalid: must not be 0");
    }

    #[test]
    fn test_env_var_message_shows_placeholder() {
        let err = ConfigError::EnvVarNotSet("NODEFLEET_ROOT".to_string());
        assert!(err.to_string().starts_with("${NODEFLEET_ROOT}"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(ConfigError::NotFound("/etc/nodefleet.toml".to_string()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!ConfigError::from(io).is_not_found());
    }
}
