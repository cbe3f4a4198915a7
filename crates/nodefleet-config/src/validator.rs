//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::NodefleetConfig;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &NodefleetConfig) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_daemon(config, &mut result);
        Self::validate_rpc(config, &mut result);
        Self::validate_images(config, &mut result);
        Self::validate_services(config, &mut result);
        Self::validate_hub(config, &mut result);

        Ok(result)
    }

    /// Validate and turn the first error into a [`ConfigError`].
    pub fn check(config: &NodefleetConfig) -> Result<ValidationResult, ConfigError> {
        let result = Self::validate(config)?;
        if let Some(first) = result.errors.first() {
            return Err(ConfigError::InvalidValue {
                field: first.path.clone(),
                message: first.message.clone(),
            });
        }
        Ok(result)
    }

    fn validate_daemon(config: &NodefleetConfig, result: &mut ValidationResult) {
        let daemon = &config.daemon;
        if daemon.auto_restart && daemon.max_restarts == 0 {
            result.add_error(ValidationError::new(
                "daemon.max_restarts",
                "max_restarts must be > 0 when auto_restart is enabled",
            ));
        }

        if daemon.restart_window_secs == 0 {
            result.add_error(ValidationError::new(
                "daemon.restart_window_secs",
                "restart_window_secs must be > 0",
            ));
        }

        if daemon.shutdown_timeout_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "daemon.shutdown_timeout_secs",
                "children will be killed without a grace period",
            ));
        }
    }

    fn validate_rpc(config: &NodefleetConfig, result: &mut ValidationResult) {
        if !config.rpc.serialize_blocking {
            result.add_warning(ValidationWarning::new(
                "rpc.serialize_blocking",
                "blocking requests may be reordered (e.g. register before pull)",
            ));
        }

        if config.rpc.call_timeout_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "rpc.call_timeout_secs",
                "calls to the database never time out",
            ));
        }
    }

    fn validate_images(config: &NodefleetConfig, result: &mut ValidationResult) {
        let images = &config.images;
        for (field, command) in [
            ("images.pull_command", &images.pull_command),
            ("images.mount_command", &images.mount_command),
            ("images.umount_command", &images.umount_command),
        ] {
            Self::require_command(field, command, result);
        }

        if images.lock_retry_ms == 0 {
            result.add_error(ValidationError::new(
                "images.lock_retry_ms",
                "lock_retry_ms must be > 0",
            ));
        }

        if images.mount_dir == images.store_dir {
            result.add_error(ValidationError::new(
                "images.mount_dir",
                "mount_dir must differ from store_dir",
            ));
        }
    }

    fn validate_services(config: &NodefleetConfig, result: &mut ValidationResult) {
        let services = &config.services;
        Self::require_command("services.nfs_restart_command", &services.nfs_restart_command, result);
        Self::require_command("services.dhcp_restart_command", &services.dhcp_restart_command, result);

        if services.restart_cooldown_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "services.restart_cooldown_secs",
                "restarts will not be coalesced across a burst of changes",
            ));
        }
    }

    fn validate_hub(config: &NodefleetConfig, result: &mut ValidationResult) {
        let hub = &config.hub;
        if !hub.enabled {
            return;
        }

        if hub.port == 0 {
            result.add_error(ValidationError::new("hub.port", "Port cannot be 0"));
        }

        if hub.listen.is_empty() {
            result.add_error(ValidationError::new("hub.listen", "Listen address cannot be empty"));
        }

        if hub.max_connections == 0 {
            result.add_error(ValidationError::new(
                "hub.max_connections",
                "max_connections must be > 0",
            ));
        }
    }

    fn require_command(field: &str, command: &[String], result: &mut ValidationResult) {
        if command.first().is_none_or(|program| program.is_empty()) {
            result.add_error(ValidationError::new(field, "command cannot be empty"));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
