    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = NodefleetConfig::default();
        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_validate_zero_max_restarts() {
        let mut config = NodefleetConfig::default();
        config.daemon.max_restarts = 0;

        let result = ConfigValidator::validate(&config).unwrap();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.path == "daemon.max_restarts"));

        config.daemon.auto_restart = false;
        assert!(ConfigValidator::validate(&config).unwrap().is_valid());
    }

    #[test]
    fn test_validate_empty_commands() {
        let mut config = NodefleetConfig::default();
        config.images.pull_command.clear();
        config.services.nfs_restart_command = vec![String::new()];

        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.errors.iter().any(|e| e.path == "images.pull_command"));
        assert!(result.errors.iter().any(|e| e.path == "services.nfs_restart_command"));
    }

    #[test]
    fn test_validate_same_mount_and_store_dir() {
        let mut config = NodefleetConfig::default();
        config.images.mount_dir = config.images.store_dir.clone();

        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.errors.iter().any(|e| e.path == "images.mount_dir"));
    }

    #[test]
    fn test_validate_hub_port_only_when_enabled() {
        let mut config = NodefleetConfig::default();
        config.hub.port = 0;
        assert!(!ConfigValidator::validate(&config).unwrap().is_valid());

        config.hub.enabled = false;
        assert!(ConfigValidator::validate(&config).unwrap().is_valid());
    }

    #[test]
    fn test_unserialized_blocking_warns() {
        let mut config = NodefleetConfig::default();
        config.rpc.serialize_blocking = false;
        config.services.restart_cooldown_secs = 0;

        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.path == "rpc.serialize_blocking"));
        assert!(result.warnings.iter().any(|w| w.path == "services.restart_cooldown_secs"));
    }

    #[test]
    fn test_check_reports_first_error() {
        let mut config = NodefleetConfig::default();
        config.images.lock_retry_ms = 0;

        match ConfigValidator::check(&config) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "images.lock_retry_ms"),
            other => panic!("expected invalid value, got {:?}", other.map(|r| r.errors.len())),
        }
    }

    #[test]
    fn test_validation_result_methods() {
        let mut result = ValidationResult::default();
        assert!(result.is_valid());
        result.add_warning(ValidationWarning::new("a", "b"));
        assert!(result.is_valid());
        result.add_error(ValidationError::new("c", "d"));
        assert!(!result.is_valid());
    }
