use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - At least one download slot and a non-zero progress interval
/// - A models directory is set
/// - The generator endpoint is an http(s) URL
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.downloads.max_concurrent == 0 {
        return Err(ConfigError::ValidationError(
            "downloads.max_concurrent cannot be 0".to_string(),
        ));
    }

    if config.downloads.progress_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "downloads.progress_interval_ms cannot be 0".to_string(),
        ));
    }

    if config.storage.models_dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "storage.models_dir cannot be empty".to_string(),
        ));
    }

    let endpoint = &config.generator.endpoint;
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(ConfigError::ValidationError(format!(
            "generator.endpoint must be an http(s) URL, got '{}'",
            endpoint
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_concurrency_fails() {
        let mut config = Config::default();
        config.downloads.max_concurrent = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_progress_interval_fails() {
        let mut config = Config::default();
        config.downloads.progress_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_models_dir_fails() {
        let mut config = Config::default();
        config.storage.models_dir = PathBuf::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_generator_endpoint_scheme() {
        let mut config = Config::default();
        config.generator.endpoint = "ftp://gpu-box/generate".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("generator.endpoint"));
    }
}
