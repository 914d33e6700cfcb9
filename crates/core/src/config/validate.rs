use reqwest::Url;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Service base URL is an absolute http(s) URL
/// - Timeouts and the poll interval are not 0
/// - Default confidence lies within [0, 1]
/// - Namespace starts with '/'
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let url = Url::parse(&config.service.base_url).map_err(|e| {
        ConfigError::ValidationError(format!(
            "service.base_url '{}' is not a valid URL: {}",
            config.service.base_url, e
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "service.base_url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.service.request_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "service.request_timeout_secs cannot be 0".to_string(),
        ));
    }

    if !config.service.namespace.starts_with('/') {
        return Err(ConfigError::ValidationError(
            "service.namespace must start with '/'".to_string(),
        ));
    }

    let confidence = config.detection.default_confidence;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ConfigError::ValidationError(format!(
            "detection.default_confidence must be within 0.0..=1.0, got {}",
            confidence
        )));
    }

    if config.video.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "video.poll_interval_ms cannot be 0".to_string(),
        ));
    }

    if config.stream.connect_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "stream.connect_timeout_secs cannot be 0".to_string(),
        ));
    }

    if config.stream.event_buffer == 0 {
        return Err(ConfigError::ValidationError(
            "stream.event_buffer cannot be 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let mut config = Config::default();
        config.service.base_url = "ftp://files.example.com".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_rejects_relative_url() {
        let mut config = Config::default();
        config.service.base_url = "localhost:5000/api".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.video.poll_interval_ms = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_validate_rejects_confidence_out_of_range() {
        let mut config = Config::default();
        config.detection.default_confidence = 1.5;
        assert!(validate_config(&config).is_err());

        config.detection.default_confidence = -0.1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_namespace_without_slash() {
        let mut config = Config::default();
        config.service.namespace = "stream".to_string();
        assert!(validate_config(&config).is_err());
    }
}
