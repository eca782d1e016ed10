use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, GatewayMode};
use crate::compliance::OptOutDetector;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.webhook.secret.is_empty() {
            anyhow::bail!("webhook.secret must not be empty");
        }

        self.compliance
            .business_hours
            .compile()
            .context("invalid compliance.business_hours")?;

        if self.compliance.lookback.is_zero() {
            anyhow::bail!("compliance.lookback must be greater than zero");
        }
        if self.compliance.frequency_cap.is_zero() {
            anyhow::bail!("compliance.frequency_cap must be greater than zero");
        }
        OptOutDetector::new(&self.compliance.opt_out_keywords)
            .context("invalid compliance.opt_out_keywords")?;

        if self.dispatch.concurrency == 0 {
            anyhow::bail!("dispatch.concurrency must be at least 1");
        }
        if self.dispatch.batch_size == 0 {
            anyhow::bail!("dispatch.batch_size must be at least 1");
        }
        if self.dispatch.retry.max_attempts == 0 {
            anyhow::bail!("dispatch.retry.max_attempts must be at least 1");
        }

        if self.gateway.mode == GatewayMode::Http && self.gateway.endpoint.is_none() {
            anyhow::bail!("gateway.endpoint is required in http mode");
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MockResponse, StorageBackend};
    use std::time::Duration;

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
webhook:
  secret: s3cret
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StorageBackend::Memory);
        assert_eq!(config.compliance.lookback, Duration::from_secs(48 * 3600));
        assert_eq!(config.compliance.frequency_cap, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.webhook.signature_header, "x-signature");
        assert_eq!(config.webhook.unmatched_grace, Duration::from_secs(15 * 60));
        assert!(config.compliance.opt_out_keywords.contains(&"stop".to_string()));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  address: "127.0.0.1:9000"
store:
  backend: fjall
  path: /var/lib/campaignd
dispatch:
  interval: 5s
  batch_size: 50
  concurrency: 4
  send_timeout: 3s
  retry:
    max_attempts: 5
    base_delay: 100ms
    max_delay: 2s
  source_number: "+15550000000"
compliance:
  business_hours:
    start: "08:30"
    end: "19:00"
    timezone: America/Chicago
    days: [mon, tue, wed, thu, fri]
    holidays: ["2026-12-25"]
  frequency_cap: 3d
  lookback: 24h
webhook:
  secret: abc
  signature_header: x-provider-signature
  unmatched_grace: 5m
gateway:
  mode: mock
  mock:
    response:
      random:
        error_rate: 0.1
    latency: 20ms
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.address.port(), 9000);
        assert_eq!(config.store.backend, StorageBackend::Fjall);
        assert_eq!(config.dispatch.retry.max_attempts, 5);
        assert_eq!(config.dispatch.send_timeout, Duration::from_secs(3));
        assert_eq!(config.webhook.unmatched_grace, Duration::from_secs(5 * 60));
        assert_eq!(config.compliance.lookback, Duration::from_secs(24 * 3600));
        assert_eq!(config.compliance.business_hours.days.len(), 5);
        assert!(matches!(
            config.gateway.mock.response,
            MockResponse::Random { .. }
        ));
    }

    #[test]
    fn test_missing_secret() {
        let result = Config::from_yaml("dispatch:\n  concurrency: 2\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("webhook.secret"));
    }

    #[test]
    fn test_invalid_timezone() {
        let yaml = r#"
webhook:
  secret: x
compliance:
  business_hours:
    timezone: Mars/Olympus
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("business_hours"));
    }

    #[test]
    fn test_zero_concurrency() {
        let yaml = r#"
webhook:
  secret: x
dispatch:
  concurrency: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_http_gateway_requires_endpoint() {
        let yaml = r#"
webhook:
  secret: x
gateway:
  mode: http
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("gateway.endpoint"));
    }
}
