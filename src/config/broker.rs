//! Broker configuration types.

use serde::Deserialize;

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerType {
    /// In-process emulation (no external broker).
    #[default]
    Memory,
    /// AWS SNS topic fanning out to SQS queues.
    SnsSqs,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// SNS/SQS-specific configuration.
    pub sns_sqs: SnsSqsConfig,
}

/// SNS/SQS-specific configuration.
///
/// Credentials come from the AWS default provider chain.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnsSqsConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

impl SnsSqsConfig {
    /// Set AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set custom endpoint URL (for LocalStack or testing).
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker_type, BrokerType::Memory);
        assert!(config.sns_sqs.region.is_none());
    }

    #[test]
    fn test_endpoint_config() {
        let config = SnsSqsConfig::default()
            .with_region("us-west-2")
            .with_endpoint("http://localhost:4566");
        assert_eq!(config.region, Some("us-west-2".to_string()));
        assert_eq!(config.endpoint_url, Some("http://localhost:4566".to_string()));
    }
}
