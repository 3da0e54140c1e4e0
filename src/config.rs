//! Controller configuration
//!
//! Everything tunable about the pipeline lives in [`ControllerConfig`]. The
//! binary fills it from flags and environment variables; tests build it with
//! [`ControllerConfig::for_testing`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::crd::GatewayConfigSpec;
use crate::retry::RetryConfig;
use crate::{
    Error, DEFAULT_CONTROLLER_NAME, DEFAULT_DATAPLANE, DEFAULT_DISTRIBUTION_PORT,
    GATEWAY_FINALIZER,
};

/// Pipeline-wide settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// GatewayClasses with this controllerName are managed by us
    pub controller_name: String,
    /// Finalizer placed on managed gateways
    pub finalizer: String,
    /// Default for GatewayConfigs that do not set endpointDiscovery
    pub endpoint_discovery: bool,
    /// Default for GatewayConfigs that do not set relayToClusterIp
    pub relay_to_cluster_ip: bool,
    /// Dataplane used when a GatewayConfig names none
    pub default_dataplane: String,
    /// Capacity of the channels between pipeline stages
    pub channel_capacity: usize,
    /// Per-subscriber buffer for every-version delivery
    pub subscriber_buffer: usize,
    /// Attempts for a status write that keeps hitting conflicts
    pub status_retry_attempts: u32,
    /// Delay before failed status writes are retried without new input
    pub status_retry_interval: Duration,
    /// Backoff for transient failures of derived resource writes
    pub write_retry: RetryConfig,
    /// Listen address of the config distribution server
    pub distribution_addr: SocketAddr,
    /// Bearer token required by the distribution server, if any
    pub distribution_token: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            finalizer: GATEWAY_FINALIZER.to_string(),
            endpoint_discovery: true,
            relay_to_cluster_ip: true,
            default_dataplane: DEFAULT_DATAPLANE.to_string(),
            channel_capacity: 64,
            subscriber_buffer: 16,
            status_retry_attempts: 5,
            status_retry_interval: Duration::from_secs(5),
            write_retry: RetryConfig::with_max_attempts(5),
            distribution_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISTRIBUTION_PORT)),
            distribution_token: None,
        }
    }
}

impl ControllerConfig {
    /// Fast-failing configuration for unit and integration tests
    pub fn for_testing() -> Self {
        Self {
            status_retry_interval: Duration::from_millis(20),
            write_retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            ..Self::default()
        }
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.controller_name.trim().is_empty() {
            return Err(Error::validation_for("config", "controller name must not be empty"));
        }
        if !self.controller_name.contains('/') {
            return Err(Error::validation_for(
                "config",
                format!(
                    "controller name '{}' must be domain-prefixed (example.com/name)",
                    self.controller_name
                ),
            ));
        }
        if self.finalizer.trim().is_empty() {
            return Err(Error::validation_for("config", "finalizer must not be empty"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::validation_for("config", "channel capacity must be at least 1"));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::validation_for("config", "subscriber buffer must be at least 1"));
        }
        if self.status_retry_attempts == 0 {
            return Err(Error::validation_for(
                "config",
                "status retry attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Endpoint policy for a gateway class, applying per-class overrides
    pub fn endpoint_policy(&self, params: Option<&GatewayConfigSpec>) -> EndpointPolicy {
        EndpointPolicy {
            discovery: params
                .and_then(|p| p.endpoint_discovery)
                .unwrap_or(self.endpoint_discovery),
            relay_to_cluster_ip: params
                .and_then(|p| p.relay_to_cluster_ip)
                .unwrap_or(self.relay_to_cluster_ip),
        }
    }
}

/// Which backend addresses end up in rendered clusters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointPolicy {
    /// Add ready EndpointSlice addresses
    pub discovery: bool,
    /// Add the Service cluster IP
    pub relay_to_cluster_ip: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.status_retry_attempts, 5);
        assert_eq!(config.distribution_addr.port(), DEFAULT_DISTRIBUTION_PORT);
        assert!(ControllerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_rejects_unusable_values() {
        let mut config = ControllerConfig {
            controller_name: "no-domain".to_string(),
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());

        config.controller_name = DEFAULT_CONTROLLER_NAME.to_string();
        config.channel_capacity = 0;
        assert!(config.validate().is_err());

        config.channel_capacity = 1;
        config.status_retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    /// Story: a class opts out of endpoint discovery
    ///
    /// The controller discovers endpoints by default, but a GatewayConfig can
    /// switch a whole class to relaying to cluster IPs only.
    #[test]
    fn story_class_overrides_endpoint_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(
            config.endpoint_policy(None),
            EndpointPolicy {
                discovery: true,
                relay_to_cluster_ip: true
            }
        );

        let params = GatewayConfigSpec {
            endpoint_discovery: Some(false),
            ..Default::default()
        };
        let policy = config.endpoint_policy(Some(&params));
        assert!(!policy.discovery);
        assert!(policy.relay_to_cluster_ip);
    }
}
