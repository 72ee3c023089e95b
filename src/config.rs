//! Gateway configuration.
//!
//! Loaded from a JSON file named by `TIERGATE_CONFIG`; every field has a
//! default so an empty object (or no file at all) yields a working
//! gateway with no routing rules and the intelligent strategy.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::proxy::{BreakerConfig, RoutingRule, RoutingStrategy};
use crate::store::ServiceRegistration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TIERGATE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Routing rules evaluated before the strategy, in order.
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    /// Strategy applied when no rule matches.
    #[serde(default = "default_strategy")]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Services registered at startup, before the listener accepts.
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_strategy() -> RoutingStrategy {
    RoutingStrategy::Intelligent
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rules: Vec::new(),
            strategy: default_strategy(),
            breaker: BreakerConfig::default(),
            services: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from the file named by `TIERGATE_CONFIG`, or
    /// returns the defaults when the variable is unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Tier;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert!(config.rules.is_empty());
        assert_eq!(config.strategy, RoutingStrategy::Intelligent);
        assert_eq!(config.breaker, BreakerConfig::default());
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r#"{
            "listen": "0.0.0.0:9090",
            "rules": [
                {"match": {"type": "path", "pattern": "/api/static"}, "tier": "edge"}
            ],
            "strategy": {"type": "split", "edge_percent": 70},
            "breaker": {"failure_threshold": 3, "recovery_timeout_ms": 5000},
            "services": [
                {
                    "name": "orders",
                    "instances": [{"address": "127.0.0.1:9001", "tier": "container"}]
                }
            ]
        }"#;
        let config: GatewayConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.listen, "0.0.0.0:9090".parse().unwrap());
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].tier, Tier::Edge);
        assert_eq!(
            config.strategy,
            RoutingStrategy::Split { edge_percent: 70 }
        );
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.services[0].name, "orders");
        assert_eq!(config.services[0].call_timeout_ms, 30_000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = GatewayConfig::from_file(Path::new("/nonexistent/tiergate.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tiergate.json"));
    }
}
