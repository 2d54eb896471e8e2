//! Primary discovery through Redis Sentinel
//!
//! Asks a Sentinel for the state of a named master and accepts it only when
//! Sentinel flags it as a healthy master (not subjectively or objectively down).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::SentinelConfig;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No usable primary for {master_set}: {reason}")]
    Unavailable { master_set: String, reason: String },
    #[error("Sentinel did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Sentinel error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Source of the current primary host
///
/// Abstracted so the control loop can be driven by a scripted sequence in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrimaryWatcher: Send + Sync {
    /// Host of the currently elected primary
    async fn current_primary(&self) -> Result<String, DiscoveryError>;
}

/// Queries a single Sentinel endpoint for the configured master set
pub struct SentinelWatcher {
    client: redis::Client,
    config: SentinelConfig,
}

impl SentinelWatcher {
    pub fn new(config: SentinelConfig) -> Result<Self, DiscoveryError> {
        let client = redis::Client::open(format!("redis://{}:{}/", config.host, config.port))?;
        Ok(Self { client, config })
    }

    async fn connect(&self) -> Result<MultiplexedConnection, DiscoveryError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        if let Some(password) = &self.config.password {
            redis::cmd("AUTH")
                .arg(password)
                .query_async::<()>(&mut conn)
                .await?;
        }

        Ok(conn)
    }

    async fn query_master(&self) -> Result<String, DiscoveryError> {
        let mut conn = self.connect().await?;

        let fields: Vec<String> = redis::cmd("SENTINEL")
            .arg("MASTER")
            .arg(&self.config.master_set)
            .query_async(&mut conn)
            .await?;

        parse_master_state(&self.config.master_set, &fields)
    }
}

#[async_trait]
impl PrimaryWatcher for SentinelWatcher {
    #[instrument(skip(self), fields(master_set = %self.config.master_set))]
    async fn current_primary(&self) -> Result<String, DiscoveryError> {
        let host = timeout(self.config.timeout, self.query_master())
            .await
            .map_err(|_| DiscoveryError::Timeout(self.config.timeout))??;

        debug!(host = %host, "Discovered primary");
        Ok(host)
    }
}

/// Interpret the flat key/value reply of `SENTINEL MASTER <name>`.
fn parse_master_state(master_set: &str, fields: &[String]) -> Result<String, DiscoveryError> {
    let unavailable = |reason: &str| DiscoveryError::Unavailable {
        master_set: master_set.to_string(),
        reason: reason.to_string(),
    };

    let state: HashMap<&str, &str> = fields
        .chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect();

    let flags: Vec<&str> = state
        .get("flags")
        .map(|f| f.split(',').collect())
        .unwrap_or_default();

    if !flags.contains(&"master") {
        return Err(unavailable("sentinel does not report a master"));
    }
    if flags.contains(&"s_down") || flags.contains(&"o_down") {
        return Err(unavailable("master is marked down"));
    }

    state
        .get("ip")
        .filter(|ip| !ip.is_empty())
        .map(|ip| ip.to_string())
        .ok_or_else(|| unavailable("master has no address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(pairs: &[(&str, &str)]) -> Vec<String> {
        pairs
            .iter()
            .flat_map(|(k, v)| [k.to_string(), v.to_string()])
            .collect()
    }

    #[test]
    fn test_parse_healthy_master() {
        let fields = reply(&[
            ("name", "mymaster"),
            ("ip", "10.0.0.5"),
            ("port", "6379"),
            ("flags", "master"),
        ]);
        assert_eq!(parse_master_state("mymaster", &fields).unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_parse_master_down() {
        let fields = reply(&[("ip", "10.0.0.5"), ("flags", "master,o_down")]);
        let err = parse_master_state("mymaster", &fields).unwrap_err();
        assert!(matches!(err, DiscoveryError::Unavailable { .. }));
        assert!(err.to_string().contains("mymaster"));

        let fields = reply(&[("ip", "10.0.0.5"), ("flags", "master,s_down")]);
        assert!(parse_master_state("mymaster", &fields).is_err());
    }

    #[test]
    fn test_parse_missing_flags() {
        let fields = reply(&[("ip", "10.0.0.5")]);
        assert!(parse_master_state("mymaster", &fields).is_err());
    }

    #[test]
    fn test_parse_missing_ip() {
        let fields = reply(&[("flags", "master")]);
        assert!(matches!(
            parse_master_state("mymaster", &fields),
            Err(DiscoveryError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_parse_empty_reply() {
        assert!(parse_master_state("mymaster", &[]).is_err());
    }

    #[test]
    fn test_timeout_display() {
        let err = DiscoveryError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Sentinel did not answer within 5s");
    }
}
