//! Process configuration, read once from the environment at startup

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use regex::Regex;
use tracing::warn;

use crate::resource::ResourceKind;

/// Environment variable names
pub mod env {
    pub const SENTINEL_HOST: &str = "REDIS_SENTINEL_HOST";
    pub const SENTINEL_PORT: &str = "REDIS_SENTINEL_PORT";
    pub const PASSWORD: &str = "REDIS_PASSWORD";
    pub const MASTER_SET: &str = "REDIS_MASTER_SET";
    pub const DEPLOYMENTS: &str = "DEPLOYMENTS";
    pub const STATEFULSETS: &str = "STATEFULSETS";
    pub const ALL_DEPLOYMENTS_IN: &str = "ALL_DEPLOYMENTS_IN";
    pub const ALL_DEPLOYMENTS_REGEX: &str = "ALL_DEPLOYMENTS_REGEX";
    pub const ALL_STATEFULSETS_IN: &str = "ALL_STATEFULSETS_IN";
    pub const ALL_STATEFULSETS_REGEX: &str = "ALL_STATEFULSETS_REGEX";
    pub const POLL_MIN_SECS: &str = "POLL_INTERVAL_MIN_SECS";
    pub const POLL_MAX_SECS: &str = "POLL_INTERVAL_MAX_SECS";
    pub const SENTINEL_TIMEOUT_SECS: &str = "SENTINEL_TIMEOUT_SECS";
    pub const KUBE_TIMEOUT_SECS: &str = "KUBE_TIMEOUT_SECS";
    pub const RESTART_CONCURRENCY: &str = "RESTART_CONCURRENCY";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
}

const DEFAULT_SENTINEL_HOST: &str = "localhost";
const DEFAULT_SENTINEL_PORT: u16 = 26379;
const DEFAULT_MASTER_SET: &str = "mymaster";
const DEFAULT_POLL_MIN_SECS: u64 = 5;
const DEFAULT_POLL_MAX_SECS: u64 = 10;
const DEFAULT_SENTINEL_TIMEOUT_SECS: u64 = 5;
const DEFAULT_KUBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESTART_CONCURRENCY: usize = 1;

/// Where to find the Sentinel and which replica set to watch
#[derive(Clone)]
pub struct SentinelConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub master_set: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for SentinelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("master_set", &self.master_set)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bounds for the jittered sleep between polls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub min: Duration,
    pub max: Duration,
}

impl PollConfig {
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        ensure!(
            min <= max,
            "poll interval min ({:?}) must not exceed max ({:?})",
            min,
            max
        );
        Ok(Self { min, max })
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(DEFAULT_POLL_MIN_SECS),
            max: Duration::from_secs(DEFAULT_POLL_MAX_SECS),
        }
    }
}

/// Selects every workload of one kind in a set of namespaces,
/// optionally narrowed by a name pattern.
#[derive(Clone, Debug)]
pub struct DynamicSelector {
    pub kind: ResourceKind,
    pub namespaces: BTreeSet<String>,
    pub name_pattern: Option<Regex>,
}

impl DynamicSelector {
    /// Whether a workload name is selected.
    ///
    /// The pattern is searched anywhere in the name, not anchored.
    pub fn matches(&self, name: &str) -> bool {
        self.name_pattern
            .as_ref()
            .map(|pattern| pattern.is_match(name))
            .unwrap_or(true)
    }
}

/// Everything that decides which workloads a restart wave touches
#[derive(Clone, Debug, Default)]
pub struct RestartSpec {
    /// Raw `namespace/name` entries; malformed ones are dropped at resolve time
    pub deployments: Vec<String>,
    pub statefulsets: Vec<String>,
    pub dynamic: Vec<DynamicSelector>,
}

#[derive(Clone, Debug)]
pub struct RestarterConfig {
    pub sentinel: SentinelConfig,
    pub restart: RestartSpec,
    pub poll: PollConfig,
    pub kube_timeout: Duration,
    pub restart_concurrency: usize,
    pub health_port: u16,
}

impl RestarterConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sentinel = SentinelConfig {
            host: lookup(env::SENTINEL_HOST)
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_SENTINEL_HOST.to_string()),
            port: parse_or_default(&lookup, env::SENTINEL_PORT, DEFAULT_SENTINEL_PORT),
            password: lookup(env::PASSWORD).filter(|p| !p.is_empty()),
            master_set: lookup(env::MASTER_SET)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MASTER_SET.to_string()),
            timeout: Duration::from_secs(parse_or_default(
                &lookup,
                env::SENTINEL_TIMEOUT_SECS,
                DEFAULT_SENTINEL_TIMEOUT_SECS,
            )),
        };

        let mut dynamic = Vec::new();
        if let Some(selector) = dynamic_selector(
            &lookup,
            ResourceKind::Deployment,
            env::ALL_DEPLOYMENTS_IN,
            env::ALL_DEPLOYMENTS_REGEX,
        )? {
            dynamic.push(selector);
        }
        if let Some(selector) = dynamic_selector(
            &lookup,
            ResourceKind::StatefulSet,
            env::ALL_STATEFULSETS_IN,
            env::ALL_STATEFULSETS_REGEX,
        )? {
            dynamic.push(selector);
        }

        let restart = RestartSpec {
            deployments: split_list(lookup(env::DEPLOYMENTS).as_deref()),
            statefulsets: split_list(lookup(env::STATEFULSETS).as_deref()),
            dynamic,
        };

        let poll = PollConfig::new(
            Duration::from_secs(parse_or_default(
                &lookup,
                env::POLL_MIN_SECS,
                DEFAULT_POLL_MIN_SECS,
            )),
            Duration::from_secs(parse_or_default(
                &lookup,
                env::POLL_MAX_SECS,
                DEFAULT_POLL_MAX_SECS,
            )),
        )?;

        let restart_concurrency =
            parse_or_default(&lookup, env::RESTART_CONCURRENCY, DEFAULT_RESTART_CONCURRENCY)
                .max(1);

        Ok(Self {
            sentinel,
            restart,
            poll,
            kube_timeout: Duration::from_secs(parse_or_default(
                &lookup,
                env::KUBE_TIMEOUT_SECS,
                DEFAULT_KUBE_TIMEOUT_SECS,
            )),
            restart_concurrency,
            health_port: parse_or_default(
                &lookup,
                env::HEALTH_PORT,
                crate::health::DEFAULT_HEALTH_PORT,
            ),
        })
    }
}

/// Split a comma-separated list, skipping blank items.
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn dynamic_selector<F>(
    lookup: &F,
    kind: ResourceKind,
    namespaces_key: &str,
    regex_key: &str,
) -> Result<Option<DynamicSelector>>
where
    F: Fn(&str) -> Option<String>,
{
    let namespaces: BTreeSet<String> = split_list(lookup(namespaces_key).as_deref())
        .into_iter()
        .collect();

    if namespaces.is_empty() {
        return Ok(None);
    }

    let name_pattern = match lookup(regex_key).filter(|r| !r.is_empty()) {
        Some(raw) => Some(
            Regex::new(&raw).with_context(|| format!("{regex_key} is not a valid regex: {raw}"))?,
        ),
        None => None,
    };

    Ok(Some(DynamicSelector {
        kind,
        namespaces,
        name_pattern,
    }))
}

/// Parse a numeric value, falling back to the default with a warning.
pub(crate) fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(v) => match v.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    env_var = key,
                    value = %v,
                    error = %e,
                    default = %default,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        None => default,
    }
}
