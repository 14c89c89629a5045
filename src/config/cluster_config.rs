//! Cluster client configuration

use std::time::Duration;

use clap::ValueEnum;

use super::cli::CliArgs;
use crate::cluster::{HostTranslation, NodeAddress};
use crate::utils::{ClientError, Result};

/// Where read-only commands are sent
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFrom {
    /// Always read from primary
    #[default]
    Primary,
    /// Replicas only; fails when a shard has none available
    Replica,
    /// Prefer replicas, fallback to primary
    PreferReplica,
}

/// Settings shared by the blocking and async cluster clients
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed nodes for topology discovery
    pub seeds: Vec<NodeAddress>,
    pub read_from: ReadFrom,
    /// Dispatches per command, redirects and retries included
    pub max_attempts: u32,
    /// MOVED/ASK hops per command
    pub max_redirects: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bound on a single reply wait
    pub request_timeout: Duration,
    /// Bound on a whole command, retries and backoff included
    pub overall_timeout: Duration,
    pub connect_timeout: Duration,
    /// Refresh the slot map once it is this old
    pub refresh_interval: Option<Duration>,
    /// Refresh after this many MOVED replies (0 disables)
    pub refresh_after_moved: u32,
    pub host_translation: HostTranslation,
    /// Idle connections kept per node
    pub max_idle_per_node: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            read_from: ReadFrom::Primary,
            max_attempts: 16,
            max_redirects: 5,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            overall_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            refresh_interval: None,
            refresh_after_moved: 5,
            host_translation: HostTranslation::default(),
            max_idle_per_node: 8,
        }
    }
}

impl ClusterConfig {
    pub fn new(seeds: Vec<NodeAddress>) -> Self {
        Self {
            seeds,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: NodeAddress) -> Self {
        self.seeds.push(seed);
        self
    }

    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_refresh_after_moved(mut self, count: u32) -> Self {
        self.refresh_after_moved = count;
        self
    }

    pub fn with_host_translation(mut self, translation: HostTranslation) -> Self {
        self.host_translation = translation;
        self
    }

    pub fn with_max_idle_per_node(mut self, max_idle: usize) -> Self {
        self.max_idle_per_node = max_idle;
        self
    }

    /// Validate setting combinations
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(ClientError::Config("at least one seed node is required".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ClientError::Config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        if self.request_timeout.is_zero() || self.overall_timeout.is_zero() {
            return Err(ClientError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Build from command-line arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let seeds = args
            .hosts
            .iter()
            .map(|host| parse_seed(host, args.port))
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            seeds,
            read_from: args.read_from,
            max_attempts: args.max_attempts,
            max_redirects: args.max_redirects,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            overall_timeout: Duration::from_millis(args.overall_timeout_ms),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            refresh_interval: args.refresh_interval_secs.map(Duration::from_secs),
            host_translation: HostTranslation::from_rules(&args.remap)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// `host` or `host:port`; bare hosts take `default_port`
fn parse_seed(host: &str, default_port: u16) -> Result<NodeAddress> {
    if host.is_empty() {
        return Err(ClientError::Config("empty host".to_string()));
    }
    match host.parse::<NodeAddress>() {
        Ok(address) if !address.host.is_empty() => Ok(address),
        _ if host.contains(':') && !host.contains("::") => Err(ClientError::Config(format!(
            "invalid seed address '{}'",
            host
        ))),
        _ => Ok(NodeAddress::new(host, default_port)),
    }
}
