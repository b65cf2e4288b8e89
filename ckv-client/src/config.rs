//! # Client Configuration
//!
//! Purpose: Describe how to reach the cluster and how the core behaves:
//! seed nodes, read preference, deadlines, protocol and reconnect policy.
//!
//! ## Design Principles
//! 1. **Plain Data**: Public fields plus `Default`, like the pool config.
//! 2. **Format-Agnostic Loading**: Everything derives serde traits so callers
//!    can load it from whatever file format they already use.
//! 3. **Validate Once**: `validate` runs before any connection is attempted.

use std::fmt;
use std::time::Duration;

use ckv_common::ProtocolVersion;
use serde::{Deserialize, Serialize};

use crate::error::{ClientResult, ConfigurationError};

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Host and port of a node. Also the key under which its connection is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddress {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `host` or `[v6]:port`.
    ///
    /// An empty host is replaced by `fallback_host`; nodes announce
    /// themselves that way when they do not know their own endpoint.
    pub fn parse(input: &str, fallback_host: &str) -> Option<Self> {
        let input = input.trim();
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') || host.starts_with('[') => {
                (host, port.parse::<u16>().ok()?)
            }
            Some(_) => return None,
            None => (input, DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { fallback_host } else { host };
        if host.is_empty() {
            return None;
        }
        Some(NodeAddress::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Where read-only commands go when routed implicitly by key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    /// Always the slot's primary.
    #[default]
    Primary,
    /// A replica of the slot when one exists, otherwise the primary.
    PreferReplica,
    /// Replicas in `client_az` first, then any replica, then the primary.
    ///
    /// Each node's zone is its `availability-zone` config, read on connect.
    AzAffinity { client_az: String },
}

impl ReadFrom {
    /// True when read-only commands may be served by replicas.
    pub fn reads_replicas(&self) -> bool {
        !matches!(self, ReadFrom::Primary)
    }

    pub fn client_az(&self) -> Option<&str> {
        match self {
            ReadFrom::AzAffinity { client_az } => Some(client_az),
            _ => None,
        }
    }
}

/// Tie-break among several eligible replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSelection {
    /// Deterministic rotation shared by all slots.
    #[default]
    RoundRobin,
    /// Uniformly random replica per request.
    Random,
}

/// Reconnect policy for establishing node connections.
///
/// Attempt `n` (0-based) waits `factor_ms * exponent_base^n` milliseconds,
/// capped at [`BackoffStrategy::MAX_DELAY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffStrategy {
    pub num_of_retries: u32,
    pub factor_ms: u64,
    pub exponent_base: u32,
}

impl BackoffStrategy {
    pub const MAX_DELAY: Duration = Duration::from_secs(5);

    /// Delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = (self.exponent_base as u64).saturating_pow(attempt);
        let millis = self.factor_ms.saturating_mul(multiplier);
        Duration::from_millis(millis).min(Self::MAX_DELAY)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy {
            num_of_retries: 3,
            factor_ms: 100,
            exponent_base: 2,
        }
    }
}

/// Background topology checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicChecks {
    Enabled {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    Disabled,
}

impl Default for PeriodicChecks {
    fn default() -> Self {
        PeriodicChecks::Enabled {
            interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for the client, its node registry and topology refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed nodes. Standalone mode uses the first one.
    pub addresses: Vec<NodeAddress>,
    /// Route by hash slot across a cluster.
    pub cluster_mode: bool,
    pub read_from: ReadFrom,
    pub replica_selection: ReplicaSelection,
    /// Deadline for a single command (blocking commands get their own timeout added).
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Deadline for opening one TCP connection.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    pub protocol: ProtocolVersion,
    /// Sent with `CLIENT SETNAME` on every new connection.
    pub client_name: Option<String>,
    /// Logical database, standalone mode only.
    pub database_id: u32,
    pub reconnect: BackoffStrategy,
    pub periodic_checks: PeriodicChecks,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addresses: vec![NodeAddress::new("127.0.0.1", DEFAULT_PORT)],
            cluster_mode: false,
            read_from: ReadFrom::default(),
            replica_selection: ReplicaSelection::default(),
            request_timeout: Duration::from_millis(250),
            connect_timeout: Duration::from_millis(250),
            protocol: ProtocolVersion::default(),
            client_name: None,
            database_id: 0,
            reconnect: BackoffStrategy::default(),
            periodic_checks: PeriodicChecks::default(),
        }
    }
}

impl ClientConfig {
    /// Standalone config for a single node.
    pub fn standalone(addr: NodeAddress) -> Self {
        ClientConfig {
            addresses: vec![addr],
            ..ClientConfig::default()
        }
    }

    /// Cluster config from seed nodes.
    pub fn cluster(seeds: Vec<NodeAddress>) -> Self {
        ClientConfig {
            addresses: seeds,
            cluster_mode: true,
            ..ClientConfig::default()
        }
    }

    /// Rejects configs the client cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.addresses.is_empty() {
            return Err(invalid("at least one address is required"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request timeout must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect timeout must be positive"));
        }
        if self.reconnect.exponent_base == 0 {
            return Err(invalid("backoff exponent base must be at least 1"));
        }
        if self.read_from.client_az().map_or(false, str::is_empty) {
            return Err(invalid("AZ affinity needs a client availability zone"));
        }
        if self.cluster_mode && self.database_id != 0 {
            return Err(invalid("cluster mode only supports database 0"));
        }
        if let PeriodicChecks::Enabled { interval } = self.periodic_checks {
            if interval.is_zero() {
                return Err(invalid("periodic check interval must be positive"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> crate::error::ClientError {
    ConfigurationError::Invalid(message.to_string()).into()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
