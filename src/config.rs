//! Cluster and node configuration.
//!
//! Configuration is a plain set of named options. Each one can be set in code
//! or parsed from text with [`ClusterConfig::set_option`], which is how the
//! command line tools accept `-o name=value` pairs.
//!
//! | option              | default | applies to |
//! |---------------------|---------|------------|
//! | `minConnections`    | 1       | each node  |
//! | `maxConnections`    | 16      | each node  |
//! | `connectTimeout`    | 5000ms  | each node  |
//! | `requestTimeout`    | 30000ms | each node  |
//! | `blockOnExhausted`  | true    | each node  |
//! | `borrowTimeout`     | 5000ms  | each node  |
//! | `maxFrameSize`      | 64 MiB  | each node  |
//! | `failureThreshold`  | 3       | each node  |
//! | `probeInterval`     | 1000ms  | each node  |
//! | `retryCount`        | 2       | cluster    |
//! | `ioThreads`         | 8       | cluster    |
//!
//! Durations are given in milliseconds.
use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_PORT: u16 = 8087;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized option '{0}'")]
    UnknownOption(String),

    #[error("invalid value '{value}' for '{option}', {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("invalid address '{0}', expected host:port")]
    InvalidAddress(String),

    #[error("minConnections ({min}) exceeds maxConnections ({max}) for {node}")]
    PoolBounds { node: String, min: usize, max: usize },

    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("no nodes configured")]
    NoNodes,
}

/// Host and port of one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
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

impl FromStr for NodeAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidAddress(s.to_string()));
        }

        // [v6]:port or [v6]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(ConfigError::InvalidAddress(s.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
            _ => Err(ConfigError::InvalidAddress(s.to_string())),
        }
    }
}

impl From<std::net::SocketAddr> for NodeAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Per-node settings: pool bounds, timeouts and health policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    /// Default deadline for an operation that does not set its own.
    pub request_timeout: Duration,
    /// Wait for a connection when the pool is at max instead of failing fast.
    pub block_on_exhausted: bool,
    pub borrow_timeout: Duration,
    pub max_frame_size: usize,
    /// Consecutive connectivity failures before the node is marked unhealthy.
    pub failure_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 16,
            connect_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(30_000),
            block_on_exhausted: true,
            borrow_timeout: Duration::from_millis(5_000),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            failure_threshold: 3,
            probe_interval: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub address: NodeAddress,
    pub options: NodeOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Options given to nodes added after construction.
    pub defaults: NodeOptions,
    /// Extra nodes an operation may hop to after its first attempt.
    pub retry_count: u32,
    /// Threads that pick nodes and schedule retries. Attempts themselves run
    /// on each node's own workers.
    pub io_threads: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            defaults: NodeOptions::default(),
            retry_count: 2,
            io_threads: 8,
        }
    }
}

impl ClusterConfig {
    pub fn new<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = NodeAddress>,
    {
        let mut config = Self::default();
        for address in addresses {
            config.add_node(address);
        }
        config
    }

    /// Adds a node with the current default options.
    pub fn add_node(&mut self, address: NodeAddress) -> &mut Self {
        self.nodes.push(NodeConfig {
            address,
            options: self.defaults.clone(),
        });
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Applies `f` to the defaults and to every node already configured.
    pub fn with_node_options<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut NodeOptions),
    {
        f(&mut self.defaults);
        for node in self.nodes.iter_mut() {
            f(&mut node.options);
        }
        self
    }

    /// Parses `name=value`.
    pub fn set(&mut self, pair: &str) -> Result<(), ConfigError> {
        let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            option: pair.to_string(),
            value: String::new(),
            reason: "expected name=value".to_string(),
        })?;
        self.set_option(name.trim(), value.trim())
    }

    /// Sets one named option from its textual value.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "retryCount" => self.retry_count = parse_number(name, value)?,
            "ioThreads" => self.io_threads = parse_number(name, value)?,
            _ => {
                let mut defaults = self.defaults.clone();
                apply_node_option(&mut defaults, name, value)?;
                for node in self.nodes.iter_mut() {
                    apply_node_option(&mut node.options, name, value)?;
                }
                self.defaults = defaults;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_threads == 0 {
            return Err(ConfigError::Zero("ioThreads"));
        }
        validate_options("defaults", &self.defaults)?;
        for node in &self.nodes {
            validate_options(&node.address.to_string(), &node.options)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_options(node: &str, options: &NodeOptions) -> Result<(), ConfigError> {
    if options.max_connections == 0 {
        return Err(ConfigError::Zero("maxConnections"));
    }
    if options.min_connections > options.max_connections {
        return Err(ConfigError::PoolBounds {
            node: node.to_string(),
            min: options.min_connections,
            max: options.max_connections,
        });
    }
    if options.failure_threshold == 0 {
        return Err(ConfigError::Zero("failureThreshold"));
    }
    Ok(())
}

fn apply_node_option(options: &mut NodeOptions, name: &str, value: &str) -> Result<(), ConfigError> {
    match name {
        "minConnections" => options.min_connections = parse_number(name, value)?,
        "maxConnections" => options.max_connections = parse_number(name, value)?,
        "connectTimeout" => options.connect_timeout = parse_millis(name, value)?,
        "requestTimeout" => options.request_timeout = parse_millis(name, value)?,
        "blockOnExhausted" => options.block_on_exhausted = parse_bool(name, value)?,
        "borrowTimeout" => options.borrow_timeout = parse_millis(name, value)?,
        "maxFrameSize" => options.max_frame_size = parse_number(name, value)?,
        "failureThreshold" => options.failure_threshold = parse_number(name, value)?,
        "probeInterval" => options.probe_interval = parse_millis(name, value)?,
        other => return Err(ConfigError::UnknownOption(other.to_string())),
    }
    Ok(())
}

fn parse_number<T: FromStr>(option: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}

fn parse_millis(option: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(option, value).map(Duration::from_millis)
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
