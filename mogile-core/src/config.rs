//! Centralized configuration for the Mogile client.
//!
//! Timeouts and big-file limits are carried by value in [`MogileConfig`]
//! and handed to each component at construction; nothing here is global.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::MogileError;

/// Port a tracker listens on when the host string names none.
pub const DEFAULT_TRACKER_PORT: u16 = 7001;

const MIB: u64 = 1024 * 1024;

/// Central configuration for all client components.
#[derive(Debug, Clone, Default)]
pub struct MogileConfig {
    pub tracker: TrackerConfig,
    pub transfer: TransferConfig,
    pub big_file: BigFileConfig,
}

/// Tracker addressing and socket timeouts.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Candidate trackers; shuffled once when a connection is built
    pub hosts: Vec<HostEndpoint>,
    /// Domain sent with every request, if any
    pub domain: Option<String>,
    /// Bound on establishing the TCP connection to one tracker
    pub connect_timeout: Duration,
    /// Bound on waiting for a single reply line
    pub read_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            domain: None,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// HTTP transfer settings for storage node PUT/GET.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Overall timeout for one HTTP request, body included
    pub command_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(4),
            user_agent: "mogile-client/0.1.0",
        }
    }
}

/// Chunked big-file settings.
#[derive(Debug, Clone)]
pub struct BigFileConfig {
    /// Payloads must be strictly larger than this to be stored chunked
    pub big_threshold: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u64,
    /// Largest buffer the codec may hold in memory at once
    pub max_buffer_size: u64,
    /// Number of replication polls per chunk before giving up
    pub replication_wait_secs: u64,
    /// Distinct paths a chunk needs before it counts as replicated
    pub replication_target: usize,
    /// Pause between two replication polls
    pub poll_interval: Duration,
}

impl Default for BigFileConfig {
    fn default() -> Self {
        Self {
            big_threshold: 64 * MIB,
            chunk_size: 64 * MIB,
            max_buffer_size: 128 * MIB,
            replication_wait_secs: 30,
            replication_target: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl BigFileConfig {
    /// Smallest big-file threshold accepted by the runtime setters.
    pub const MIN_BIG_THRESHOLD: u64 = 64 * MIB;

    /// Checks the chunking limits against each other.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If chunk size is zero, exceeds the
    ///   threshold or the buffer ceiling, or the replication target is zero
    pub fn validate(&self) -> Result<(), MogileError> {
        if self.chunk_size == 0 {
            return Err(MogileError::configuration("chunk size must be positive"));
        }
        if self.chunk_size > self.big_threshold {
            return Err(MogileError::configuration(format!(
                "big threshold ({}) must be at least the chunk size ({})",
                self.big_threshold, self.chunk_size
            )));
        }
        if self.chunk_size > self.max_buffer_size {
            return Err(MogileError::configuration(format!(
                "chunk size ({}) exceeds the maximum buffer size ({})",
                self.chunk_size, self.max_buffer_size
            )));
        }
        if self.replication_target == 0 {
            return Err(MogileError::configuration(
                "replication target must be at least 1",
            ));
        }
        Ok(())
    }
}

/// One tracker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HostEndpoint {
    type Err = MogileError;

    /// Parses `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    MogileError::configuration(format!("invalid tracker port in '{s}'"))
                })?;
                (host, port)
            }
            None => (s, DEFAULT_TRACKER_PORT),
        };

        if host.is_empty() {
            return Err(MogileError::configuration(format!(
                "missing tracker host in '{s}'"
            )));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a comma separated tracker list such as `"t1:7001,t2"`.
///
/// # Errors
///
/// - `MogileError::Configuration` - If any entry is malformed
pub fn parse_hosts(list: &str) -> Result<Vec<HostEndpoint>, MogileError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

impl MogileConfig {
    /// Creates a configuration for the given trackers and domain.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If any host string is malformed
    pub fn with_hosts<S: AsRef<str>>(hosts: &[S], domain: Option<&str>) -> Result<Self, MogileError> {
        let mut config = Self::default();
        config.tracker.hosts = hosts
            .iter()
            .map(|host| host.as_ref().parse())
            .collect::<Result<_, _>>()?;
        config.tracker.domain = domain.map(str::to_string);
        Ok(config)
    }

    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(list) = std::env::var("MOGILE_TRACKERS") {
            match parse_hosts(&list) {
                Ok(hosts) => config.tracker.hosts = hosts,
                Err(e) => tracing::warn!("Ignoring MOGILE_TRACKERS: {}", e),
            }
        }

        if let Ok(domain) = std::env::var("MOGILE_DOMAIN")
            && !domain.is_empty()
        {
            config.tracker.domain = Some(domain);
        }

        if let Some(ms) = env_u64("MOGILE_CONNECT_TIMEOUT_MS") {
            config.tracker.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MOGILE_READ_TIMEOUT_MS") {
            config.tracker.read_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("MOGILE_COMMAND_TIMEOUT") {
            config.transfer.command_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_mib("MOGILE_CHUNK_SIZE_MB") {
            config.big_file.chunk_size = bytes;
        }
        if let Some(bytes) = env_mib("MOGILE_BIG_THRESHOLD_MB") {
            config.big_file.big_threshold = bytes;
        }
        if let Some(secs) = env_u64("MOGILE_REPLICATION_WAIT") {
            config.big_file.replication_wait_secs = secs;
        }

        config
    }

    /// Checks the whole configuration before a client is built.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If no tracker is configured or the
    ///   big-file limits are inconsistent
    pub fn validate(&self) -> Result<(), MogileError> {
        if self.tracker.hosts.is_empty() {
            return Err(MogileError::configuration("no tracker hosts configured"));
        }
        self.big_file.validate()
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Small chunks and short waits so chunked round trips stay fast.
    pub fn for_testing() -> Self {
        Self {
            tracker: TrackerConfig {
                hosts: vec![HostEndpoint::new("127.0.0.1", DEFAULT_TRACKER_PORT)],
                domain: Some("testdomain".to_string()),
                connect_timeout: Duration::from_millis(100),
                read_timeout: Duration::from_millis(500),
            },
            transfer: TransferConfig::default(),
            big_file: BigFileConfig {
                big_threshold: 1024,
                chunk_size: 1024,
                max_buffer_size: 4096,
                replication_wait_secs: 3,
                replication_target: 2,
                poll_interval: Duration::from_secs(1),
            },
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Reads a MiB count and converts it to bytes.
fn env_mib(name: &str) -> Option<u64> {
    let mb = env_u64(name)?;
    let bytes = mib_to_bytes(mb);
    if bytes.is_none() {
        tracing::warn!("Ignoring {}: {} MiB does not fit in u64 bytes", name, mb);
    }
    bytes
}

/// Converts a MiB count to bytes, `None` on overflow.
pub fn mib_to_bytes(mb: u64) -> Option<u64> {
    mb.checked_mul(MIB)
}
