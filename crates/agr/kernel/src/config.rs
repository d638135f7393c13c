//! Configuration for an AGR kernel

use std::net::SocketAddr;
use std::time::Duration;

use agr_net::NetTimeouts;
use serde::{Deserialize, Serialize};

/// Main kernel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Thread tier configuration
    #[serde(default)]
    pub threads: ThreadsConfig,

    /// Peer networking
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Groups created when the kernel starts
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Thread tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// Prefix of every thread name
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Stack size in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Nice value of agent threads
    #[serde(default = "default_agent_nice")]
    pub agent_nice: i32,

    /// Nice value of kernel threads
    #[serde(default = "default_kernel_nice")]
    pub kernel_nice: i32,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            stack_size: default_stack_size(),
            agent_nice: default_agent_nice(),
            kernel_nice: default_kernel_nice(),
        }
    }
}

/// Peer networking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Start networking when the kernel starts
    #[serde(default)]
    pub enabled: bool,

    /// Address accepting peer kernels
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Kernels to connect to at startup
    #[serde(default)]
    pub peers: Vec<SocketAddr>,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Handshake and snapshot timeout in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: None,
            peers: Vec::new(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn timeouts(&self) -> NetTimeouts {
        NetTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            handshake: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub groups: Vec<BootstrapGroup>,
}

/// A group held by the kernel from startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapGroup {
    pub community: String,
    pub group: String,
    #[serde(default)]
    pub distributed: bool,
}

// Default value helpers
fn default_name_prefix() -> String {
    "agr".to_string()
}

fn default_stack_size() -> usize {
    2 * 1024 * 1024
}

fn default_agent_nice() -> i32 {
    1
}

fn default_kernel_nice() -> i32 {
    -1
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KernelConfig {
    /// Load configuration: defaults, then the optional file, then `AGR_`
    /// environment variables (`AGR_NETWORK__LISTEN_ADDR`, ...).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&KernelConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Field names contain underscores, so nesting uses a double one.
        builder = builder.add_source(
            config::Environment::with_prefix("AGR")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("network.peers")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
