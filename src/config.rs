use crate::protocol::Framing;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Reactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on how long a single poll call may wait
    pub poll_timeout_ms: u16,

    /// Largest number of bytes a socket may buffer without completing a message
    pub max_message_size: usize,

    /// Message framing used on the wire
    pub framing: Framing,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// SO_REUSEADDR
    pub reuse_address: bool,

    /// SO_LINGER in milliseconds (None leaves the OS default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linger_ms: Option<u64>,

    /// Timeout for the initial connect (None blocks until the OS gives up)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Pending connection queue length for listeners
    pub listen_backlog: i32,

    /// Flush attempts made by a graceful shutdown before giving up on queued data
    pub shutdown_attempts: u32,

    /// Sleep between shutdown flush attempts
    pub shutdown_retry_ms: u64,

    /// Wait after the half-close before the handle is released
    pub shutdown_linger_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            max_message_size: 64 * 1024, // 64KB
            framing: Framing::Nul,
            tcp_nodelay: true,
            reuse_address: true,
            linger_ms: None,
            connect_timeout_ms: Some(5000),
            listen_backlog: libc::SOMAXCONN,
            shutdown_attempts: 10,
            shutdown_retry_ms: 5,
            shutdown_linger_ms: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tickwire::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("tickwire.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be > 0");
        }

        if self.shutdown_attempts == 0 {
            anyhow::bail!("shutdown_attempts must be > 0");
        }

        if self.listen_backlog <= 0 {
            anyhow::bail!("listen_backlog must be > 0");
        }

        Ok(())
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_retry(&self) -> Duration {
        Duration::from_millis(self.shutdown_retry_ms)
    }

    pub fn shutdown_linger(&self) -> Duration {
        Duration::from_millis(self.shutdown_linger_ms)
    }
}
