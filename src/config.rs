//! Configuration management

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub emulation: EmulationConfig,
    /// Extra pseudo-commands: leading token -> canned output
    #[serde(default)]
    pub commands: HashMap<String, String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending-connection backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Host key location; an Ed25519 key is generated here when missing
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            host_key_path: default_host_key_path(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_backlog() -> u32 {
    100
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("server.key")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for the client to authenticate and open a session channel
    #[serde(default = "default_timeout_secs")]
    pub channel_timeout_secs: u64,
    /// How long to wait for a shell request once the channel is open
    #[serde(default = "default_timeout_secs")]
    pub shell_timeout_secs: u64,
    /// Idle time on a single read before the peer is presumed dead
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_timeout_secs: default_timeout_secs(),
            shell_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

impl SessionConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmulationConfig {
    /// SSH identification string sent before key exchange
    #[serde(default = "default_ssh_banner")]
    pub ssh_banner: String,
    /// Pre-authentication banner (SSH_MSG_USERAUTH_BANNER), disabled when empty
    #[serde(default = "default_auth_banner")]
    pub auth_banner: String,
    #[serde(default = "default_welcome_banner")]
    pub welcome_banner: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Output for commands missing from the table. Empty means silent.
    #[serde(default)]
    pub unknown_command: String,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            ssh_banner: default_ssh_banner(),
            auth_banner: default_auth_banner(),
            welcome_banner: default_welcome_banner(),
            prompt: default_prompt(),
            unknown_command: String::new(),
        }
    }
}

fn default_ssh_banner() -> String {
    "SSH-2.0-OpenSSH_7.6p1 Ubuntu-4ubuntu0.3".to_string()
}

fn default_auth_banner() -> String {
    "Authorized access only! This system is only meant to be accessed by system administrators.\r\n\
     If you are not authorized to access this system, disconnect immediately!\r\n"
        .to_string()
}

fn default_welcome_banner() -> String {
    "Welcome to Ubuntu 18.04.1 LTS (GNU/Linux 4.15.0-36-generic x86_64)\r\n\r\n".to_string()
}

fn default_prompt() -> String {
    "$ ".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// SQLite database file holding the download queue
    #[serde(default = "default_queue_url")]
    pub url: String,
    /// Channel name every discovered resource is filed under
    #[serde(default = "default_queue_channel")]
    pub channel: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_queue_url(),
            channel: default_queue_channel(),
        }
    }
}

fn default_queue_url() -> String {
    "honeypot.db".to_string()
}

fn default_queue_channel() -> String {
    "download_queue".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional file that receives a copy of every log record
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Layer the config file, `HONEYPOT__*` environment variables and CLI flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(cli.config.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix("HONEYPOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("server.port", cli.port.map(i64::from))?
            .set_override_option("server.host", cli.bind.clone())?
            .set_override_option("logging.level", cli.log_level.clone())?;

        let settings = builder
            .build()
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.host.parse::<IpAddr>().is_err() {
            anyhow::bail!("Invalid server host '{}': expected an IP address", self.server.host);
        }
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.backlog == 0 {
            anyhow::bail!("Invalid backlog: 0 is not allowed");
        }

        let timeouts = [
            ("channel_timeout_secs", self.session.channel_timeout_secs),
            ("shell_timeout_secs", self.session.shell_timeout_secs),
            ("read_timeout_secs", self.session.read_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                anyhow::bail!("Invalid session.{}: 0 is not allowed", name);
            }
        }

        if !self.emulation.ssh_banner.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "Invalid ssh_banner '{}': must start with 'SSH-2.0-'",
                self.emulation.ssh_banner
            );
        }

        if self.queue.url.is_empty() {
            anyhow::bail!("Queue database URL cannot be empty");
        }
        if self.queue.channel.is_empty() {
            anyhow::bail!("Queue channel name cannot be empty");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .with_context(|| format!("parsing bind address '{}'", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.backlog, 100);
        assert_eq!(config.session.shell_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue.channel, "download_queue");
        assert!(config.emulation.unknown_command.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn listen_addr_handles_ipv6() {
        let mut config = Config::default();
        config.server.host = "::1".to_string();
        config.server.port = 2022;
        assert_eq!(config.listen_addr().unwrap(), "[::1]:2022".parse().unwrap());
    }

    #[test]
    fn rejects_hostname_bind() {
        let mut config = Config::default();
        config.server.host = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = Config::default();
        config.session.read_timeout_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("read_timeout_secs"));
    }

    #[test]
    fn rejects_non_ssh_identification() {
        let mut config = Config::default();
        config.emulation.ssh_banner = "Authorized access only!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_overrides_file_values() {
        let cli = Cli {
            config: PathBuf::from("does-not-exist.toml"),
            port: Some(2022),
            bind: Some("127.0.0.1".to_string()),
            log_level: None,
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.server.port, 2022);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
    }
}
