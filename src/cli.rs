use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ssh-honeypot",
    version,
    about = "Run an SSH honeypot server"
)]
pub struct Cli {
    /// Path to configuration file (also settable via HONEYPOT_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "HONEYPOT_CONFIG")]
    pub config: PathBuf,

    /// The port to bind the SSH server to (default 2222)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// The address to bind the SSH server to (default all interfaces)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}
