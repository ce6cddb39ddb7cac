//! CLI configuration for the relay binary.

use clap::Parser;

/// Reverse HTTP tunneling relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "rtunnel-relay")]
#[command(author, version, about = "Reverse HTTP tunneling relay", long_about = None)]
pub struct Config {
    /// Bind address for the public + control-channel listener.
    #[arg(long, env = "ZTUNNEL_HOSTNAME", default_value = "0.0.0.0")]
    pub hostname: String,

    /// Bind port for the public + control-channel listener.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Base subdomain the relay itself runs under, stripped from every
    /// resolved client name (see `hostname::resolve`). Empty means none.
    #[arg(long, env = "ZTUNNEL_SUBDOMAIN", default_value = "")]
    pub subdomain: String,

    /// `tracing` env-filter directive.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.hostname, self.port).parse()?)
    }
}
