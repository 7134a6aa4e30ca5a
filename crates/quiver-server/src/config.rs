//! Server configuration.

use clap::Parser;

use quiver_bolt::DEFAULT_MAX_MESSAGE_SIZE;

/// Default TCP address for the server.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:7687";

/// Agent string announced to clients during setup.
pub const DEFAULT_SERVER_AGENT: &str = concat!("quiver/", env!("CARGO_PKG_VERSION"));

/// Quiver server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to bind to (e.g., "127.0.0.1:7687").
    pub bind_address: String,

    /// Maximum framed message size in bytes, inbound and outbound.
    pub max_message_size: usize,

    /// Agent string reported in the setup success metadata.
    pub server_agent: String,
}

impl ServerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            server_agent: DEFAULT_SERVER_AGENT.to_string(),
        }
    }

    /// Set the TCP bind address.
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the agent string announced to clients.
    pub fn with_server_agent(mut self, agent: impl Into<String>) -> Self {
        self.server_agent = agent.into();
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "quiver-server")]
#[command(version, about = "Quiver graph database server", long_about = None)]
pub struct Args {
    /// TCP address to bind to.
    #[arg(short, long, default_value = DEFAULT_BIND_ADDRESS)]
    pub bind: String,

    /// Maximum message size in megabytes.
    #[arg(long, default_value_t = 4)]
    pub max_message_mb: usize,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig::new()
            .with_bind_address(self.bind)
            .with_max_message_size(self.max_message_mb.max(1) * 1024 * 1024)
    }
}
