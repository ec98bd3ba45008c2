use std::net::SocketAddr;
use std::path::Path;

use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub address: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
}

impl GatewayConfig {
    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(File::from(path.as_ref().to_path_buf()))?;

        c.try_into()
    }
}
