//! Backend server configuration.

use serde_derive::{Deserialize, Serialize};

/// One backend server. The order of declaration is the order of the server
/// descriptor table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,

    /// Hostname, address, or a filesystem path. A path means an AF_UNIX
    /// socket named `.s.PGSQL.<port>` inside that directory.
    pub host: String,

    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,

    /// Marks the designated primary before the first probe.
    #[serde(default)]
    pub primary: bool,

    /// Connect to this backend over TLS.
    #[serde(default)]
    pub tls: bool,
}

impl ServerConfig {
    pub fn default_port() -> u16 {
        5432
    }
}
