//! Configuration for the pooler: the TOML file, plus the users, HBA and
//! limits files it points at. The active configuration is globally available
//! behind an `ArcSwap` and is replaced wholesale on reload.

use arc_swap::ArcSwap;
use log::{error, info};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::auth::hba::HbaTable;
use crate::errors::Error;

mod general;
mod limits;
mod server;
mod users;

#[cfg(test)]
mod tests;

pub use general::{General, Pipeline, Validation};
pub use limits::{parse_limits_file, LimitConfig};
pub use server::ServerConfig;
pub use users::{
    encrypt_password, parse_users_file, read_master_key, user_known, user_password, UserEntry,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Configuration wrapper.
#[derive(serde_derive::Serialize, serde_derive::Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    // General and global settings.
    #[serde(default)]
    pub general: General,

    // Backend servers, in declaration order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    // Loaded from the side files named in `general`; not part of the TOML.
    #[serde(skip)]
    pub users: Vec<UserEntry>,

    #[serde(skip)]
    pub hba: HbaTable,

    #[serde(skip)]
    pub limits: Vec<LimitConfig>,
}

impl Config {
    /// Print the parts of the configuration worth seeing at startup.
    pub fn show(&self) {
        info!("Listening on {}:{}", self.general.host, self.general.port);
        if let Some(ref dir) = self.general.unix_socket_dir {
            info!("Unix socket directory: {dir}");
        }
        info!("Pool capacity: {}", self.general.max_connections);
        info!("Pipeline: {}", self.general.pipeline);
        info!("Blocking timeout: {}s", self.general.blocking_timeout);
        info!("Idle timeout: {}s", self.general.idle_timeout);
        info!(
            "Max connection age: {}s",
            self.general.max_connection_age
        );
        info!("Validation: {}", self.general.validation);
        info!("Failover: {}", self.general.failover);
        for server in &self.servers {
            info!(
                "Server {}: {}:{}{}",
                server.name,
                server.host,
                server.port,
                if server.primary { " (primary)" } else { "" }
            );
        }
        info!("Users: {}", self.users.len());
        info!("HBA entries: {}", self.hba.len());
        info!("Limit rules: {}", self.limits.len());
        match self.general.tls_certificate {
            Some(ref cert) => info!("TLS certificate: {cert}"),
            None => info!("TLS support is disabled"),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::BadConfig("no servers defined".into()));
        }

        if self.servers.iter().filter(|s| s.primary).count() > 1 {
            return Err(Error::BadConfig(
                "at most one server may be marked primary".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for server in &self.servers {
            if !names.insert(&server.name) {
                return Err(Error::BadConfig(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        if self.general.max_connections == 0 {
            return Err(Error::BadConfig("max_connections must be positive".into()));
        }

        if self.general.tls_certificate.is_some() != self.general.tls_private_key.is_some() {
            return Err(Error::BadConfig(
                "tls_certificate and tls_private_key must be set together".into(),
            ));
        }

        if self.general.failover && self.general.failover_script.is_none() {
            return Err(Error::BadConfig(
                "failover is enabled but failover_script is not set".into(),
            ));
        }

        for limit in &self.limits {
            limit.validate()?;
        }

        Ok(())
    }
}

/// Get a read-only instance of the configuration from anywhere in the app.
/// ArcSwap makes this cheap and quick.
pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not open '{path}': {err}")));
        }
    };
    match file.read_to_string(&mut contents).await {
        Ok(_) => (),
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not read '{path}': {err}")));
        }
    };
    Ok(contents)
}

/// Parse the configuration file located at the path, together with the users,
/// HBA and limits files it references, and install it globally.
pub async fn parse(path: &str) -> Result<(), Error> {
    let contents = load_file(path).await?;

    let mut config: Config = toml::from_str(&contents)
        .map_err(|err| Error::BadConfig(format!("Could not parse config file {path}: {err}")))?;

    if let Some(ref users_file) = config.general.users_file {
        let master_key = read_master_key(config.general.master_key_file.as_deref())?;
        config.users = parse_users_file(&load_file(users_file).await?, &master_key)?;
    }

    if let Some(ref hba_file) = config.general.hba_file {
        config.hba = HbaTable::parse(&load_file(hba_file).await?)?;
    }

    if let Some(ref limits_file) = config.general.limits_file {
        config.limits = parse_limits_file(&load_file(limits_file).await?)?;
    }

    config.validate()?;

    config.path = path.to_string();

    CONFIG.store(Arc::new(config));

    Ok(())
}

/// Re-read the configuration and its side files. The slot table and limit
/// counters are sized at startup and keep their layout; a changed limits file
/// only takes effect on restart.
pub async fn reload_config() -> Result<bool, Error> {
    let old_config = get_config();

    match parse(&old_config.path).await {
        Ok(()) => (),
        Err(err) => {
            error!("Config reload error: {err}");
            return Err(err);
        }
    };

    let new_config = get_config();

    if new_config.limits != old_config.limits {
        log::warn!("Limit rules changed on disk; a restart is required for them to take effect");
    }

    Ok(*new_config != *old_config)
}

#[cfg(test)]
pub(crate) fn set_config_for_tests(config: Config) {
    CONFIG.store(Arc::new(config));
}
