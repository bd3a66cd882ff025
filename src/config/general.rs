//! General configuration settings for the connection pooler.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Which pipeline carries a client session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    Session,
    Transaction,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Session => write!(f, "session"),
            Pipeline::Transaction => write!(f, "transaction"),
        }
    }
}

/// How reused slots are validated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    Off,
    Foreground,
    Background,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Off => write!(f, "off"),
            Validation::Foreground => write!(f, "foreground"),
            Validation::Background => write!(f, "background"),
        }
    }
}

/// General configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    /// When set, also listen on `<unix_socket_dir>/.s.PGSQL.<port>`.
    pub unix_socket_dir: Option<String>,

    /// Pool capacity: number of slots in the table.
    #[serde(default = "General::default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "General::default_pipeline")]
    pub pipeline: Pipeline,

    /// Seconds an acquire may wait for a free slot. 0 disables waiting.
    #[serde(default)]
    pub blocking_timeout: u64,

    /// Seconds a FREE slot may sit unused before the idle sweep kills it.
    /// 0 disables the sweep.
    #[serde(default)]
    pub idle_timeout: u64,

    /// Seconds a slot may live since its first use. 0 disables the limit.
    #[serde(default)]
    pub max_connection_age: u64,

    #[serde(default = "General::default_validation")]
    pub validation: Validation,

    /// Interval of the periodic sweeps.
    #[serde(default = "General::default_background_interval")]
    pub background_interval: u64,

    #[serde(default = "General::default_max_retries")]
    pub max_retries: u32,

    /// Seconds a client may sit idle before the supervisor disconnects it,
    /// cancelling its in-flight query first. 0 disables.
    #[serde(default)]
    pub disconnect_client: u64,

    #[serde(default)]
    pub disconnect_client_force: bool,

    /// Run the failover procedure when the primary becomes unreachable.
    #[serde(default)]
    pub failover: bool,

    /// Script executed as `script old-host old-port new-host new-port`.
    pub failover_script: Option<String>,

    pub users_file: Option<String>,
    pub hba_file: Option<String>,
    pub limits_file: Option<String>,

    /// Defaults to `~/.pg_warden/master.key`.
    pub master_key_file: Option<String>,

    pub tls_certificate: Option<String>,
    pub tls_private_key: Option<String>,

    #[serde(default = "General::default_admin_username")]
    pub admin_username: String,
    #[serde(default = "General::default_admin_password")]
    pub admin_password: String,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    #[serde(default = "General::default_tcp_keepalives_idle")]
    pub tcp_keepalives_idle: u64,
    #[serde(default = "General::default_tcp_keepalives_count")]
    pub tcp_keepalives_count: u32,
    #[serde(default = "General::default_tcp_keepalives_interval")]
    pub tcp_keepalives_interval: u64,
    #[serde(default = "General::default_tcp_so_linger")]
    pub tcp_so_linger: u64,
    #[serde(default = "General::default_tcp_no_delay")]
    pub tcp_no_delay: bool,

    #[serde(default = "General::default_unix_socket_buffer_size")]
    pub unix_socket_buffer_size: usize,

    #[serde(default = "General::default_log_client_connections")]
    pub log_client_connections: bool,

    pub syslog_prog_name: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_port() -> u16 {
        2345
    }

    pub fn default_max_connections() -> usize {
        100
    }

    pub fn default_pipeline() -> Pipeline {
        Pipeline::Session
    }

    pub fn default_validation() -> Validation {
        Validation::Off
    }

    pub fn default_background_interval() -> u64 {
        300
    }

    pub fn default_max_retries() -> u32 {
        5
    }

    pub fn default_admin_username() -> String {
        "admin".into()
    }

    pub fn default_admin_password() -> String {
        "admin".into()
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get()
    }

    pub fn default_shutdown_timeout() -> u64 {
        10
    }

    // These keepalive defaults notice a dead peer within 30 seconds. Tokio
    // disables keepalives by default, which keeps dead connections around
    // indefinitely and can exhaust the pool permanently.
    pub fn default_tcp_keepalives_idle() -> u64 {
        5
    }

    pub fn default_tcp_keepalives_count() -> u32 {
        5
    }

    pub fn default_tcp_keepalives_interval() -> u64 {
        5
    }

    pub fn default_tcp_so_linger() -> u64 {
        0
    }

    pub fn default_tcp_no_delay() -> bool {
        true
    }

    pub fn default_unix_socket_buffer_size() -> usize {
        1024 * 1024
    }

    pub fn default_log_client_connections() -> bool {
        true
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: Self::default_host(),
            port: Self::default_port(),
            unix_socket_dir: None,
            max_connections: Self::default_max_connections(),
            pipeline: Self::default_pipeline(),
            blocking_timeout: 0,
            idle_timeout: 0,
            max_connection_age: 0,
            validation: Self::default_validation(),
            background_interval: Self::default_background_interval(),
            max_retries: Self::default_max_retries(),
            disconnect_client: 0,
            disconnect_client_force: false,
            failover: false,
            failover_script: None,
            users_file: None,
            hba_file: None,
            limits_file: None,
            master_key_file: None,
            tls_certificate: None,
            tls_private_key: None,
            admin_username: Self::default_admin_username(),
            admin_password: Self::default_admin_password(),
            worker_threads: Self::default_worker_threads(),
            shutdown_timeout: Self::default_shutdown_timeout(),
            tcp_keepalives_idle: Self::default_tcp_keepalives_idle(),
            tcp_keepalives_count: Self::default_tcp_keepalives_count(),
            tcp_keepalives_interval: Self::default_tcp_keepalives_interval(),
            tcp_so_linger: Self::default_tcp_so_linger(),
            tcp_no_delay: Self::default_tcp_no_delay(),
            unix_socket_buffer_size: Self::default_unix_socket_buffer_size(),
            log_client_connections: Self::default_log_client_connections(),
            syslog_prog_name: None,
        }
    }
}
