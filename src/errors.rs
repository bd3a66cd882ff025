//! Errors.

/// Various errors.
#[derive(Debug, PartialEq)]
pub enum Error {
    SocketError(String),
    ClientBadStartup,
    ProtocolSyncError(String),
    BadConfig(String),
    ServerError(String),
    ServerStartupError(String, ServerIdentifier),
    ServerAuthError(String, ServerIdentifier),
    ClientError(String),
    AuthError(String),
    HbaForbiddenError(String),
    ScramClientError(String),
    ScramServerError(String),
    TlsError(String),
    PoolFull,
    AllServersDown,
    ShuttingDown,
    MaxMessageSize,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::SocketError(msg) => write!(f, "socket error: {msg}"),
            Error::ClientBadStartup => write!(f, "client sent a bad startup message"),
            Error::ProtocolSyncError(msg) => write!(f, "protocol synchronization error: {msg}"),
            Error::BadConfig(msg) => write!(f, "bad configuration: {msg}"),
            Error::ServerError(msg) => write!(f, "server error: {msg}"),
            Error::ServerStartupError(msg, id) => {
                write!(f, "error reading {msg} on server startup {id}")
            }
            Error::ServerAuthError(msg, id) => write!(f, "server authentication: {msg} for {id}"),
            Error::ClientError(msg) => write!(f, "client error: {msg}"),
            Error::AuthError(msg) => write!(f, "authentication error: {msg}"),
            Error::HbaForbiddenError(msg) => write!(f, "hba: {msg}"),
            Error::ScramClientError(msg) => write!(f, "SCRAM client error: {msg}"),
            Error::ScramServerError(msg) => write!(f, "SCRAM server error: {msg}"),
            Error::TlsError(msg) => write!(f, "TLS error: {msg}"),
            Error::PoolFull => write!(f, "connection pool is full"),
            Error::AllServersDown => write!(f, "no server available"),
            Error::ShuttingDown => write!(f, "shutting down"),
            Error::MaxMessageSize => write!(f, "max message size"),
        }
    }
}

impl std::error::Error for Error {}

/// Identifies a backend (user, database) pair in server-side error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: &str, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self { username, database } = self;
        write!(f, "{{ username: {username}, database: {database} }}")
    }
}

/// Identifies a client connection in log messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(
        application_name: &str,
        username: &str,
        database: &str,
        addr: &str,
    ) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            application_name,
            username,
            database,
        } = self;
        write!(
            f,
            "{{ {username}@{addr}/{database}?application_name={application_name} }}",
        )
    }
}
