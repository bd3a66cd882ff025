/// Handle clients by pretending to be a PostgreSQL server.
use std::net::IpAddr;

use tokio::io::BufReader;

use crate::client::registry;

/// How a client session ended. The supervisor counts these; they are the
/// single-process descendant of the worker exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client disconnected cleanly.
    Success,
    /// The client socket failed mid-stream.
    ClientFailure,
    /// The server socket failed mid-stream.
    ServerFailure,
    /// The backend reported FATAL or PANIC.
    ServerFatal,
    /// The primary went away and failover ran.
    Failover,
}

/// The client state. One of these is created per client connection.
pub struct Client<S, T> {
    /// The reads are buffered (8K by default).
    pub(crate) read: BufReader<S>,

    /// Writes go straight out; the pipelines batch what needs batching.
    pub(crate) write: T,

    /// Peer address; None for Unix socket clients.
    pub(crate) ip: Option<IpAddr>,
    pub(crate) addr: String,

    /// Identifies the session in the registry and marks owned slots.
    pub(crate) id: i64,

    pub(crate) username: String,
    pub(crate) database: String,
    pub(crate) appname: String,

    /// Clients want to talk to the admin database.
    pub(crate) admin: bool,
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    #[inline(always)]
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    #[inline(always)]
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl<S, T> Drop for Client<S, T> {
    fn drop(&mut self) {
        registry::unregister(self.id);
    }
}
