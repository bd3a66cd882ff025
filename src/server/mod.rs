//! Backend PostgreSQL connections: the pooler impersonating a client.

pub(crate) mod cancel;
pub(crate) mod stream;

mod backend;

pub use backend::ServerConn;
pub use stream::StreamInner;
