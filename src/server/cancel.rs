// CancelRequest delivery: a one-shot connection to the backend that owns the
// (pid, secret) pair, outside the pool.

use log::warn;

use crate::errors::Error;
use crate::messages::{cancel_request_message, write_all_flush};
use crate::servers;

use super::stream::{create_tcp_stream_inner, create_unix_stream_inner};

pub(crate) async fn cancel(server: usize, process_id: i32, secret_key: i32) -> Result<(), Error> {
    let desc = servers::get_server(server).ok_or(Error::AllServersDown)?;

    let mut stream = if desc.host.starts_with('/') {
        create_unix_stream_inner(&desc.host, desc.port).await?
    } else {
        create_tcp_stream_inner(&desc.host, desc.port, false).await?
    };

    warn!(
        "Sending CancelRequest to [{process_id}] {}:{}",
        desc.host, desc.port
    );

    let bytes = cancel_request_message(process_id, secret_key);
    write_all_flush(&mut stream, &bytes).await
}
