use bytes::{Buf, BufMut, BytesMut};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use tokio::io::split;
use tokio::net::{TcpStream, UnixStream};

use crate::client::core::SessionOutcome;
use crate::client::Client;
use crate::config::{get_config, Pipeline};
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{parse_cancel_request, write_all_flush};
use crate::pool::get_pool;
use crate::server::cancel;

/// Type of connection received from client.
enum ClientConnectionType {
    Startup,
    Tls,
    CancelQuery,
}

/// Handle the first message the client sends. GSS encryption requests are
/// declined in place; everything else is dispatched to the caller.
async fn get_startup<S>(stream: &mut S) -> Result<(ClientConnectionType, BytesMut), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    use tokio::io::AsyncReadExt;

    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };

        // Minimum is 8 bytes (length + code); reject absurd lengths outright.
        if !(8..=8 * 1024).contains(&len) {
            return Err(Error::ClientBadStartup);
        }

        let mut startup = vec![0u8; (len - 4) as usize];
        match stream.read_exact(&mut startup).await {
            Ok(_) => (),
            Err(_) => return Err(Error::ClientBadStartup),
        };

        let mut bytes = BytesMut::from(&startup[..]);
        let code = bytes.get_i32();

        match code {
            SSL_REQUEST_CODE => return Ok((ClientConnectionType::Tls, bytes)),
            PROTOCOL_VERSION_NUMBER => return Ok((ClientConnectionType::Startup, bytes)),
            CANCEL_REQUEST_CODE => return Ok((ClientConnectionType::CancelQuery, bytes)),

            GSSENC_REQUEST_CODE => {
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all_flush(stream, &no).await?;
                // The client retries with SSL or plain startup.
            }

            _ => {
                return Err(Error::ProtocolSyncError(format!(
                    "Unexpected startup code: {code}"
                )))
            }
        }
    }
}

/// A CancelRequest: match the (pid, secret) pair against live slots and
/// forward the frame to the backend that owns them.
async fn handle_cancel(mut bytes: BytesMut) -> Result<SessionOutcome, Error> {
    let (process_id, secret_key) = parse_cancel_request(&mut bytes);

    crate::stats::CANCEL_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let Some(pool) = get_pool() else {
        return Ok(SessionOutcome::Success);
    };

    match pool.find_cancel_target(process_id, secret_key) {
        Some(server) => {
            info!("Cancel request for backend pid {process_id}");
            cancel::cancel(server, process_id, secret_key).await?;
        }
        // The client doesn't know or got the wrong pair; close silently.
        None => debug!("Cancel request for unknown backend pid {process_id}"),
    }

    Ok(SessionOutcome::Success)
}

/// Run a fully negotiated stream: startup, authentication, pipeline.
async fn run<S>(
    stream: S,
    ip: Option<std::net::IpAddr>,
    addr: String,
    client_id: i64,
    bytes: BytesMut,
    tls_used: bool,
) -> Result<SessionOutcome, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let (read, write) = split(stream);

    let (mut client, lease) =
        Client::startup(read, write, ip, addr, client_id, bytes, tls_used).await?;

    if client.is_admin() {
        client.handle_admin().await?;
        return Ok(SessionOutcome::Success);
    }

    match config.general.pipeline {
        Pipeline::Session => {
            let lease = lease.ok_or_else(|| {
                Error::ServerError("session startup yielded no slot".into())
            })?;
            Ok(client.run_session(lease).await)
        }
        Pipeline::Transaction => {
            // The startup slot proved the backend login; park it again and
            // acquire per transaction from here on.
            if let Some(lease) = lease {
                lease.release(true).await;
            }
            Ok(client.run_transaction().await)
        }
    }
}

/// Client entrypoint for TCP connections.
pub async fn client_entrypoint(
    mut stream: TcpStream,
    addr: SocketAddr,
    client_id: i64,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
) -> Result<SessionOutcome, Error> {
    let ip = Some(addr.ip());
    let addr = addr.to_string();

    match get_startup(&mut stream).await? {
        (ClientConnectionType::Tls, _) => {
            if let Some(tls_acceptor) = tls_acceptor {
                // TLS it is.
                let mut yes = BytesMut::new();
                yes.put_u8(b'S');
                write_all_flush(&mut stream, &yes).await?;

                let mut stream = match tls_acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("TLS negotiation failed: {err:?}");
                        return Err(Error::TlsError(err.to_string()));
                    }
                };

                match get_startup(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        run(stream, ip, addr, client_id, bytes, true).await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes).await,
                    (ClientConnectionType::Tls, _) => Err(Error::ProtocolSyncError(
                        "SSL requested twice".into(),
                    )),
                }
            } else {
                // No TLS material; one 'N' retry, then the client either
                // downgrades or goes away.
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all_flush(&mut stream, &no).await?;

                match get_startup(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        run(stream, ip, addr, client_id, bytes, false).await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes).await,
                    (ClientConnectionType::Tls, _) => {
                        warn!("Client {addr} insisted on SSL without TLS configured");
                        Err(Error::ProtocolSyncError("SSL is not configured".into()))
                    }
                }
            }
        }

        (ClientConnectionType::Startup, bytes) => {
            run(stream, ip, addr, client_id, bytes, false).await
        }

        (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes).await,
    }
}

/// Client entrypoint for Unix socket connections. No TLS here.
pub async fn client_entrypoint_unix(
    mut stream: UnixStream,
    client_id: i64,
) -> Result<SessionOutcome, Error> {
    let addr = format!("unix:{client_id}");

    match get_startup(&mut stream).await? {
        (ClientConnectionType::Tls, _) => {
            let mut no = BytesMut::new();
            no.put_u8(b'N');
            write_all_flush(&mut stream, &no).await?;

            match get_startup(&mut stream).await? {
                (ClientConnectionType::Startup, bytes) => {
                    run(stream, None, addr, client_id, bytes, false).await
                }
                (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes).await,
                (ClientConnectionType::Tls, _) => {
                    Err(Error::ProtocolSyncError("SSL on a unix socket".into()))
                }
            }
        }
        (ClientConnectionType::Startup, bytes) => {
            run(stream, None, addr, client_id, bytes, false).await
        }
        (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes).await,
    }
}
