// A cached backend connection: the socket, the captured startup trace that
// gets replayed to reused clients, and the key data needed to cancel queries
// running on it.

use bytes::{BufMut, BytesMut};
use log::{error, info, warn};
use tokio::io::{AsyncReadExt, BufStream};

use crate::auth::scram_client::ScramSha256;
use crate::errors::{Error, ServerIdentifier};
use crate::pool::SlotAuth;
use crate::messages::constants::*;
use crate::messages::{
    md5_hash_password, read_message_data, read_message_header, simple_query, startup,
    terminate_message, write_all_flush, PgErrorMsg,
};
use crate::servers;

use super::stream::{create_tcp_stream_inner, create_unix_stream_inner, StreamInner};

/// The captured handshake keeps at most this many authentication frames.
pub const NUMBER_OF_SECURITY_MESSAGES: usize = 5;

pub struct ServerConn {
    /// Index into the server descriptor table.
    server: usize,

    stream: BufStream<StreamInner>,

    /// The 'R' frames of the authentication exchange, captured verbatim.
    auth_frames: Vec<BytesMut>,

    /// The backend's final ParameterStatus/BackendKeyData/ReadyForQuery
    /// sequence, captured verbatim for replay to a reused client.
    startup_trace: BytesMut,

    /// BackendKeyData, for CancelRequest support.
    backend_pid: i32,
    backend_secret: i32,

    /// The credential kind the backend demanded during the handshake.
    auth_kind: SlotAuth,

    bad: bool,

    connected_at: chrono::naive::NaiveDateTime,

    identifier: ServerIdentifier,
}

impl std::fmt::Display for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}]-{}@server#{}",
            self.backend_pid, self.identifier.username, self.server
        )
    }
}

impl ServerConn {
    /// Pretend to be a Postgres client: connect to the given backend, run the
    /// authentication handshake with the supplied credentials, and capture
    /// the startup exchange. Returns a connection in ready-for-query state.
    pub async fn startup(
        server: usize,
        username: &str,
        password: Option<&str>,
        database: &str,
        application_name: &str,
    ) -> Result<ServerConn, Error> {
        let desc = servers::get_server(server).ok_or(Error::AllServersDown)?;
        let identifier = ServerIdentifier::new(username, database);

        let mut stream = if desc.host.starts_with('/') {
            create_unix_stream_inner(&desc.host, desc.port).await?
        } else {
            create_tcp_stream_inner(&desc.host, desc.port, desc.tls).await?
        };

        startup(&mut stream, username, database, application_name).await?;

        let mut auth_frames: Vec<BytesMut> = Vec::new();
        let mut startup_trace = BytesMut::new();
        let mut backend_pid: i32 = 0;
        let mut backend_secret: i32 = 0;
        let mut scram: Option<ScramSha256> = None;
        let mut auth_kind = SlotAuth::Trust;

        loop {
            let (code, len) = match read_message_header(&mut stream).await? {
                Some(header) => header,
                None => {
                    return Err(Error::ServerStartupError(
                        "connection closed".into(),
                        identifier,
                    ));
                }
            };

            let frame = read_message_data(&mut stream, code, len).await?;
            let payload = &frame[5..];

            match code as char {
                // Authentication request.
                'R' => {
                    if payload.len() < 4 {
                        return Err(Error::ServerStartupError(
                            "authentication code".into(),
                            identifier,
                        ));
                    }
                    let auth_code =
                        i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

                    if auth_frames.len() < NUMBER_OF_SECURITY_MESSAGES {
                        auth_frames.push(frame.clone());
                    }

                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),

                        AUTHENTICATION_CLEAR_PASSWORD => {
                            auth_kind = SlotAuth::Password;
                            let password = password.ok_or_else(|| {
                                Error::ServerAuthError(
                                    "server wants a cleartext password, but none is configured"
                                        .into(),
                                    identifier.clone(),
                                )
                            })?;

                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(4 + password.len() as i32 + 1);
                            response.put_slice(password.as_bytes());
                            response.put_u8(0);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        AUTHENTICATION_MD5_PASSWORD => {
                            auth_kind = SlotAuth::Md5;
                            let password = password.ok_or_else(|| {
                                Error::ServerAuthError(
                                    "server wants md5 authentication, but no password is configured"
                                        .into(),
                                    identifier.clone(),
                                )
                            })?;
                            if payload.len() < 8 {
                                return Err(Error::ServerStartupError(
                                    "md5 salt".into(),
                                    identifier,
                                ));
                            }
                            let salt = &payload[4..8];

                            let hash = md5_hash_password(username, password, salt);
                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(4 + hash.len() as i32);
                            response.put_slice(&hash);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL => {
                            auth_kind = SlotAuth::Scram;
                            let password = password.ok_or_else(|| {
                                Error::ServerAuthError(
                                    "server wants SASL authentication, but no password is configured"
                                        .into(),
                                    identifier.clone(),
                                )
                            })?;

                            let mechanisms = String::from_utf8_lossy(&payload[4..]);
                            if !mechanisms.contains(SCRAM_SHA_256) {
                                return Err(Error::ServerAuthError(
                                    format!("unsupported SASL mechanisms: {mechanisms}"),
                                    identifier.clone(),
                                ));
                            }

                            let mut exchange = ScramSha256::new(password);
                            let sasl_response = exchange.message();
                            scram = Some(exchange);

                            // SASLInitialResponse.
                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(
                                4 + SCRAM_SHA_256.len() as i32
                                    + 1
                                    + 4
                                    + sasl_response.len() as i32,
                            );
                            response.put_slice(format!("{SCRAM_SHA_256}\0").as_bytes());
                            response.put_i32(sasl_response.len() as i32);
                            response.put(sasl_response);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL_CONTINUE => {
                            let exchange = scram.as_mut().ok_or_else(|| {
                                Error::ServerAuthError(
                                    "SASL continuation without a SASL exchange".into(),
                                    identifier.clone(),
                                )
                            })?;

                            let sasl_response =
                                exchange.update(&BytesMut::from(&payload[4..]))?;

                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(4 + sasl_response.len() as i32);
                            response.put(sasl_response);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL_FINAL => {
                            let exchange = scram.as_mut().ok_or_else(|| {
                                Error::ServerAuthError(
                                    "SASL final without a SASL exchange".into(),
                                    identifier.clone(),
                                )
                            })?;
                            exchange.finish(&BytesMut::from(&payload[4..]))?;
                        }

                        _ => {
                            error!(
                                "Authentication code {auth_code} from server is not supported ({identifier})"
                            );
                            return Err(Error::ServerAuthError(
                                "authentication on the server is not supported".into(),
                                identifier.clone(),
                            ));
                        }
                    }
                }

                // ErrorResponse.
                'E' => {
                    return match PgErrorMsg::parse(payload) {
                        Ok(msg) => {
                            error!(
                                "Server error during startup: {} {}: {}",
                                msg.severity, msg.code, msg.message
                            );
                            Err(Error::ServerStartupError(msg.message, identifier))
                        }
                        Err(_) => Err(Error::ServerStartupError(
                            "unreadable error response".into(),
                            identifier,
                        )),
                    };
                }

                // NoticeResponse; log and move on.
                'N' => {
                    if let Ok(msg) = PgErrorMsg::parse(payload) {
                        info!(
                            "Server startup notice (severity: {} code: {} message: {})",
                            msg.severity, msg.code, msg.message
                        );
                    }
                }

                // ParameterStatus.
                'S' => {
                    startup_trace.put_slice(&frame);
                }

                // BackendKeyData.
                'K' => {
                    if payload.len() < 8 {
                        return Err(Error::ServerStartupError(
                            "backend key data".into(),
                            identifier,
                        ));
                    }
                    backend_pid =
                        i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    backend_secret =
                        i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    startup_trace.put_slice(&frame);
                }

                // ReadyForQuery ends the startup exchange.
                'Z' => {
                    startup_trace.put_slice(&frame);

                    servers::mark_online(server);

                    return Ok(ServerConn {
                        server,
                        stream: BufStream::new(stream),
                        auth_frames,
                        startup_trace,
                        backend_pid,
                        backend_secret,
                        auth_kind,
                        bad: false,
                        connected_at: chrono::offset::Utc::now().naive_utc(),
                        identifier,
                    });
                }

                _ => {
                    return Err(Error::ProtocolSyncError(format!(
                        "Unexpected message code '{}' during server startup",
                        code as char
                    )));
                }
            }
        }
    }

    #[inline(always)]
    pub fn server_index(&self) -> usize {
        self.server
    }

    #[inline(always)]
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    #[inline(always)]
    pub fn backend_secret(&self) -> i32 {
        self.backend_secret
    }

    #[inline(always)]
    pub fn auth_kind(&self) -> SlotAuth {
        self.auth_kind
    }

    /// The captured ParameterStatus/BackendKeyData/ReadyForQuery sequence.
    pub fn startup_trace(&self) -> &BytesMut {
        &self.startup_trace
    }

    /// The captured authentication frames.
    pub fn auth_frames(&self) -> &[BytesMut] {
        &self.auth_frames
    }

    pub fn mark_bad(&mut self, reason: &str) {
        error!("Server {self} marked bad, reason: {reason}");
        self.bad = true;
    }

    #[inline(always)]
    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn stream_mut(&mut self) -> &mut BufStream<StreamInner> {
        &mut self.stream
    }

    /// Poll the socket for errors without consuming data.
    pub fn socket_is_valid(&self) -> bool {
        self.stream.get_ref().is_valid()
    }

    /// Send already-laid-out frames and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match write_all_flush(&mut self.stream, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_bad("write to server failed");
                Err(err)
            }
        }
    }

    /// Read one frame. `None` means the backend closed the connection.
    pub async fn recv_frame(&mut self) -> Result<Option<BytesMut>, Error> {
        match crate::messages::read_message(&mut self.stream).await {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.mark_bad("read from server failed");
                Err(err)
            }
        }
    }

    /// Read whatever the backend has into `buf`. 0 means closed.
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        self.stream
            .read_buf(buf)
            .await
            .map_err(|err| Error::SocketError(format!("read from server failed: {err}")))
    }

    /// Drain frames until ReadyForQuery. Used after housekeeping queries
    /// whose results nobody wants.
    async fn consume_until_ready(&mut self) -> Result<(), Error> {
        loop {
            match self.recv_frame().await? {
                Some(frame) => {
                    if frame[0] == b'E' {
                        if let Ok(msg) = PgErrorMsg::parse(&frame[5..]) {
                            warn!("Server {self} error while draining: {}", msg.message);
                        }
                    }
                    if frame[0] == b'Z' {
                        return Ok(());
                    }
                }
                None => {
                    self.mark_bad("closed while draining");
                    return Err(Error::ServerError(
                        "connection closed while draining".into(),
                    ));
                }
            }
        }
    }

    /// Execute a query via the simple protocol, discarding its results.
    pub async fn small_simple_query(&mut self, query: &str) -> Result<(), Error> {
        let query = simple_query(query);
        self.send(&query).await?;
        self.consume_until_ready().await
    }

    /// The validation round-trip: SELECT 1, consumed up to its first reply.
    pub async fn validate(&mut self) -> Result<(), Error> {
        self.small_simple_query("SELECT 1;").await
    }

    pub async fn discard_all(&mut self) -> Result<(), Error> {
        self.small_simple_query("DISCARD ALL;").await
    }

    pub async fn deallocate_all(&mut self) -> Result<(), Error> {
        self.small_simple_query("DEALLOCATE ALL;").await
    }

    pub async fn rollback(&mut self) -> Result<(), Error> {
        self.small_simple_query("ROLLBACK;").await
    }

    /// Best-effort Terminate. The socket may not be writable; that's fine.
    pub fn terminate(&mut self) {
        let bytes = terminate_message();
        match self.stream.get_ref().try_write(&bytes) {
            Ok(5) => (),
            _ => warn!("Dirty server {self} shutdown"),
        }
        self.bad = true;
    }
}

impl Drop for ServerConn {
    /// Try a clean shutdown. Best effort because the socket is non-blocking
    /// and may not be ready for a write.
    fn drop(&mut self) {
        if !self.bad {
            let bytes = terminate_message();
            match self.stream.get_ref().try_write(&bytes) {
                Ok(5) => (),
                Err(err) => warn!("Dirty server {self} shutdown: {err}"),
                _ => warn!("Dirty server {self} shutdown"),
            };
        }

        let now = chrono::offset::Utc::now().naive_utc();
        let duration = now - self.connected_at;

        let message = if self.bad {
            "Server connection terminated"
        } else {
            "Server connection closed"
        };

        info!(
            "{} {}, lifetime: {}",
            message,
            self,
            crate::format_duration(&duration)
        );
    }
}
