// The three transports a backend connection can ride on.

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::errors::Error;
use crate::messages::{configure_tcp_socket, configure_unix_socket, ssl_request};

pin_project! {
    #[project = StreamInnerProj]
    pub enum StreamInner {
        TcpPlain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
        UnixSocket {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl std::fmt::Debug for StreamInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamInner::TcpPlain { .. } => f.write_str("tcp"),
            StreamInner::Tls { .. } => f.write_str("tls"),
            StreamInner::UnixSocket { .. } => f.write_str("unix"),
        }
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::TcpPlain { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TcpPlain { stream } => stream.poll_flush(cx),
            StreamInnerProj::Tls { stream } => stream.poll_flush(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TcpPlain { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Tls { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::TcpPlain { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl StreamInner {
    pub fn try_write(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::TcpPlain { stream } => stream.try_write(buf),
            // TLS records cannot be written synchronously; report no progress.
            StreamInner::Tls { .. } => Err(std::io::ErrorKind::WouldBlock.into()),
            StreamInner::UnixSocket { stream } => stream.try_write(buf),
        }
    }

    /// A cheap liveness probe. A readable socket with zero bytes means the
    /// peer closed; pending data on a supposedly-idle connection also makes
    /// the slot unusable.
    pub fn is_valid(&self) -> bool {
        let mut probe = [0u8; 1];
        let result = match self {
            StreamInner::TcpPlain { stream } => stream.try_read(&mut probe),
            StreamInner::Tls { stream } => {
                stream.get_ref().get_ref().get_ref().try_read(&mut probe)
            }
            StreamInner::UnixSocket { stream } => stream.try_read(&mut probe),
        };

        match result {
            Ok(_) => false,
            Err(err) => err.kind() == std::io::ErrorKind::WouldBlock,
        }
    }
}

/// Connect to a backend over a Unix socket in the given directory, named the
/// way the server names its sockets.
pub(crate) async fn create_unix_stream_inner(host: &str, port: u16) -> Result<StreamInner, Error> {
    let stream = match UnixStream::connect(&format!("{host}/.s.PGSQL.{port}")).await {
        Ok(s) => s,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Could not connect to server: {err}"
            )));
        }
    };

    configure_unix_socket(&stream);

    Ok(StreamInner::UnixSocket { stream })
}

/// Connect to a backend over TCP, upgrading to TLS when requested.
pub(crate) async fn create_tcp_stream_inner(
    host: &str,
    port: u16,
    tls: bool,
) -> Result<StreamInner, Error> {
    let mut stream = match TcpStream::connect(&format!("{host}:{port}")).await {
        Ok(stream) => stream,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Could not connect to server: {err}"
            )));
        }
    };

    configure_tcp_socket(&stream);

    if !tls {
        return Ok(StreamInner::TcpPlain { stream });
    }

    ssl_request(&mut stream).await?;

    let response = match stream.read_u8().await {
        Ok(response) => response as char,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read TLS response from server: {err}"
            )));
        }
    };

    match response {
        'S' => {
            // TODO: verify server certificates once a CA bundle option exists.
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|err| Error::TlsError(err.to_string()))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let stream = connector
                .connect(host, stream)
                .await
                .map_err(|err| Error::TlsError(err.to_string()))?;
            Ok(StreamInner::Tls { stream })
        }
        'N' => Err(Error::TlsError(
            "server does not support TLS".to_string(),
        )),
        m => Err(Error::SocketError(format!(
            "Received unexpected response '{m}' during TLS negotiation"
        ))),
    }
}
