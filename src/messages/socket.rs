// Socket-level helpers: frame reads with close-as-None, looping writes, and
// TCP/Unix socket tuning.

use bytes::{BufMut, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::config::get_config;
use crate::errors::Error;
use crate::messages::MAX_MESSAGE_SIZE;

/// Read a message header: the kind byte and the length. Returns `None` when
/// the peer closed the connection cleanly before a new frame started.
pub async fn read_message_header<S>(stream: &mut S) -> Result<Option<(u8, i32)>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read message code: {err}"
            )))
        }
    };

    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to read message length: {err}")))?;

    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "Unreasonable message length: {len}"
        )));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    Ok(Some((code, len)))
}

/// Read the rest of a message given its header, returning the whole frame
/// (kind byte and length included) so it can be forwarded as-is.
pub async fn read_message_data<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut message = BytesMut::with_capacity(len as usize + 1);
    message.put_u8(code);
    message.put_i32(len);
    message.resize(len as usize + 1, 0);

    stream
        .read_exact(&mut message[5..])
        .await
        .map_err(|err| Error::SocketError(format!("Failed to read message payload: {err}")))?;

    Ok(message)
}

/// Read one complete frame. `None` means the peer closed the connection at a
/// frame boundary, which the pipelines treat as an orderly disconnect.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<BytesMut>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, len) = match read_message_header(stream).await? {
        Some(header) => header,
        None => return Ok(None),
    };

    Ok(Some(read_message_data(stream, code, len).await?))
}

/// Write all data in the buffer to the socket, looping on short writes.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(&buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write to socket: {err}"
        ))),
    }
}

/// Write all data and flush. The one to use on buffered streams.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Failed to flush socket: {err}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write to socket: {err}"
        ))),
    }
}

/// Configure a TCP socket the way the pooler likes it: no Nagle, keepalives
/// that notice a dead peer within seconds, linger 0.
pub fn configure_tcp_socket(stream: &TcpStream) {
    let config = get_config();
    let sock_ref = SockRef::from(stream);

    let _ = sock_ref.set_tcp_nodelay(config.general.tcp_no_delay);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(
            config.general.tcp_keepalives_idle,
        ))
        .with_interval(std::time::Duration::from_secs(
            config.general.tcp_keepalives_interval,
        ))
        .with_retries(config.general.tcp_keepalives_count);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);

    let _ = sock_ref.set_linger(Some(std::time::Duration::from_secs(
        config.general.tcp_so_linger,
    )));
}

/// Unix sockets only get a bigger buffer.
pub fn configure_unix_socket(stream: &UnixStream) {
    let config = get_config();
    let sock_ref = SockRef::from(stream);

    let _ = sock_ref.set_recv_buffer_size(config.general.unix_socket_buffer_size);
    let _ = sock_ref.set_send_buffer_size(config.general.unix_socket_buffer_size);
}

/// Read helpers over `BytesMut` for NUL-terminated protocol strings.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<String, Error> {
        match self.iter().position(|b| *b == 0) {
            Some(idx) => {
                let string = String::from_utf8_lossy(&self[..idx]).to_string();
                let _ = self.split_to(idx + 1);
                Ok(string)
            }
            None => Err(Error::ProtocolSyncError(
                "string is not nul-terminated".into(),
            )),
        }
    }
}
