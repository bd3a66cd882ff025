// Constructors for the one-off protocol messages the pooler has to produce
// bit-exactly, plus the password hashing helpers shared by both sides of the
// authentication handshake.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::socket::write_all_flush;

/// Generate an md5 password challenge with a random salt.
pub async fn md5_challenge<S>(stream: &mut S) -> Result<[u8; 4], Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let salt: [u8; 4] = [
        rand::random(),
        rand::random(),
        rand::random(),
        rand::random(),
    ];

    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(12);
    res.put_i32(AUTHENTICATION_MD5_PASSWORD);
    res.put_slice(&salt[..]);

    match stream.write_all(&res).await {
        Ok(_) => Ok(salt),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write MD5 challenge to socket: {err}"
        ))),
    }
}

/// Generate a cleartext password challenge.
pub async fn plain_password_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(8);
    res.put_i32(AUTHENTICATION_CLEAR_PASSWORD);

    match stream.write_all(&res).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write cleartext password challenge to socket: {err}"
        ))),
    }
}

/// Generate a SCRAM-SHA-256 challenge.
pub async fn scram_start_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(4 + 4 + SCRAM_SHA_256.len() as i32 + 2);
    res.put_i32(SASL);
    res.put_slice(SCRAM_SHA_256.as_bytes());
    res.put_u8(0);
    res.put_u8(0);

    match stream.write_all(&res).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write SCRAM-SHA-256 challenge to socket: {err}"
        ))),
    }
}

/// Send a SASLContinue or SASLFinal server response.
pub async fn scram_server_response<S>(stream: &mut S, code: i32, data: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(4 + 4 + data.len() as i32);
    res.put_i32(code);
    res.put_slice(data.as_bytes());

    match stream.write_all(&res).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write SCRAM-SHA-256 server response to socket: {err}"
        ))),
    }
}

/// Read a PasswordMessage ('p') from the client.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = stream.read_u8().await.map_err(|err| {
        Error::SocketError(format!("Failed to read password message code: {err}"))
    })?;

    if code != b'p' {
        return Err(Error::ProtocolSyncError(format!(
            "Expected password message (p), received '{}' instead",
            code as char
        )));
    }

    let len = stream.read_i32().await.map_err(|err| {
        Error::SocketError(format!("Failed to read password message length: {err}"))
    })?;

    if !(4..=8192).contains(&len) {
        return Err(Error::ProtocolSyncError(format!(
            "Unreasonable password message length: {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut password).await.map_err(|err| {
        Error::SocketError(format!("Failed to read password message content: {err}"))
    })?;

    Ok(password)
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(query.len() + 6);
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Send the startup message to a backend.
pub async fn startup<S>(
    stream: &mut S,
    user: &str,
    database: &str,
    application_name: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::new();

    bytes.put_i32(PROTOCOL_VERSION_NUMBER);

    bytes.put(&b"user\0"[..]);
    bytes.put_slice(user.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"database\0"[..]);
    bytes.put_slice(database.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"application_name\0"[..]);
    bytes.put_slice(application_name.as_bytes());
    bytes.put_u8(0);
    bytes.put_u8(0);

    let len = bytes.len() as i32 + 4i32;

    let mut startup = BytesMut::with_capacity(len as usize);
    startup.put_i32(len);
    startup.put(bytes);

    match stream.write_all(&startup).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write startup message to server socket: {err}"
        ))),
    }
}

/// Send an SSLRequest to a backend.
pub async fn ssl_request<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::with_capacity(8);

    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);

    match stream.write_all(&bytes).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write SSL request to server socket: {err}"
        ))),
    }
}

/// Build the 16-byte CancelRequest frame.
pub fn cancel_request_message(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Parse the payload of a CancelRequest (after the magic number) back into
/// (process id, secret key).
pub fn parse_cancel_request(bytes: &mut BytesMut) -> (i32, i32) {
    let process_id = bytes.get_i32();
    let secret_key = bytes.get_i32();
    (process_id, secret_key)
}

/// Parse the params the client sends as a key/value format.
fn parse_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();

        // Null-terminated C-strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                break;
            }
            c = bytes.get_u8();
        }

        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ProtocolSyncError(format!(
            "Expected key-value pairs in startup message, but received {} parameters",
            buf.len()
        )));
    }

    let mut i = 0;
    while i < buf.len() {
        let name = buf[i].clone();
        let value = buf[i + 1].clone();
        let _ = result.insert(name, value);
        i += 2;
    }

    Ok(result)
}

/// Parse StartupMessage parameters, e.g. user, database, application_name.
pub fn parse_startup(bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let result = parse_params(bytes)?;

    // The user parameter is mandatory by the protocol spec.
    if !result.contains_key("user") {
        return Err(Error::ClientBadStartup);
    }

    Ok(result)
}

/// Create an md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass.
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());

    let output = md5.finalize_reset();

    // Second pass.
    md5_hash_second_pass(&(format!("{output:x}")), salt)
}

pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize())
        .chars()
        .map(|x| x as u8)
        .collect::<Vec<u8>>();
    password.push(0);

    password
}

/// AuthenticationOk.
pub fn auth_ok_message() -> BytesMut {
    let mut auth_ok = BytesMut::with_capacity(9);
    auth_ok.put_u8(b'R');
    auth_ok.put_i32(8);
    auth_ok.put_i32(AUTHENTICATION_SUCCESSFUL);
    auth_ok
}

/// BackendKeyData carrying the pid and secret for query cancellation.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut key_data = BytesMut::with_capacity(13);
    key_data.put_u8(b'K');
    key_data.put_i32(12);
    key_data.put_i32(process_id);
    key_data.put_i32(secret_key);
    key_data
}

/// ReadyForQuery with transaction state 'T' or 'I'.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(if in_transaction { b'T' } else { b'I' });
    bytes
}

/// Terminate ('X').
pub fn terminate_message() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// Build an ErrorResponse. The routine field ('R') is included only when the
/// caller supplies one; clients key retry behavior off it.
pub fn error_message(message: &str, code: &str, routine: Option<&str>) -> BytesMut {
    let mut error = BytesMut::new();
    // Error level.
    error.put_u8(b'S');
    error.put_slice(&b"FATAL\0"[..]);
    // Error level (non-translatable).
    error.put_u8(b'V');
    error.put_slice(&b"FATAL\0"[..]);

    // SQLSTATE.
    error.put_u8(b'C');
    error.put_slice(format!("{code}\0").as_bytes());

    // The short error message.
    error.put_u8(b'M');
    error.put_slice(format!("{message}\0").as_bytes());

    if let Some(routine) = routine {
        error.put_u8(b'R');
        error.put_slice(format!("{routine}\0").as_bytes());
    }

    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// ErrorResponse followed by ReadyForQuery, for clients that already passed
/// authentication.
pub async fn error_response<S>(stream: &mut S, message: &str, code: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut buf = error_message(message, code, None);
    buf.put(ready_for_query(false));
    write_all_flush(stream, &buf).await
}

/// ErrorResponse without ReadyForQuery. The connection is expected to close.
pub async fn error_response_terminal<S>(
    stream: &mut S,
    message: &str,
    code: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(message, code, None);
    write_all_flush(stream, &res).await
}

/// Bad password. Same message whether or not the user exists.
pub async fn wrong_password<S>(stream: &mut S, user: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(
        &format!("password authentication failed for user \"{user}\""),
        SQLSTATE_INVALID_PASSWORD,
        Some("auth_failed"),
    );
    write_all_flush(stream, &res).await
}

/// The pool has no capacity left for this client.
pub async fn pool_full_error<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message("connection pool is full", SQLSTATE_TOO_MANY_CONNECTIONS, None);
    write_all_flush(stream, &res).await
}

/// The primary went away; the client's retry logic should reconnect.
pub async fn server_failover_error<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(
        "server failover",
        SQLSTATE_TOO_MANY_CONNECTIONS,
        Some("auth_failed"),
    );
    write_all_flush(stream, &res).await
}

/// CommandComplete with the given tag.
pub fn command_complete(tag: &str) -> BytesMut {
    let mut res = BytesMut::with_capacity(tag.len() + 6);
    res.put_u8(b'C');
    res.put_i32(4 + tag.len() as i32 + 1);
    res.put_slice(tag.as_bytes());
    res.put_u8(0);
    res
}

/// RowDescription over text-typed columns, for the admin database.
pub fn row_description(columns: &[&str]) -> BytesMut {
    let mut fields = BytesMut::new();
    for column in columns {
        fields.put_slice(column.as_bytes());
        fields.put_u8(0);
        fields.put_i32(0); // table oid
        fields.put_i16(0); // attribute number
        fields.put_i32(25); // text
        fields.put_i16(-1); // typlen
        fields.put_i32(-1); // atttypmod
        fields.put_i16(0); // text format
    }

    let mut res = BytesMut::with_capacity(fields.len() + 7);
    res.put_u8(b'T');
    res.put_i32(4 + 2 + fields.len() as i32);
    res.put_i16(columns.len() as i16);
    res.put(fields);
    res
}

/// DataRow of text values.
pub fn data_row(values: &[String]) -> BytesMut {
    let mut cells = BytesMut::new();
    for value in values {
        cells.put_i32(value.len() as i32);
        cells.put_slice(value.as_bytes());
    }

    let mut res = BytesMut::with_capacity(cells.len() + 7);
    res.put_u8(b'D');
    res.put_i32(4 + 2 + cells.len() as i32);
    res.put_i16(values.len() as i16);
    res.put(cells);
    res
}

/// A parsed ErrorResponse payload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl PgErrorMsg {
    /// Parse the field list of an ErrorResponse payload (after kind and
    /// length). Unknown fields are skipped.
    pub fn parse(payload: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut msg = PgErrorMsg::default();

        for field in payload.split(|b| *b == 0) {
            if field.is_empty() {
                continue;
            }
            let value = String::from_utf8_lossy(&field[1..]).to_string();
            match field[0] {
                b'S' => msg.severity = value,
                b'C' => msg.code = value,
                b'M' => msg.message = value,
                _ => (),
            }
        }

        if msg.severity.is_empty() {
            return Err(Error::ServerError("error message is empty".into()));
        }

        Ok(msg)
    }

    /// FATAL and PANIC mean the backend is gone.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }
}
