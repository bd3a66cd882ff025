//! Wire protocol constants.

/// Protocol version 3.0, encoded as major << 16 | minor.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

/// Magic number of an SSLRequest message.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic number of a CancelRequest message.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Magic number of a GSSENCRequest message. We reject these.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// Authentication request kinds ('R' messages).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const AUTHENTICATION_MD5_PASSWORD: i32 = 5;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_ITERATIONS: u32 = 4096;

pub const MD5_PASSWORD_PREFIX: &str = "md5";
pub const SCRAM_PASSWORD_PREFIX: &str = "SCRAM-SHA-256$";

pub const MESSAGE_TERMINATOR: u8 = 0;

// SQLSTATE codes used in client-visible failures.
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";
pub const SQLSTATE_CANNOT_CONNECT_NOW: &str = "58006";
