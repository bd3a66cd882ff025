// Helper functions to construct and move protocol messages between sockets.

pub mod constants;
pub mod protocol;
pub mod scanner;
pub mod socket;

pub use constants::*;
pub use protocol::{
    auth_ok_message, backend_key_data, cancel_request_message, command_complete, data_row,
    error_message, error_response, error_response_terminal, md5_challenge, md5_hash_password,
    md5_hash_second_pass, parse_cancel_request, parse_startup, plain_password_challenge,
    pool_full_error, read_password, ready_for_query, row_description, scram_server_response,
    scram_start_challenge, server_failover_error, simple_query, ssl_request, startup,
    terminate_message, wrong_password, PgErrorMsg,
};
pub use scanner::{FrameEvent, FrameScanner};
pub use socket::{
    configure_tcp_socket, configure_unix_socket, read_message, read_message_data,
    read_message_header, write_all, write_all_flush, BytesMutReader,
};

/// Upper bound on a single protocol frame accepted from either side.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

#[cfg(test)]
mod protocol_tests;
