//! Tests for constructed frames and the frame scanner.

use bytes::{Buf, BytesMut};

use super::protocol::*;
use super::scanner::{FrameEvent, FrameScanner};

#[test]
fn cancel_request_roundtrip() {
    let mut frame = cancel_request_message(12345, -98765);

    assert_eq!(frame.len(), 16);
    assert_eq!(frame.get_i32(), 16);
    assert_eq!(frame.get_i32(), super::constants::CANCEL_REQUEST_CODE);

    let (pid, secret) = parse_cancel_request(&mut frame);
    assert_eq!(pid, 12345);
    assert_eq!(secret, -98765);
}

#[test]
fn simple_query_layout() {
    // 'Q' + length + "SELECT 1;" + NUL is 15 bytes on the wire.
    let frame = simple_query("SELECT 1;");
    assert_eq!(frame.len(), 15);
    assert_eq!(frame[0], b'Q');
    assert_eq!(
        i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
        14
    );
    assert_eq!(&frame[5..], b"SELECT 1;\0");
}

#[test]
fn ready_for_query_states() {
    assert_eq!(&ready_for_query(false)[..], &[b'Z', 0, 0, 0, 5, b'I']);
    assert_eq!(&ready_for_query(true)[..], &[b'Z', 0, 0, 0, 5, b'T']);
}

#[test]
fn terminate_layout() {
    assert_eq!(&terminate_message()[..], &[b'X', 0, 0, 0, 4]);
}

#[test]
fn error_message_carries_sqlstate_and_routine() {
    let frame = error_message("connection pool is full", "53300", None);
    assert_eq!(frame[0], b'E');
    let payload = &frame[5..];
    assert!(payload.windows(7).any(|w| w == b"C53300\0"));
    assert!(payload
        .windows(24)
        .any(|w| w == b"Mconnection pool is full"));
    assert!(!payload.windows(2).any(|w| w[0] == b'R' && w[1] == b'a'));

    let frame = error_message("server failover", "53300", Some("auth_failed"));
    let payload = &frame[5..];
    assert!(payload.windows(13).any(|w| w == b"Rauth_failed\0"));
}

#[test]
fn error_message_parses_back() {
    let frame = error_message("bad password", "28P01", Some("auth_failed"));
    let msg = PgErrorMsg::parse(&frame[5..]).unwrap();
    assert_eq!(msg.severity, "FATAL");
    assert_eq!(msg.code, "28P01");
    assert_eq!(msg.message, "bad password");
    assert!(msg.is_fatal());
}

#[test]
fn md5_hash_is_prefixed_and_stable() {
    let salt = [1u8, 2, 3, 4];
    let a = md5_hash_password("alice", "hunter2", &salt);
    let b = md5_hash_password("alice", "hunter2", &salt);

    assert_eq!(a, b);
    assert!(a.starts_with(b"md5"));
    // "md5" + 32 hex digits + NUL.
    assert_eq!(a.len(), 36);
    assert_eq!(*a.last().unwrap(), 0);

    // Different salt, different hash.
    let c = md5_hash_password("alice", "hunter2", &[4, 3, 2, 1]);
    assert_ne!(a, c);
}

#[test]
fn md5_second_pass_agrees_with_full_hash() {
    use md5::{Digest, Md5};

    let salt = [9u8, 9, 9, 9];
    let mut md5 = Md5::new();
    md5.update(b"hunter2");
    md5.update(b"alice");
    let first = format!("{:x}", md5.finalize());

    assert_eq!(
        md5_hash_password("alice", "hunter2", &salt),
        md5_hash_second_pass(&first, &salt)
    );
}

#[test]
fn startup_params_require_user() {
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(b"database\0mydb\0");
    assert!(parse_startup(bytes).is_err());

    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(b"user\0alice\0database\0mydb\0\0");
    let params = parse_startup(bytes).unwrap();
    assert_eq!(params.get("user").unwrap(), "alice");
    assert_eq!(params.get("database").unwrap(), "mydb");
}

#[test]
fn row_description_and_data_row_agree() {
    let desc = row_description(&["name", "value"]);
    assert_eq!(desc[0], b'T');
    assert_eq!(i16::from_be_bytes([desc[5], desc[6]]), 2);

    let row = data_row(&["a".to_string(), "bb".to_string()]);
    assert_eq!(row[0], b'D');
    assert_eq!(i16::from_be_bytes([row[5], row[6]]), 2);
}

// Frame scanner -------------------------------------------------------------

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(payload);
    out
}

fn scan_all(scanner: &mut FrameScanner, chunks: &[&[u8]]) -> Vec<FrameEvent> {
    let mut events = Vec::new();
    for chunk in chunks {
        scanner.scan(chunk, &mut events);
    }
    events
}

#[test]
fn scanner_sees_coalesced_frames() {
    let mut buf = frame(b'C', b"SELECT 1\0");
    buf.extend_from_slice(&frame(b'Z', b"I"));

    let mut scanner = FrameScanner::new();
    let events = scan_all(&mut scanner, &[&buf]);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, b'C');
    assert_eq!(events[1].kind, b'Z');
    assert_eq!(events[1].peek_bytes(), b"I");
    assert!(scanner.at_boundary());
}

#[test]
fn scanner_carries_partial_frames() {
    let mut buf = frame(b'D', &[0u8; 300]);
    buf.extend_from_slice(&frame(b'Z', b"T"));

    // Feed it one byte at a time; every split point is exercised.
    let mut scanner = FrameScanner::new();
    let mut events = Vec::new();
    for byte in &buf {
        scanner.scan(std::slice::from_ref(byte), &mut events);
    }

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, b'D');
    assert_eq!(events[0].len, 304);
    assert_eq!(events[1].kind, b'Z');
    assert_eq!(events[1].peek_bytes(), b"T");
    assert!(scanner.at_boundary());
}

#[test]
fn scanner_peeks_across_chunk_boundary() {
    // ErrorResponse whose severity field straddles the chunk split.
    let payload = b"SFATAL\0C57P01\0\0";
    let buf = frame(b'E', payload);

    let mut scanner = FrameScanner::new();
    let events = scan_all(&mut scanner, &[&buf[..7], &buf[7..]]);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, b'E');
    assert_eq!(&events[0].peek_bytes()[1..6], b"FATAL");
    assert!(scanner.at_boundary());
}

#[test]
fn scanner_not_at_boundary_mid_frame() {
    let buf = frame(b'D', &[0u8; 64]);

    let mut scanner = FrameScanner::new();
    let mut events = Vec::new();
    scanner.scan(&buf[..20], &mut events);

    assert_eq!(events.len(), 1);
    assert!(!scanner.at_boundary());

    scanner.scan(&buf[20..], &mut events);
    assert!(scanner.at_boundary());
}

#[test]
fn scanner_handles_empty_payload_frames() {
    // ParseComplete has no payload at all.
    let mut buf = frame(b'1', b"");
    buf.extend_from_slice(&frame(b'2', b""));

    let mut scanner = FrameScanner::new();
    let events = scan_all(&mut scanner, &[&buf]);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, b'1');
    assert_eq!(events[0].peek_len, 0);
    assert_eq!(events[1].kind, b'2');
}
