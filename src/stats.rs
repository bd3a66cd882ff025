//! Process-wide counters, reported by SHOW STATUS on the admin console.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::client::SessionOutcome;

pub static TOTAL_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);
pub static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
pub static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(0);
pub static QUERY_TIME_MICROS: AtomicU64 = AtomicU64::new(0);
pub static CANCEL_COUNTER: AtomicU64 = AtomicU64::new(0);

pub static SESSION_SUCCESS: AtomicU64 = AtomicU64::new(0);
pub static SESSION_CLIENT_FAILURE: AtomicU64 = AtomicU64::new(0);
pub static SESSION_SERVER_FAILURE: AtomicU64 = AtomicU64::new(0);
pub static SESSION_SERVER_FATAL: AtomicU64 = AtomicU64::new(0);
pub static SESSION_FAILOVER: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn query() {
    QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn query_time(micros: u64) {
    QUERY_TIME_MICROS.fetch_add(micros, Ordering::Relaxed);
}

#[inline]
pub fn transaction() {
    TRANSACTION_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Count a finished worker the way the supervisor counted exit codes.
pub fn session_finished(outcome: SessionOutcome) {
    let counter = match outcome {
        SessionOutcome::Success => &SESSION_SUCCESS,
        SessionOutcome::ClientFailure => &SESSION_CLIENT_FAILURE,
        SessionOutcome::ServerFailure => &SESSION_SERVER_FAILURE,
        SessionOutcome::ServerFatal => &SESSION_SERVER_FATAL,
        SessionOutcome::Failover => &SESSION_FAILOVER,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Rows for SHOW STATUS.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    vec![
        ("total_connections", TOTAL_CONNECTION_COUNTER.load(Ordering::Relaxed)),
        ("queries", QUERY_COUNTER.load(Ordering::Relaxed)),
        ("transactions", TRANSACTION_COUNTER.load(Ordering::Relaxed)),
        ("query_time_micros", QUERY_TIME_MICROS.load(Ordering::Relaxed)),
        ("cancel_requests", CANCEL_COUNTER.load(Ordering::Relaxed)),
        ("sessions_success", SESSION_SUCCESS.load(Ordering::Relaxed)),
        ("sessions_client_failure", SESSION_CLIENT_FAILURE.load(Ordering::Relaxed)),
        ("sessions_server_failure", SESSION_SERVER_FAILURE.load(Ordering::Relaxed)),
        ("sessions_server_fatal", SESSION_SERVER_FATAL.load(Ordering::Relaxed)),
        ("sessions_failover", SESSION_FAILOVER.load(Ordering::Relaxed)),
    ]
}
