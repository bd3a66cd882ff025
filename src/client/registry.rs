//! Live client sessions, keyed by client id. The registry is how the rest of
//! the process reaches into a session from outside: flush ALL force-drops the
//! owner of a slot, and the disconnect-client sweep cancels and drops clients
//! that have been idle too long.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::info;
use once_cell::sync::Lazy;
use tokio::task::AbortHandle;

pub struct ClientHandle {
    pub addr: String,
    pub username: String,
    pub database: String,
    pub connected_at: SystemTime,
    /// Unix seconds of the last frame seen from this client.
    last_activity: AtomicU64,
    /// True while a query/transaction is in flight.
    active: AtomicBool,
    abort: AbortHandle,
}

static REGISTRY: Lazy<DashMap<i64, ClientHandle>> = Lazy::new(DashMap::new);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn register(id: i64, addr: String, username: String, database: String, abort: AbortHandle) {
    REGISTRY.insert(
        id,
        ClientHandle {
            addr,
            username,
            database,
            connected_at: SystemTime::now(),
            last_activity: AtomicU64::new(unix_now()),
            active: AtomicBool::new(false),
            abort,
        },
    );
}

pub fn unregister(id: i64) {
    REGISTRY.remove(&id);
}

/// Record who the client turned out to be once authentication finished.
pub fn set_identity(id: i64, username: &str, database: &str) {
    if let Some(mut handle) = REGISTRY.get_mut(&id) {
        handle.username = username.to_string();
        handle.database = database.to_string();
    }
}

/// Stamp activity on every client frame.
pub fn touch(id: i64) {
    if let Some(handle) = REGISTRY.get(&id) {
        handle.last_activity.store(unix_now(), Ordering::Relaxed);
    }
}

pub fn set_active(id: i64, active: bool) {
    if let Some(handle) = REGISTRY.get(&id) {
        handle.active.store(active, Ordering::Relaxed);
    }
}

/// Force-drop a client session. The session's slot lease cleans up the slot.
pub fn disconnect(id: i64) {
    if let Some((_, handle)) = REGISTRY.remove(&id) {
        info!("Disconnecting client {} ({})", id, handle.addr);
        handle.abort.abort();
    }
}

/// Clients idle longer than `threshold` seconds. With `force`, clients that
/// are mid-query are fair game too.
pub fn idle_clients(threshold: u64, force: bool) -> Vec<i64> {
    let now = unix_now();
    REGISTRY
        .iter()
        .filter(|entry| {
            let idle = now.saturating_sub(entry.last_activity.load(Ordering::Relaxed));
            idle > threshold && (force || !entry.active.load(Ordering::Relaxed))
        })
        .map(|entry| *entry.key())
        .collect()
}

pub fn count() -> usize {
    REGISTRY.len()
}

/// Snapshot for SHOW CLIENTS.
pub fn snapshot() -> Vec<(i64, String, String, String, u64)> {
    let now = unix_now();
    REGISTRY
        .iter()
        .map(|entry| {
            (
                *entry.key(),
                entry.addr.clone(),
                entry.username.clone(),
                entry.database.clone(),
                now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)),
            )
        })
        .collect()
}
