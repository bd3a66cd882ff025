//! The periodic sweeps that keep the pool coherent: idle timeout, max
//! connection age, validation, flush, and prefill. Sweeps scan from the high
//! end of the table so hot slots survive, CAS FREE into a transient state
//! while they inspect a slot, and back off if the CAS fails because a worker
//! just took it.

use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::config::get_config;
use crate::pool::{get_pool, PoolState, SlotState};
use crate::servers::{self, ServerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Idle,
    Gracefully,
    All,
}

impl std::fmt::Display for FlushMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushMode::Idle => f.write_str("idle"),
            FlushMode::Gracefully => f.write_str("gracefully"),
            FlushMode::All => f.write_str("all"),
        }
    }
}

fn idle_for(timestamp: Option<SystemTime>) -> Duration {
    timestamp
        .and_then(|t| t.elapsed().ok())
        .unwrap_or_default()
}

impl PoolState {
    /// Kill FREE slots that have been unused longer than `idle_timeout`.
    pub fn idle_timeout_sweep(&self) {
        let config = get_config();
        let timeout = Duration::from_secs(config.general.idle_timeout);
        let mut prefill = false;

        debug!("idle_timeout_sweep");

        for i in (0..self.max_connections()).rev() {
            if !self.cas_state(i, SlotState::Free, SlotState::IdleCheck) {
                continue;
            }

            let (idle, tx_mode) = {
                let meta = self.slot(i).meta.lock();
                (idle_for(meta.timestamp), meta.tx_mode)
            };

            if idle >= timeout && !tx_mode {
                self.kill_connection_from_sweep(i);
                prefill = true;
            } else if !self.cas_state(i, SlotState::IdleCheck, SlotState::Free) {
                self.kill_connection_from_sweep(i);
                prefill = true;
            }
        }

        if prefill {
            prefill_if_can(false);
        }

        self.pool_status();
    }

    /// Kill FREE slots older than `max_connection_age`, measured from first
    /// use.
    pub fn max_connection_age_sweep(&self) {
        let config = get_config();
        let limit = Duration::from_secs(config.general.max_connection_age);
        let mut prefill = false;

        debug!("max_connection_age_sweep");

        for i in (0..self.max_connections()).rev() {
            if !self.cas_state(i, SlotState::Free, SlotState::MaxConnectionAge) {
                continue;
            }

            let (age, tx_mode) = {
                let meta = self.slot(i).meta.lock();
                (idle_for(meta.start_time), meta.tx_mode)
            };

            if age >= limit && !tx_mode {
                self.kill_connection_from_sweep(i);
                prefill = true;
            } else if !self.cas_state(i, SlotState::MaxConnectionAge, SlotState::Free) {
                self.kill_connection_from_sweep(i);
                prefill = true;
            }
        }

        if prefill {
            prefill_if_can(false);
        }

        self.pool_status();
    }

    /// Probe FREE slots: socket error, idle time, age, and a SELECT 1 round
    /// trip. Anything off kills the slot.
    pub async fn validation_sweep(&self) {
        let config = get_config();

        debug!("validation_sweep");

        for i in (0..self.max_connections()).rev() {
            if !self.cas_state(i, SlotState::Free, SlotState::Validation) {
                continue;
            }

            let mut kill = false;

            let mut conn = self.slot(i).conn.lock().take();
            match conn {
                Some(ref conn) if conn.socket_is_valid() => (),
                _ => kill = true,
            }

            if !kill && config.general.idle_timeout > 0 {
                let idle = idle_for(self.slot(i).meta.lock().timestamp);
                if idle >= Duration::from_secs(config.general.idle_timeout) {
                    kill = true;
                }
            }

            if !kill && config.general.max_connection_age > 0 {
                let age = idle_for(self.slot(i).meta.lock().start_time);
                if age >= Duration::from_secs(config.general.max_connection_age) {
                    kill = true;
                }
            }

            if !kill {
                if let Some(ref mut conn) = conn {
                    kill = conn.validate().await.is_err();
                }
            }

            if kill {
                drop(conn);
                self.kill_connection_from_sweep(i);
                prefill_if_can(false);
                continue;
            }

            *self.slot(i).conn.lock() = conn;
            if !self.cas_state(i, SlotState::Validation, SlotState::Free) {
                self.kill_connection_from_sweep(i);
                prefill_if_can(false);
            }
        }

        self.pool_status();
    }

    /// Drain slots matching a database pattern. FREE slots die immediately;
    /// IN_USE slots are forced (ALL) or marked GRACEFULLY so the owner's
    /// next return demolishes them. Slots on a FAILED server are pushed to
    /// GRACEFULLY regardless of mode.
    pub fn flush(&self, mode: FlushMode, database: &str) {
        let mut prefill = false;

        debug!("flush {mode} {database}");

        for i in (0..self.max_connections()).rev() {
            let (slot_server, slot_database, owner) = {
                let meta = self.slot(i).meta.lock();
                (meta.server, meta.database.clone(), meta.owner)
            };

            let server_failed = slot_server >= 0
                && servers::get_server(slot_server as usize)
                    .map(|s| s.state() == ServerState::Failed)
                    .unwrap_or(false);

            if server_failed {
                self.bump_to_gracefully(i, &mut prefill);
                continue;
            }

            if database != "*" && slot_database != database {
                continue;
            }

            if self.cas_state(i, SlotState::Free, SlotState::Flush) {
                self.terminate_cached(i);
                self.kill_connection_from_sweep(i);
                prefill = true;
            } else if mode == FlushMode::All || mode == FlushMode::Gracefully {
                if self.cas_state(i, SlotState::InUse, SlotState::Flush) {
                    match mode {
                        FlushMode::All => {
                            // The single-process stand-in for SIGQUIT: drop
                            // the owning client; its lease kills the slot.
                            crate::client::registry::disconnect(owner);
                            self.store_state(i, SlotState::Gracefully);
                        }
                        FlushMode::Gracefully => {
                            self.store_state(i, SlotState::Gracefully);
                        }
                        FlushMode::Idle => (),
                    }
                }
            }
        }

        if prefill {
            prefill_if_can(false);
        }

        self.pool_status();
    }

    /// Drain every slot tied to one server, then refill if a different
    /// primary is available.
    pub fn flush_server(&self, server: usize) {
        debug!("flush_server {server}");

        for i in 0..self.max_connections() {
            let slot_server = self.slot(i).meta.lock().server;
            if slot_server != server as i32 {
                continue;
            }

            if self.cas_state(i, SlotState::Free, SlotState::Gracefully) {
                self.terminate_cached(i);
                self.kill_connection_from_sweep(i);
            } else {
                match self.state(i) {
                    SlotState::NotInit | SlotState::Init => (),
                    _ => {
                        // In use or mid-sweep: the owner will notice.
                        self.store_state(i, SlotState::Gracefully);
                    }
                }
            }
        }

        match servers::get_primary() {
            Ok(primary) if primary != server => prefill_if_can(true),
            Ok(_) => (),
            Err(_) => debug!("No primary defined"),
        }

        self.pool_status();
    }

    fn bump_to_gracefully(&self, i: usize, prefill: &mut bool) {
        match self.state(i) {
            SlotState::NotInit | SlotState::Init => (),
            SlotState::Free => {
                self.store_state(i, SlotState::Gracefully);
                self.terminate_cached(i);
                self.kill_connection_from_sweep(i);
                *prefill = true;
            }
            _ => {
                self.store_state(i, SlotState::Gracefully);
            }
        }
    }

    fn terminate_cached(&self, i: usize) {
        if let Some(conn) = self.slot(i).conn.lock().as_mut() {
            if conn.socket_is_valid() {
                conn.terminate();
            }
        }
    }

    /// Open slots ahead of demand for every concrete (user, database) rule:
    /// up to `initial_size` on first start, `min_size` on refill. Stops a
    /// rule on the first authentication failure.
    pub async fn prefill(&self, initial: bool) {
        debug!("prefill initial={initial}");

        for r in 0..self.limits().len() {
            let (database, username, size) = {
                let rule = &self.limits()[r];
                let size = if initial {
                    rule.initial_size
                } else {
                    rule.min_size
                };
                (rule.database.clone(), rule.username.clone(), size)
            };

            if size == 0 {
                continue;
            }

            if database == "all" || username == "all" {
                warn!("Limit entry {} with wildcard cannot be prefilled", r + 1);
                continue;
            }

            if !crate::config::user_known(&username) {
                warn!("Unknown user '{username}' for limit entry {}", r + 1);
                continue;
            }

            while self.should_prefill(&username, &database, size) {
                match self
                    .get_connection(&username, &database, false, false, 0)
                    .await
                {
                    Ok(lease) => {
                        lease.release(false).await;
                    }
                    Err(err) => {
                        warn!(
                            "Prefill for '{username}'/'{database}' stopped: {err}"
                        );
                        break;
                    }
                }
            }
        }

        self.pool_status();
    }

    /// More slots wanted for this pair, and room to create them.
    fn should_prefill(&self, username: &str, database: &str, size: usize) -> bool {
        let mut connections = 0;
        let mut free = 0;

        for i in 0..self.max_connections() {
            let matches = {
                let meta = self.slot(i).meta.lock();
                meta.username == username && meta.database == database
            };
            if matches {
                connections += 1;
            } else if self.state(i) == SlotState::NotInit {
                free += 1;
            }
        }

        connections < size && free > 0
    }
}

/// Kick a prefill on the global pool if one can run. Safe to call from
/// anywhere; does nothing before the pool exists or when no primary is up.
pub fn prefill_if_can(initial: bool) {
    let Some(pool) = get_pool() else {
        return;
    };

    if !pool
        .limits()
        .iter()
        .any(|rule| if initial { rule.initial_size > 0 } else { rule.min_size > 0 })
    {
        return;
    }

    if servers::get_primary().is_err() {
        warn!("No primary detected, cannot prefill");
        return;
    }

    tokio::spawn(async move {
        pool.prefill(initial).await;
    });
}

/// The periodic maintenance task the supervisor runs: idle, age and
/// validation sweeps on one interval.
pub async fn run_sweeps() {
    let interval = get_config().general.background_interval.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(pool) = get_pool() else {
            continue;
        };
        let config = get_config();

        if config.general.idle_timeout > 0 {
            pool.idle_timeout_sweep();
        }
        if config.general.max_connection_age > 0 {
            pool.max_connection_age_sweep();
        }
        if config.general.validation == crate::config::Validation::Background {
            pool.validation_sweep().await;
        }

        info!(
            "pool: {}/{} connections active",
            pool.active_connections(),
            pool.max_connections()
        );
    }
}
