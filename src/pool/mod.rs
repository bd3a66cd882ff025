//! The connection pool: a fixed-size slot table with a parallel array of
//! atomic state words. Every observe-then-mutate on a slot is a single
//! compare-exchange on its state word; the slot's bookkeeping and the cached
//! backend connection are only touched by whoever won the CAS.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use log::{debug, error, trace, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::{get_config, LimitConfig, Validation};
use crate::errors::Error;
use crate::server::ServerConn;
use crate::servers;

pub mod sweep;

#[cfg(test)]
mod tests;

pub use sweep::FlushMode;

/// The slot-state alphabet. Transitions happen only through CAS on the
/// parallel atomic array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    NotInit = 0,
    Init = 1,
    Free = 2,
    InUse = 3,
    Gracefully = 4,
    Flush = 5,
    IdleCheck = 6,
    MaxConnectionAge = 7,
    Validation = 8,
    Remove = 9,
}

impl SlotState {
    pub fn from_u8(value: u8) -> SlotState {
        match value {
            0 => SlotState::NotInit,
            1 => SlotState::Init,
            2 => SlotState::Free,
            3 => SlotState::InUse,
            4 => SlotState::Gracefully,
            5 => SlotState::Flush,
            6 => SlotState::IdleCheck,
            7 => SlotState::MaxConnectionAge,
            8 => SlotState::Validation,
            _ => SlotState::Remove,
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::NotInit => "notinit",
            SlotState::Init => "init",
            SlotState::Free => "free",
            SlotState::InUse => "in_use",
            SlotState::Gracefully => "gracefully",
            SlotState::Flush => "flush",
            SlotState::IdleCheck => "idle_check",
            SlotState::MaxConnectionAge => "max_connection_age",
            SlotState::Validation => "validation",
            SlotState::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// The credential kind a slot's backend connection authenticated with.
/// Decides whether the slot may be cached for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAuth {
    Invalid,
    Trust,
    Password,
    Md5,
    Scram,
}

/// Slot bookkeeping. Protected by a per-slot mutex; only the owner of a
/// CAS-won transition touches it.
#[derive(Debug)]
pub struct SlotMeta {
    pub username: String,
    pub database: String,
    pub appname: String,
    /// Index into the server descriptor table, -1 when unassigned.
    pub server: i32,
    /// Index into the limit-rule table, -1 when no rule matched.
    pub limit_rule: i32,
    /// First use; never reset while the slot lives.
    pub start_time: Option<SystemTime>,
    /// Last use.
    pub timestamp: Option<SystemTime>,
    /// Owning client id, -1 when free.
    pub owner: i64,
    /// True until the slot has been handed out at least once.
    pub new: bool,
    /// The last return was in transaction mode.
    pub tx_mode: bool,
    pub auth: SlotAuth,
    /// BackendKeyData of the cached connection, for cancel matching.
    pub backend_pid: i32,
    pub backend_secret: i32,
}

impl SlotMeta {
    fn cleared() -> SlotMeta {
        SlotMeta {
            username: String::new(),
            database: String::new(),
            appname: String::new(),
            server: -1,
            limit_rule: -1,
            start_time: None,
            timestamp: None,
            owner: -1,
            new: true,
            tx_mode: false,
            auth: SlotAuth::Invalid,
            backend_pid: 0,
            backend_secret: 0,
        }
    }
}

pub struct Slot {
    pub(crate) meta: Mutex<SlotMeta>,
    /// The cached backend connection. Present while the slot is FREE (or in a
    /// transient sweep state); moved out to the worker while IN_USE.
    pub(crate) conn: Mutex<Option<ServerConn>>,
}

/// A limit rule with its live counter.
#[derive(Debug)]
pub struct LimitRule {
    pub database: String,
    pub username: String,
    pub max_size: usize,
    pub initial_size: usize,
    pub min_size: usize,
    pub active_connections: AtomicUsize,
}

impl From<&LimitConfig> for LimitRule {
    fn from(config: &LimitConfig) -> LimitRule {
        LimitRule {
            database: config.database.clone(),
            username: config.username.clone(),
            max_size: config.max_size,
            initial_size: config.initial_size,
            min_size: config.min_size,
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// The pool. One per process, sized at startup.
pub struct PoolState {
    slots: Vec<Slot>,
    states: Vec<AtomicU8>,
    active_connections: AtomicUsize,
    max_connections: usize,
    limits: Vec<LimitRule>,
}

static POOL: OnceCell<PoolState> = OnceCell::new();
static CLIENT_ID: AtomicI64 = AtomicI64::new(1);

/// Build the global pool. Called once at startup.
pub fn init_pool(max_connections: usize, limits: &[LimitConfig]) {
    if POOL.set(PoolState::new(max_connections, limits)).is_err() {
        panic!("pool initialized twice");
    }
}

pub fn get_pool() -> Option<&'static PoolState> {
    POOL.get()
}

/// A fresh id for a client session, used as the slot owner mark.
pub fn next_client_id() -> i64 {
    CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// An acquired slot. Holds the backend connection while the worker drives
/// it; dropping the lease without an explicit release kills the slot, which
/// is what happens when a worker dies mid-flight.
pub struct SlotLease<'a> {
    pool: &'a PoolState,
    slot: usize,
    conn: Option<ServerConn>,
}

impl<'a> SlotLease<'a> {
    #[inline(always)]
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn conn(&mut self) -> &mut ServerConn {
        self.conn.as_mut().expect("lease holds a connection")
    }

    /// Descriptor index of the backend behind this lease.
    pub fn server_index(&self) -> usize {
        self.conn
            .as_ref()
            .map(|conn| conn.server_index())
            .unwrap_or(0)
    }

    /// Return the slot to the pool per the return rules; it ends up FREE or
    /// NOTINIT.
    pub async fn release(mut self, transaction_mode: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .return_connection(self.slot, conn, transaction_mode)
                .await;
        }
    }

    /// Demolish the slot.
    pub fn kill(mut self) {
        let conn = self.conn.take();
        self.pool.kill_connection(self.slot, conn);
    }
}

impl<'a> Drop for SlotLease<'a> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Slot {} lease dropped without release", self.slot);
            self.pool.kill_connection(self.slot, Some(conn));
        }
    }
}

impl PoolState {
    pub fn new(max_connections: usize, limits: &[LimitConfig]) -> PoolState {
        let mut slots = Vec::with_capacity(max_connections);
        let mut states = Vec::with_capacity(max_connections);
        for _ in 0..max_connections {
            slots.push(Slot {
                meta: Mutex::new(SlotMeta::cleared()),
                conn: Mutex::new(None),
            });
            states.push(AtomicU8::new(SlotState::NotInit as u8));
        }

        PoolState {
            slots,
            states,
            active_connections: AtomicUsize::new(0),
            max_connections,
            limits: limits.iter().map(LimitRule::from).collect(),
        }
    }

    #[inline(always)]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[inline(always)]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> &[LimitRule] {
        &self.limits
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    #[inline]
    pub fn state(&self, index: usize) -> SlotState {
        SlotState::from_u8(self.states[index].load(Ordering::Acquire))
    }

    #[inline]
    fn cas_state(&self, index: usize, current: SlotState, new: SlotState) -> bool {
        self.states[index]
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    fn store_state(&self, index: usize, state: SlotState) {
        self.states[index].store(state as u8, Ordering::Release);
    }

    /// Select the most specific matching limit rule: exact user and database
    /// beat a wildcard in either field.
    pub fn find_best_rule(&self, username: &str, database: &str) -> i32 {
        let mut best_rule: i32 = -1;

        for (i, rule) in self.limits.iter().enumerate() {
            let user_match = rule.username == "all" || rule.username == username;
            let db_match = rule.database == "all" || rule.database == database;
            if !user_match || !db_match {
                continue;
            }

            if best_rule == -1 {
                best_rule = i as i32;
                continue;
            }

            let current = &self.limits[best_rule as usize];
            if current.username == username && current.database == database {
                // We have a precise rule already.
            } else if current.username == "all" {
                // An exact user is better.
                if rule.username != "all" {
                    best_rule = i as i32;
                }
            } else if current.database == "all" {
                // An exact database is better.
                if rule.database != "all" {
                    best_rule = i as i32;
                }
            }
        }

        best_rule
    }

    /// Acquire a slot for (username, database). `reuse` scans FREE slots
    /// first; creation is skipped in transaction mode. See the sweep module
    /// for everything that can take the slot away again.
    pub async fn get_connection(
        &self,
        username: &str,
        database: &str,
        reuse: bool,
        transaction_mode: bool,
        client_id: i64,
    ) -> Result<SlotLease<'_>, Error> {
        let best_rule = self.find_best_rule(username, database);
        let mut retries: u32 = 0;
        let start_time = SystemTime::now();

        'start: loop {
            let config = get_config();
            let mut rule_counted = false;
            let mut pool_counted = false;

            // Per-rule counter first, pool-wide second; either overflow rolls
            // back what was taken and goes to the retry path.
            let mut overflow = false;
            if best_rule >= 0 {
                let rule = &self.limits[best_rule as usize];
                let connections = rule.active_connections.fetch_add(1, Ordering::AcqRel);
                rule_counted = true;
                if connections >= rule.max_size {
                    overflow = true;
                }
            }

            if !overflow {
                let connections = self.active_connections.fetch_add(1, Ordering::AcqRel);
                pool_counted = true;
                if connections >= self.max_connections {
                    overflow = true;
                }
            }

            let mut slot: Option<usize> = None;
            let mut do_init = false;

            if !overflow {
                // Try and find an existing free connection. Slots are created
                // from the low end, so scanning upward keeps hot slots hot
                // and leaves the newest for last.
                if reuse {
                    for i in 0..self.max_connections {
                        if !self.cas_state(i, SlotState::Free, SlotState::InUse) {
                            continue;
                        }
                        let matches = {
                            let meta = self.slots[i].meta.lock();
                            meta.limit_rule == best_rule
                                && meta.username == username
                                && meta.database == database
                        };
                        if matches {
                            slot = Some(i);
                            break;
                        }
                        self.store_state(i, SlotState::Free);
                    }
                }

                // Ok, try and create a new connection.
                if slot.is_none() && !transaction_mode {
                    for i in 0..self.max_connections {
                        if self.cas_state(i, SlotState::NotInit, SlotState::Init) {
                            slot = Some(i);
                            do_init = true;
                            break;
                        }
                    }
                }
            }

            if let Some(i) = slot {
                {
                    let mut meta = self.slots[i].meta.lock();
                    meta.limit_rule = best_rule;
                    meta.owner = client_id;
                }

                if do_init {
                    match self.init_slot(i, username, database).await {
                        Ok(()) => (),
                        Err(err) => {
                            // init_slot reset the slot already.
                            if rule_counted {
                                self.limits[best_rule as usize]
                                    .active_connections
                                    .fetch_sub(1, Ordering::AcqRel);
                            }
                            if pool_counted {
                                self.active_connections.fetch_sub(1, Ordering::AcqRel);
                            }

                            if err == Error::ShuttingDown {
                                return Err(err);
                            }

                            // Failover already ran inside init_slot when it
                            // was configured; a recovered primary is worth
                            // another attempt.
                            if config.general.failover && err == Error::AllServersDown {
                                if retries < config.general.max_retries {
                                    retries += 1;
                                    continue 'start;
                                }
                            }
                            return Err(err);
                        }
                    }
                } else {
                    // Re-used slot: verify the cached connection before
                    // handing it out.
                    let conn = self.slots[i].conn.lock().take();
                    let mut conn = match conn {
                        Some(conn) => conn,
                        None => {
                            // The cached descriptor is gone; the slot is dead.
                            error!("Slot {i} is FREE but has no connection");
                            self.kill_connection(i, None);
                            sweep::prefill_if_can(false);
                            if retries < config.general.max_retries {
                                retries += 1;
                                continue 'start;
                            }
                            return Err(Error::PoolFull);
                        }
                    };

                    let mut kill = false;

                    if !conn.socket_is_valid() {
                        if !transaction_mode {
                            kill = true;
                        } else {
                            *self.slots[i].conn.lock() = Some(conn);
                            self.store_state(i, SlotState::Free);
                            if rule_counted {
                                self.limits[best_rule as usize]
                                    .active_connections
                                    .fetch_sub(1, Ordering::AcqRel);
                            }
                            if pool_counted {
                                self.active_connections.fetch_sub(1, Ordering::AcqRel);
                            }
                            retries += 1;
                            if retries > config.general.max_retries {
                                return Err(Error::PoolFull);
                            }
                            continue 'start;
                        }
                    }

                    if !kill && config.general.validation == Validation::Foreground {
                        kill = conn.validate().await.is_err();
                    }

                    if kill {
                        debug!("get_connection: slot {i} failed validation");
                        // The kill decrements the counters we took above.
                        self.kill_connection(i, Some(conn));
                        sweep::prefill_if_can(false);

                        if self.retry_after_kill(&mut retries, start_time, transaction_mode)? {
                            continue 'start;
                        }
                        return Err(Error::PoolFull);
                    }

                    *self.slots[i].conn.lock() = Some(conn);
                }

                // Success: stamp the clocks and hand the connection out.
                let conn = self.slots[i]
                    .conn
                    .lock()
                    .take()
                    .expect("slot was just initialized or validated");
                {
                    let mut meta = self.slots[i].meta.lock();
                    if meta.start_time.is_none() {
                        meta.start_time = Some(SystemTime::now());
                    }
                    meta.timestamp = Some(SystemTime::now());
                }

                return Ok(SlotLease {
                    pool: self,
                    slot: i,
                    conn: Some(conn),
                });
            }

            // No slot: roll the counters back and decide how to retry.
            if rule_counted {
                self.limits[best_rule as usize]
                    .active_connections
                    .fetch_sub(1, Ordering::AcqRel);
            }
            if pool_counted {
                self.active_connections.fetch_sub(1, Ordering::AcqRel);
            }

            if config.general.blocking_timeout > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;

                let waited = start_time.elapsed().unwrap_or_default();
                if waited >= Duration::from_secs(config.general.blocking_timeout) {
                    return Err(Error::PoolFull);
                }

                if best_rule == -1 {
                    self.remove_connection(username, database);
                }

                continue 'start;
            }

            if !transaction_mode {
                if best_rule == -1 {
                    if self.remove_connection(username, database)
                        && retries < config.general.max_retries
                    {
                        retries += 1;
                        continue 'start;
                    }
                } else if retries < config.general.max_retries {
                    retries += 1;
                    continue 'start;
                }
                return Err(Error::PoolFull);
            }

            // Transaction mode blocks until a slot frees up.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Shared retry bookkeeping for the validated-reuse kill path.
    fn retry_after_kill(
        &self,
        retries: &mut u32,
        start_time: SystemTime,
        transaction_mode: bool,
    ) -> Result<bool, Error> {
        let config = get_config();

        if config.general.blocking_timeout > 0 {
            let waited = start_time.elapsed().unwrap_or_default();
            if waited >= Duration::from_secs(config.general.blocking_timeout) {
                return Err(Error::PoolFull);
            }
            return Ok(true);
        }

        if transaction_mode {
            return Ok(true);
        }

        if *retries < config.general.max_retries {
            *retries += 1;
            return Ok(true);
        }

        Ok(false)
    }

    /// Open a fresh backend connection for a slot sitting in INIT. On
    /// success the slot is published IN_USE with the connection parked in it;
    /// on failure the slot is reset to NOTINIT and failover may have run.
    async fn init_slot(&self, i: usize, username: &str, database: &str) -> Result<(), Error> {
        let config = get_config();

        let server = match servers::get_primary() {
            Ok(server) => server,
            Err(_) => {
                self.reset_slot(i);
                // Nothing to connect to: push every cached slot out.
                self.flush(FlushMode::Gracefully, "*");
                return Err(Error::AllServersDown);
            }
        };

        let password = crate::config::user_password(username);

        match ServerConn::startup(server, username, password.as_deref(), database, "pg_warden")
            .await
        {
            Ok(conn) => {
                let auth = conn.auth_kind();
                {
                    let mut meta = self.slots[i].meta.lock();
                    meta.server = server as i32;
                    meta.username = username.to_string();
                    meta.database = database.to_string();
                    meta.auth = auth;
                    meta.backend_pid = conn.backend_pid();
                    meta.backend_secret = conn.backend_secret();
                }
                *self.slots[i].conn.lock() = Some(conn);
                self.store_state(i, SlotState::InUse);
                Ok(())
            }
            Err(err) => {
                error!(
                    "No connection to server {} for {}/{}: {err}",
                    server, username, database
                );
                self.reset_slot(i);
                self.flush_server(server);

                if config.general.failover {
                    let _ = servers::force_failover(server).await;
                } else {
                    servers::mark_failed(server);
                }

                Err(Error::AllServersDown)
            }
        }
    }

    fn reset_slot(&self, i: usize) {
        {
            let mut meta = self.slots[i].meta.lock();
            meta.limit_rule = -1;
            meta.owner = -1;
        }
        self.store_state(i, SlotState::NotInit);
    }

    /// Kill a FREE slot belonging to a different (user, db) pair to make
    /// room. A slot of our own pair is put back untouched. Runs from the
    /// high end so hot slots survive.
    pub fn remove_connection(&self, username: &str, database: &str) -> bool {
        for i in (0..self.max_connections).rev() {
            if !self.cas_state(i, SlotState::Free, SlotState::Remove) {
                continue;
            }

            let ours = {
                let meta = self.slots[i].meta.lock();
                meta.username == username && meta.database == database
            };

            if ours {
                if !self.cas_state(i, SlotState::Remove, SlotState::Free) {
                    self.kill_connection_from_sweep(i);
                }
            } else {
                self.kill_connection_from_sweep(i);
            }

            return true;
        }

        false
    }

    /// Give a slot back: either cached as FREE for the next taker or
    /// demolished. Consumes the connection either way.
    pub async fn return_connection(
        &self,
        i: usize,
        mut conn: ServerConn,
        transaction_mode: bool,
    ) {
        let config = get_config();

        // Kill the connection if it has lived longer than max_connection_age.
        // The age clock keeps running during transactions; the kill is only
        // deferred while the slot was last used mid-transaction.
        if config.general.max_connection_age > 0
            && self.cas_state(i, SlotState::InUse, SlotState::MaxConnectionAge)
        {
            let (age, tx_mode) = {
                let meta = self.slots[i].meta.lock();
                (
                    meta.start_time
                        .and_then(|t| t.elapsed().ok())
                        .unwrap_or_default(),
                    meta.tx_mode,
                )
            };
            let expired = age >= Duration::from_secs(config.general.max_connection_age);
            if (expired && !tx_mode)
                || !self.cas_state(i, SlotState::MaxConnectionAge, SlotState::InUse)
            {
                self.kill_connection(i, Some(conn));
                return;
            }
        }

        // Verify the socket for the slot.
        if !transaction_mode && !conn.socket_is_valid() {
            debug!("return_connection: slot {i} socket invalid");
            self.slots[i].meta.lock().auth = SlotAuth::Invalid;
        }

        // Can we cache this connection?
        let cacheable = {
            let meta = self.slots[i].meta.lock();
            meta.auth != SlotAuth::Invalid
                && (meta.auth != SlotAuth::Scram
                    || crate::config::user_known(&meta.username))
                && !conn.is_bad()
        };

        if cacheable {
            let state = self.state(i);

            if state == SlotState::InUse {
                if !transaction_mode {
                    if conn.discard_all().await.is_err() {
                        self.kill_connection(i, Some(conn));
                        return;
                    }
                }

                debug!("return_connection: slot {i}");

                let limit_rule = {
                    let mut meta = self.slots[i].meta.lock();
                    meta.timestamp = Some(SystemTime::now());
                    meta.new = false;
                    meta.owner = -1;
                    meta.tx_mode = transaction_mode;
                    meta.appname.clear();
                    meta.limit_rule
                };

                if limit_rule >= 0 {
                    self.limits[limit_rule as usize]
                        .active_connections
                        .fetch_sub(1, Ordering::AcqRel);
                }

                *self.slots[i].conn.lock() = Some(conn);
                self.store_state(i, SlotState::Free);
                self.active_connections.fetch_sub(1, Ordering::AcqRel);
                return;
            } else if state == SlotState::Gracefully {
                conn.terminate();
            }
        }

        self.kill_connection(i, Some(conn));
    }

    /// Demolish a slot back to NOTINIT. Safe to call twice: the second call
    /// finds the slot already cleared and does nothing observable.
    pub fn kill_connection(&self, i: usize, conn: Option<ServerConn>) {
        let cached = self.slots[i].conn.lock().take();
        let conn = conn.or(cached);

        debug!(
            "kill_connection: slot {i} state {} conn {}",
            self.state(i),
            conn.is_some()
        );

        if let Some(mut conn) = conn {
            if !conn.socket_is_valid() {
                conn.mark_bad("socket error at kill");
            }
            // Drop sends Terminate best-effort.
            drop(conn);
        }

        {
            let mut meta = self.slots[i].meta.lock();

            if meta.owner != -1 {
                if meta.limit_rule >= 0 {
                    self.limits[meta.limit_rule as usize]
                        .active_connections
                        .fetch_sub(1, Ordering::AcqRel);
                }
                self.active_connections.fetch_sub(1, Ordering::AcqRel);
            }

            *meta = SlotMeta::cleared();
        }

        self.store_state(i, SlotState::NotInit);
    }

    /// Kill from a sweep: the slot is in a transient state and unowned, so
    /// there are no counters to roll back.
    pub(crate) fn kill_connection_from_sweep(&self, i: usize) {
        self.kill_connection(i, None);
    }

    /// Find the slot whose cached backend matches a CancelRequest; returns
    /// the server descriptor index to forward it to.
    pub fn find_cancel_target(&self, backend_pid: i32, backend_secret: i32) -> Option<usize> {
        for i in 0..self.max_connections {
            if self.state(i) == SlotState::NotInit {
                continue;
            }
            let meta = self.slots[i].meta.lock();
            if meta.backend_pid == backend_pid
                && meta.backend_secret == backend_secret
                && meta.server >= 0
            {
                return Some(meta.server as usize);
            }
        }
        None
    }

    /// The backend behind the slot a client currently owns, for cancelling
    /// its in-flight query before disconnecting it.
    pub fn find_slot_by_owner(&self, owner: i64) -> Option<(usize, i32, i32)> {
        for i in 0..self.max_connections {
            let meta = self.slots[i].meta.lock();
            if meta.owner == owner && meta.server >= 0 {
                return Some((meta.server as usize, meta.backend_pid, meta.backend_secret));
            }
        }
        None
    }

    /// Debug dump after sweeps.
    pub fn pool_status(&self) {
        debug!(
            "pool_status: {}/{}",
            self.active_connections(),
            self.max_connections
        );
        for i in 0..self.max_connections {
            let state = self.state(i);
            if state == SlotState::NotInit {
                continue;
            }
            {
                let meta = self.slots[i].meta.lock();
                debug!(
                    "  slot {i}: state {} user {} db {} rule {} owner {} pid {}",
                    state,
                    meta.username,
                    meta.database,
                    meta.limit_rule,
                    meta.owner,
                    meta.backend_pid
                );
            }
            if let Some(conn) = self.slots[i].conn.lock().as_ref() {
                trace!(
                    "  slot {i}: auth frames {:?} backend secret set {}",
                    conn.auth_frames()
                        .iter()
                        .map(|frame| frame.len())
                        .collect::<Vec<_>>(),
                    conn.backend_secret() != 0
                );
            }
        }
    }
}
