// Slot state machine tests. Everything here stages slots by hand instead of
// dialing a backend: the state word, the counters and the bookkeeping are
// what the invariants are about.

use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use serial_test::serial;

use super::*;
use crate::config::{set_config_for_tests, Config, LimitConfig};

fn limit(database: &str, username: &str, max: usize) -> LimitConfig {
    LimitConfig {
        database: database.into(),
        username: username.into(),
        max_size: max,
        initial_size: 0,
        min_size: 0,
    }
}

fn test_config() -> Config {
    Config::default()
}

/// Stage a slot as if a full acquire+create had happened for (user, db).
fn stage_assigned(pool: &PoolState, i: usize, username: &str, database: &str, rule: i32) {
    {
        let mut meta = pool.slots[i].meta.lock();
        meta.username = username.to_string();
        meta.database = database.to_string();
        meta.server = -1;
        meta.limit_rule = rule;
        meta.owner = 42;
        meta.auth = SlotAuth::Md5;
        meta.start_time = Some(SystemTime::now());
        meta.timestamp = Some(SystemTime::now());
    }
    if rule >= 0 {
        pool.limits[rule as usize]
            .active_connections
            .fetch_add(1, Ordering::AcqRel);
    }
    pool.active_connections.fetch_add(1, Ordering::AcqRel);
    pool.store_state(i, SlotState::InUse);
}

/// Stage a slot as FREE the way return_connection leaves it: counters
/// already released, bookkeeping kept.
fn stage_free(pool: &PoolState, i: usize, username: &str, database: &str, rule: i32) {
    {
        let mut meta = pool.slots[i].meta.lock();
        meta.username = username.to_string();
        meta.database = database.to_string();
        meta.server = -1;
        meta.limit_rule = rule;
        meta.owner = -1;
        meta.new = false;
        meta.auth = SlotAuth::Md5;
        meta.start_time = Some(SystemTime::now());
        meta.timestamp = Some(SystemTime::now());
    }
    pool.store_state(i, SlotState::Free);
}

#[test]
fn best_rule_prefers_exact_match() {
    let pool = PoolState::new(
        4,
        &[
            limit("all", "all", 10),
            limit("mydb", "all", 10),
            limit("mydb", "alice", 10),
            limit("all", "alice", 10),
        ],
    );

    assert_eq!(pool.find_best_rule("alice", "mydb"), 2);
    assert_eq!(pool.find_best_rule("bob", "mydb"), 1);
    assert_eq!(pool.find_best_rule("alice", "otherdb"), 3);
    assert_eq!(pool.find_best_rule("bob", "otherdb"), 0);
}

#[test]
fn best_rule_without_match_is_minus_one() {
    let pool = PoolState::new(4, &[limit("mydb", "alice", 10)]);
    assert_eq!(pool.find_best_rule("bob", "otherdb"), -1);
}

#[test]
fn best_rule_exact_user_beats_exact_database() {
    // Declaration order must not matter for specificity.
    let pool = PoolState::new(
        4,
        &[limit("mydb", "all", 10), limit("all", "alice", 10)],
    );
    // Exact user wins over wildcard user.
    assert_eq!(pool.find_best_rule("alice", "mydb"), 1);
}

#[test]
#[serial]
fn kill_clears_slot_and_counters() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[limit("mydb", "alice", 10)]);

    stage_assigned(&pool, 0, "alice", "mydb", 0);
    assert_eq!(pool.active_connections(), 1);
    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 1);

    pool.kill_connection(0, None);

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.active_connections(), 0);
    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 0);

    let meta = pool.slots[0].meta.lock();
    assert_eq!(meta.owner, -1);
    assert_eq!(meta.limit_rule, -1);
    assert_eq!(meta.server, -1);
    assert!(meta.username.is_empty());
    assert!(meta.new);
}

#[test]
#[serial]
fn kill_is_idempotent() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[limit("mydb", "alice", 10)]);

    stage_assigned(&pool, 0, "alice", "mydb", 0);
    pool.kill_connection(0, None);
    pool.kill_connection(0, None);

    // The second kill must not drive the counters negative or disturb the
    // cleared state.
    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.active_connections(), 0);
    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 0);
}

#[test]
#[serial]
fn idle_sweep_kills_only_expired_free_slots() {
    let mut config = test_config();
    config.general.idle_timeout = 5;
    set_config_for_tests(config);

    let pool = PoolState::new(4, &[]);

    // Slot 0: FREE, idle for 10 seconds.
    stage_free(&pool, 0, "alice", "mydb", -1);
    pool.slots[0].meta.lock().timestamp = Some(SystemTime::now() - Duration::from_secs(10));

    // Slot 1: FREE, recently used.
    stage_free(&pool, 1, "alice", "mydb", -1);

    // Slot 2: IN_USE, ancient, but not the sweep's business.
    stage_assigned(&pool, 2, "alice", "mydb", -1);
    pool.slots[2].meta.lock().timestamp = Some(SystemTime::now() - Duration::from_secs(100));

    pool.idle_timeout_sweep();

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.state(1), SlotState::Free);
    assert_eq!(pool.state(2), SlotState::InUse);
}

#[test]
#[serial]
fn idle_sweep_spares_tx_mode_slots() {
    let mut config = test_config();
    config.general.idle_timeout = 5;
    set_config_for_tests(config);

    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    {
        let mut meta = pool.slots[0].meta.lock();
        meta.timestamp = Some(SystemTime::now() - Duration::from_secs(10));
        meta.tx_mode = true;
    }

    pool.idle_timeout_sweep();

    assert_eq!(pool.state(0), SlotState::Free);
}

#[test]
#[serial]
fn age_sweep_uses_start_time() {
    let mut config = test_config();
    config.general.max_connection_age = 60;
    set_config_for_tests(config);

    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    {
        let mut meta = pool.slots[0].meta.lock();
        meta.start_time = Some(SystemTime::now() - Duration::from_secs(120));
        // Recently used; age kills anyway.
        meta.timestamp = Some(SystemTime::now());
    }

    stage_free(&pool, 1, "alice", "mydb", -1);

    pool.max_connection_age_sweep();

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.state(1), SlotState::Free);
}

#[test]
#[serial]
fn remove_connection_kills_foreign_pairs_only() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    stage_free(&pool, 1, "bob", "otherdb", -1);

    // The backward scan hits bob's slot first; it dies.
    assert!(pool.remove_connection("alice", "mydb"));
    assert_eq!(pool.state(1), SlotState::NotInit);
    assert_eq!(pool.state(0), SlotState::Free);

    // Now only alice's own slot remains; it is restored, not killed.
    assert!(pool.remove_connection("alice", "mydb"));
    assert_eq!(pool.state(0), SlotState::Free);
}

#[test]
#[serial]
fn remove_connection_reports_nothing_to_do() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);
    assert!(!pool.remove_connection("alice", "mydb"));
}

#[test]
#[serial]
fn flush_idle_only_touches_free_slots() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    stage_assigned(&pool, 1, "alice", "mydb", -1);

    pool.flush(FlushMode::Idle, "*");

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.state(1), SlotState::InUse);
}

#[test]
#[serial]
fn flush_gracefully_marks_in_use_slots() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    stage_assigned(&pool, 1, "alice", "mydb", -1);

    pool.flush(FlushMode::Gracefully, "*");

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.state(1), SlotState::Gracefully);
}

#[test]
#[serial]
fn flush_respects_database_pattern() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_free(&pool, 0, "alice", "mydb", -1);
    stage_free(&pool, 1, "bob", "otherdb", -1);

    pool.flush(FlushMode::Idle, "mydb");

    assert_eq!(pool.state(0), SlotState::NotInit);
    assert_eq!(pool.state(1), SlotState::Free);
}

#[test]
#[serial]
fn no_free_slots_after_flush_all() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(8, &[]);

    for i in 0..4 {
        stage_free(&pool, i, "alice", "mydb", -1);
    }
    stage_assigned(&pool, 4, "alice", "mydb", -1);

    pool.flush(FlushMode::All, "*");

    for i in 0..pool.max_connections() {
        assert_ne!(pool.state(i), SlotState::Free, "slot {i} still FREE");
    }
}

#[test]
#[serial]
fn cancel_target_matches_backend_key() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_assigned(&pool, 0, "alice", "mydb", -1);
    {
        let mut meta = pool.slots[0].meta.lock();
        meta.backend_pid = 4242;
        meta.backend_secret = 777;
        meta.server = 3;
    }

    assert_eq!(pool.find_cancel_target(4242, 777), Some(3));
    assert_eq!(pool.find_cancel_target(4242, 778), None);
    assert_eq!(pool.find_cancel_target(4243, 777), None);
}

#[test]
#[serial]
fn owner_lookup_finds_the_right_slot() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(4, &[]);

    stage_assigned(&pool, 0, "alice", "mydb", -1);
    {
        let mut meta = pool.slots[0].meta.lock();
        meta.owner = 99;
        meta.server = 0;
        meta.backend_pid = 11;
        meta.backend_secret = 22;
    }

    assert_eq!(pool.find_slot_by_owner(99), Some((0, 11, 22)));
    assert_eq!(pool.find_slot_by_owner(98), None);
}

#[test]
#[serial]
fn counters_track_assigned_slots() {
    set_config_for_tests(test_config());
    let pool = PoolState::new(8, &[limit("mydb", "alice", 4)]);

    for i in 0..3 {
        stage_assigned(&pool, i, "alice", "mydb", 0);
    }
    assert_eq!(pool.active_connections(), 3);
    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 3);

    pool.kill_connection(1, None);
    assert_eq!(pool.active_connections(), 2);
    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 2);
}

#[tokio::test]
#[serial]
async fn acquire_in_transaction_mode_never_creates() {
    // An empty pool in transaction mode has nothing to reuse; with a
    // blocking timeout the acquire times out instead of dialing a backend.
    let mut config = test_config();
    config.general.blocking_timeout = 1;
    set_config_for_tests(config);

    let pool = PoolState::new(2, &[]);
    let result = pool.get_connection("alice", "mydb", true, true, 7).await;

    assert_eq!(result.err(), Some(crate::errors::Error::PoolFull));
    for i in 0..pool.max_connections() {
        assert_eq!(pool.state(i), SlotState::NotInit);
    }
    assert_eq!(pool.active_connections(), 0);
}

#[tokio::test]
#[serial]
async fn acquire_respects_rule_limit() {
    // The rule allows one connection and it is checked out; a second acquire
    // in transaction mode must time out without touching the counters.
    let mut config = test_config();
    config.general.blocking_timeout = 1;
    set_config_for_tests(config);

    let pool = PoolState::new(4, &[limit("mydb", "alice", 1)]);
    stage_assigned(&pool, 0, "alice", "mydb", 0);

    let result = pool.get_connection("alice", "mydb", true, true, 7).await;
    assert!(result.is_err());

    assert_eq!(pool.limits[0].active_connections.load(Ordering::Acquire), 1);
    assert_eq!(pool.active_connections(), 1);
}
