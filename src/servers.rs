//! The backend server descriptor table: a fixed array built at configuration
//! load, mutated only through the atomic per-server state word. Failover
//! promotes a standby by running the configured script and publishing the
//! outcome here.

use std::sync::atomic::{AtomicU8, Ordering};

use log::{error, info, warn};
use once_cell::sync::OnceCell;

use crate::config::ServerConfig;
use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    NotInit = 0,
    NotInitPrimary = 1,
    Primary = 2,
    Replica = 3,
    Failover = 4,
    Failed = 5,
}

impl ServerState {
    fn from_u8(value: u8) -> ServerState {
        match value {
            0 => ServerState::NotInit,
            1 => ServerState::NotInitPrimary,
            2 => ServerState::Primary,
            3 => ServerState::Replica,
            4 => ServerState::Failover,
            _ => ServerState::Failed,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::NotInit => "notinit",
            ServerState::NotInitPrimary => "notinit_primary",
            ServerState::Primary => "primary",
            ServerState::Replica => "replica",
            ServerState::Failover => "failover",
            ServerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ServerDesc {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    state: AtomicU8,
}

impl ServerDesc {
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn compare_exchange(&self, current: ServerState, new: ServerState) -> bool {
        self.state
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

static SERVERS: OnceCell<Vec<ServerDesc>> = OnceCell::new();

/// Build the descriptor table. Called once at startup; the table is never
/// resized or destroyed.
pub fn init_servers(configs: &[ServerConfig]) {
    let servers = configs
        .iter()
        .map(|config| ServerDesc {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            state: AtomicU8::new(if config.primary {
                ServerState::NotInitPrimary as u8
            } else {
                ServerState::NotInit as u8
            }),
        })
        .collect();

    if SERVERS.set(servers).is_err() {
        panic!("server table initialized twice");
    }
}

pub fn get_servers() -> &'static [ServerDesc] {
    SERVERS.get().map(|v| v.as_slice()).unwrap_or(&[])
}

pub fn get_server(index: usize) -> Option<&'static ServerDesc> {
    get_servers().get(index)
}

/// The server new connections go to: the PRIMARY if there is one, otherwise
/// the designated NOTINIT_PRIMARY, otherwise the first server that has not
/// failed.
pub fn get_primary() -> Result<usize, Error> {
    let servers = get_servers();

    for (i, server) in servers.iter().enumerate() {
        if server.state() == ServerState::Primary {
            return Ok(i);
        }
    }

    for (i, server) in servers.iter().enumerate() {
        if server.state() == ServerState::NotInitPrimary {
            return Ok(i);
        }
    }

    for (i, server) in servers.iter().enumerate() {
        let state = server.state();
        if state != ServerState::Failover && state != ServerState::Failed {
            return Ok(i);
        }
    }

    Err(Error::AllServersDown)
}

/// A connection to an uninitialized server succeeded: settle its role. Keeps
/// the at-most-one-primary invariant by only promoting through CAS from the
/// uninitialized states.
pub fn mark_online(index: usize) {
    let servers = get_servers();
    let Some(server) = servers.get(index) else {
        return;
    };

    if server.compare_exchange(ServerState::NotInitPrimary, ServerState::Primary) {
        info!("Server {} is primary", server.name);
        return;
    }

    let primary_exists = servers
        .iter()
        .enumerate()
        .any(|(i, s)| i != index && s.state() == ServerState::Primary);

    let role = if primary_exists {
        ServerState::Replica
    } else {
        ServerState::Primary
    };
    if server.compare_exchange(ServerState::NotInit, role) {
        info!("Server {} is {}", server.name, role);
    }
}

/// Failover entry point for a write error on the primary. CAS guards against
/// two workers racing to run the script.
pub async fn force_failover(index: usize) -> Result<(), Error> {
    let Some(server) = get_server(index) else {
        return Err(Error::AllServersDown);
    };

    let state = server.state();
    if state == ServerState::Failover || state == ServerState::Failed {
        return Err(Error::AllServersDown);
    }

    if !server.compare_exchange(state, ServerState::Failover) {
        // Someone else got there first.
        return Err(Error::AllServersDown);
    }

    failover(index).await
}

/// Promote the first standby. The old primary always ends up FAILED; the new
/// one becomes PRIMARY only when the script reports success.
async fn failover(old_primary: usize) -> Result<(), Error> {
    let servers = get_servers();
    let old = &servers[old_primary];

    let new_primary = servers.iter().enumerate().position(|(i, s)| {
        i != old_primary
            && matches!(
                s.state(),
                ServerState::NotInit | ServerState::NotInitPrimary | ServerState::Replica
            )
    });

    let Some(new_primary) = new_primary else {
        error!("Failover: new primary could not be found");
        old.set_state(ServerState::Failed);
        return Err(Error::AllServersDown);
    };
    let new = &servers[new_primary];

    let script = match crate::config::get_config().general.failover_script.clone() {
        Some(script) => script,
        None => {
            error!("Failover: no failover script configured");
            old.set_state(ServerState::Failed);
            return Err(Error::AllServersDown);
        }
    };

    let status = tokio::process::Command::new(&script)
        .arg(&old.host)
        .arg(old.port.to_string())
        .arg(&new.host)
        .arg(new.port.to_string())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            info!(
                "Failover: new primary is {} ({}:{})",
                new.name, new.host, new.port
            );
            old.set_state(ServerState::Failed);
            new.set_state(ServerState::Primary);
            Ok(())
        }
        Ok(status) => {
            error!("Failover: error from failover script ({status})");
            old.set_state(ServerState::Failed);
            new.set_state(ServerState::Failed);
            Err(Error::AllServersDown)
        }
        Err(err) => {
            error!("Failover: unable to execute failover script: {err}");
            old.set_state(ServerState::Failed);
            new.set_state(ServerState::Failed);
            Err(Error::AllServersDown)
        }
    }
}

/// Operator action: a FAILED server returns to NOTINIT.
pub fn server_reset(name: &str) -> Result<(), Error> {
    for server in get_servers() {
        if server.name == name {
            if server.state() == ServerState::Failed {
                server.set_state(ServerState::NotInit);
                info!("Server {} reset", server.name);
            }
            return Ok(());
        }
    }
    Err(Error::BadConfig(format!("unknown server '{name}'")))
}

/// Operator action: promote the named server; the current primary, if any,
/// becomes FAILED.
pub fn server_switch(name: &str) -> Result<(), Error> {
    let servers = get_servers();

    let mut old_primary = None;
    let mut new_primary = None;

    for (i, server) in servers.iter().enumerate() {
        if server.state() == ServerState::Primary {
            old_primary = Some(i);
        } else if server.name == name {
            new_primary = Some(i);
        }
    }

    let Some(new_primary) = new_primary else {
        warn!("switch-to: unknown or already-primary server '{name}'");
        return Err(Error::BadConfig(format!("unknown server '{name}'")));
    };

    if let Some(old_primary) = old_primary {
        servers[old_primary].set_state(ServerState::Failed);
    }
    servers[new_primary].set_state(ServerState::Primary);
    info!("Server {} switched to primary", name);

    Ok(())
}

/// Mark a server FAILED after an unrecoverable connect error when failover is
/// not configured. Sticky until an operator resets it.
pub fn mark_failed(index: usize) {
    if let Some(server) = get_server(index) {
        warn!("Server {} marked failed", server.name);
        server.set_state(ServerState::Failed);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests(configs: &[ServerConfig]) {
    // OnceCell cannot be reset; tests share one table and re-style it.
    if SERVERS.get().is_none() {
        init_servers(configs);
    } else {
        let servers = get_servers();
        for (i, config) in configs.iter().enumerate() {
            if let Some(server) = servers.get(i) {
                server.set_state(if config.primary {
                    ServerState::NotInitPrimary
                } else {
                    ServerState::NotInit
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fixture() -> Vec<ServerConfig> {
        vec![
            ServerConfig {
                name: "s1".into(),
                host: "10.0.0.1".into(),
                port: 5432,
                primary: true,
                tls: false,
            },
            ServerConfig {
                name: "s2".into(),
                host: "10.0.0.2".into(),
                port: 5432,
                primary: false,
                tls: false,
            },
            ServerConfig {
                name: "s3".into(),
                host: "10.0.0.3".into(),
                port: 5432,
                primary: false,
                tls: false,
            },
        ]
    }

    fn count_primaries() -> usize {
        get_servers()
            .iter()
            .filter(|s| s.state() == ServerState::Primary)
            .count()
    }

    #[test]
    #[serial]
    fn primary_selection_order() {
        reset_for_tests(&fixture());

        // Nothing online yet: the designated primary wins.
        assert_eq!(get_primary().unwrap(), 0);

        // A live primary beats the designation.
        get_servers()[1].set_state(ServerState::Primary);
        assert_eq!(get_primary().unwrap(), 1);

        // Everything failed: no server at all.
        for server in get_servers() {
            server.set_state(ServerState::Failed);
        }
        assert!(get_primary().is_err());
    }

    #[test]
    #[serial]
    fn mark_online_keeps_a_single_primary() {
        reset_for_tests(&fixture());

        mark_online(0);
        assert_eq!(get_servers()[0].state(), ServerState::Primary);

        mark_online(1);
        assert_eq!(get_servers()[1].state(), ServerState::Replica);
        assert_eq!(count_primaries(), 1);

        mark_online(2);
        assert_eq!(count_primaries(), 1);
    }

    #[test]
    #[serial]
    fn switch_demotes_the_old_primary() {
        reset_for_tests(&fixture());
        mark_online(0);
        mark_online(1);

        server_switch("s2").unwrap();

        assert_eq!(get_servers()[0].state(), ServerState::Failed);
        assert_eq!(get_servers()[1].state(), ServerState::Primary);
        assert_eq!(count_primaries(), 1);

        assert!(server_switch("nope").is_err());
    }

    #[test]
    #[serial]
    fn reset_only_touches_failed_servers() {
        reset_for_tests(&fixture());
        mark_online(0);

        get_servers()[1].set_state(ServerState::Failed);
        server_reset("s2").unwrap();
        assert_eq!(get_servers()[1].state(), ServerState::NotInit);

        // A live primary is left alone.
        server_reset("s1").unwrap();
        assert_eq!(get_servers()[0].state(), ServerState::Primary);

        assert!(server_reset("nope").is_err());
    }

    #[test]
    #[serial]
    fn failed_is_sticky_for_force_failover() {
        reset_for_tests(&fixture());
        get_servers()[0].set_state(ServerState::Failed);

        // Failover on an already-failed server refuses to run.
        let result =
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(force_failover(0));
        assert!(result.is_err());
        assert_eq!(get_servers()[0].state(), ServerState::Failed);
    }
}
