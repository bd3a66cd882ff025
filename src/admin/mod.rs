//! The admin console. Clients connecting to the `pgwarden` database speak
//! plain simple-query protocol against the pooler itself: SHOW commands,
//! FLUSH, SERVER RESET, SWITCH TO, RELOAD and SHUTDOWN.

mod show;

use log::{info, warn};

use crate::client::Client;
use crate::config::reload_config;
use crate::errors::Error;
use crate::messages::{
    command_complete, error_response, read_message, ready_for_query, write_all_flush,
};
use crate::pool::{get_pool, FlushMode};
use crate::servers;

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Serve admin commands until the client goes away.
    pub async fn handle_admin(&mut self) -> Result<(), Error> {
        loop {
            let frame = match read_message(&mut self.read).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            match frame[0] {
                b'X' => return Ok(()),
                b'Q' => {
                    let payload = &frame[5..];
                    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
                    let query = String::from_utf8_lossy(&payload[..end]).to_string();
                    self.handle_admin_query(&query).await?;
                }
                _ => {
                    error_response(
                        &mut self.write,
                        "admin console only supports the simple query protocol",
                        "42601",
                    )
                    .await?;
                }
            }
        }
    }

    async fn handle_admin_query(&mut self, query: &str) -> Result<(), Error> {
        let normalized = query.trim().trim_end_matches(';').trim().to_string();
        let upper = normalized.to_uppercase();
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        info!("Admin: {normalized}");

        match upper.as_str() {
            "SHOW SERVERS" => {
                let buf = show::show_servers();
                write_all_flush(&mut self.write, &buf).await
            }
            "SHOW POOLS" => {
                let buf = show::show_pools();
                write_all_flush(&mut self.write, &buf).await
            }
            "SHOW CLIENTS" => {
                let buf = show::show_clients();
                write_all_flush(&mut self.write, &buf).await
            }
            "SHOW STATUS" => {
                let buf = show::show_status();
                write_all_flush(&mut self.write, &buf).await
            }
            "RELOAD" => {
                match reload_config().await {
                    Ok(changed) => {
                        info!("Admin reload, changed: {changed}");
                        self.admin_ok("RELOAD").await
                    }
                    Err(err) => {
                        error_response(&mut self.write, &err.to_string(), "F0000").await
                    }
                }
            }
            "SHUTDOWN" => {
                warn!("Shutdown requested over the admin console");
                crate::app::server::request_shutdown();
                self.admin_ok("SHUTDOWN").await
            }
            _ if upper.starts_with("FLUSH") => self.admin_flush(&tokens, &upper).await,
            _ if upper.starts_with("SERVER RESET") => {
                let Some(name) = tokens.get(2) else {
                    return error_response(&mut self.write, "SERVER RESET <name>", "42601").await;
                };
                match servers::server_reset(name) {
                    Ok(()) => self.admin_ok("RESET").await,
                    Err(err) => error_response(&mut self.write, &err.to_string(), "F0000").await,
                }
            }
            _ if upper.starts_with("SWITCH TO") => {
                let Some(name) = tokens.get(2) else {
                    return error_response(&mut self.write, "SWITCH TO <name>", "42601").await;
                };
                match servers::server_switch(name) {
                    Ok(()) => {
                        // Old primary is FAILED now; push its slots out.
                        if let Some(pool) = get_pool() {
                            pool.flush(FlushMode::Gracefully, "*");
                        }
                        self.admin_ok("SWITCH").await
                    }
                    Err(err) => error_response(&mut self.write, &err.to_string(), "F0000").await,
                }
            }
            _ => {
                error_response(
                    &mut self.write,
                    &format!("unrecognized admin command: {normalized}"),
                    "42601",
                )
                .await
            }
        }
    }

    async fn admin_flush(&mut self, tokens: &[&str], upper: &str) -> Result<(), Error> {
        let mode = if upper.starts_with("FLUSH ALL") {
            FlushMode::All
        } else if upper.starts_with("FLUSH GRACEFULLY") {
            FlushMode::Gracefully
        } else {
            FlushMode::Idle
        };

        // FLUSH [mode] [database]; the database defaults to every pool.
        let database = match tokens.len() {
            3 => tokens[2].to_string(),
            2 if mode == FlushMode::Idle && !tokens[1].eq_ignore_ascii_case("idle") => {
                tokens[1].to_string()
            }
            _ => "*".to_string(),
        };

        match get_pool() {
            Some(pool) => {
                pool.flush(mode, &database);
                self.admin_ok("FLUSH").await
            }
            None => error_response(&mut self.write, "pool is not running", "F0000").await,
        }
    }

    async fn admin_ok(&mut self, tag: &str) -> Result<(), Error> {
        let mut buf = command_complete(tag);
        buf.extend_from_slice(&ready_for_query(false));
        write_all_flush(&mut self.write, &buf).await
    }
}
