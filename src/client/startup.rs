// Client startup: parse the startup packet, run the HBA-selected
// authentication exchange, log in to a backend slot, and replay its captured
// startup trace so the client reaches ReadyForQuery.

use bytes::{BufMut, BytesMut};
use log::{info, warn};
use std::net::IpAddr;
use tokio::io::BufReader;

use crate::auth::hba::AuthMethod;
use crate::auth::scram::ServerExchange;
use crate::client::registry;
use crate::client::Client;
use crate::config::{self, get_config, VERSION};
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{
    auth_ok_message, backend_key_data, error_response_terminal, md5_challenge,
    md5_hash_password, parse_startup, plain_password_challenge, pool_full_error, read_password,
    ready_for_query, scram_server_response, scram_start_challenge, server_failover_error,
    wrong_password, write_all_flush,
};
use crate::pool::{get_pool, SlotLease};

/// Databases that select the admin console instead of a backend.
const ADMIN_DATABASES: [&str; 2] = ["pgwarden", "pgbouncer"];

/// Strip the trailing NUL of a password message payload.
fn password_str(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

/// A random password stands in for unknown users, so the exchange runs to
/// completion and fails without revealing whether the user exists.
fn decoy_password() -> String {
    let raw: [u8; 16] = rand::random();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, raw)
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Handle Postgres client startup after transport negotiation is
    /// complete. On success the client has seen AuthenticationOk and
    /// ReadyForQuery, and holds a backend slot unless it is an admin.
    #[allow(clippy::too_many_arguments)]
    pub async fn startup(
        read: S,
        write: T,
        ip: Option<IpAddr>,
        addr: String,
        id: i64,
        bytes: BytesMut,
        tls: bool,
    ) -> Result<(Client<S, T>, Option<SlotLease<'static>>), Error> {
        let config = get_config();
        let parameters = parse_startup(bytes)?;

        // Mandatory by the protocol.
        let username = match parameters.get("user") {
            Some(user) => user.clone(),
            None => return Err(Error::ClientBadStartup),
        };

        let database = parameters
            .get("database")
            .unwrap_or(&username)
            .to_string();

        let appname = parameters
            .get("application_name")
            .cloned()
            .unwrap_or_else(|| "pg_warden".to_string());

        let admin = ADMIN_DATABASES.contains(&database.as_str());

        let mut client = Client {
            read: BufReader::new(read),
            write,
            ip,
            addr,
            id,
            username: username.clone(),
            database: database.clone(),
            appname: appname.clone(),
            admin,
        };

        if admin {
            client.authenticate_admin().await?;
            client.finish_admin_startup().await?;
            return Ok((client, None));
        }

        // HBA decides the method; the users file provides the credential.
        let method = match client.hba_method(tls) {
            Ok(method) => method,
            Err(err) => {
                error_response_terminal(
                    &mut client.write,
                    &format!(
                        "no pg_hba entry for user \"{username}\", database \"{database}\""
                    ),
                    SQLSTATE_INVALID_AUTHORIZATION,
                )
                .await?;
                return Err(err);
            }
        };
        if let Err(err) = client.authenticate(method).await {
            warn!("Authentication failed for {username}@{}: {err}", client.addr);
            return Err(err);
        }

        // Backend login: acquire a slot, creating one if the pool allows it.
        let pool = get_pool().ok_or(Error::ShuttingDown)?;
        let mut lease = match pool
            .get_connection(&username, &database, true, false, id)
            .await
        {
            Ok(lease) => lease,
            Err(Error::PoolFull) => {
                pool_full_error(&mut client.write).await?;
                return Err(Error::PoolFull);
            }
            Err(Error::AllServersDown) => {
                server_failover_error(&mut client.write).await?;
                return Err(Error::AllServersDown);
            }
            Err(err) => {
                error_response_terminal(
                    &mut client.write,
                    "connection refused",
                    SQLSTATE_TOO_MANY_CONNECTIONS,
                )
                .await?;
                return Err(err);
            }
        };

        pool.slot(lease.slot()).meta.lock().appname = appname.clone();

        // Replay the captured startup trace: the client reaches
        // AuthenticationOk and ReadyForQuery without backend traffic.
        let mut buf = auth_ok_message();
        buf.put_slice(lease.conn().startup_trace());
        write_all_flush(&mut client.write, &buf).await?;

        registry::set_identity(id, &username, &database);
        if config.general.log_client_connections {
            info!(
                "Client {} connected as {}/{} application {} ({})",
                client.addr,
                username,
                database,
                client.appname,
                if tls { "tls" } else { "plain" }
            );
        }

        Ok((client, Some(lease)))
    }

    /// First matching HBA entry decides; no entry is a hard reject.
    fn hba_method(&self, ssl: bool) -> Result<AuthMethod, Error> {
        let config = get_config();

        if config.general.hba_file.is_none() {
            // No HBA configured: challenge known users, trust the rest.
            return Ok(if config::user_known(&self.username) {
                AuthMethod::Md5
            } else {
                AuthMethod::Trust
            });
        }

        match config
            .hba
            .lookup(self.ip, ssl, &self.username, &self.database)
        {
            Some(AuthMethod::Reject) | None => Err(Error::HbaForbiddenError(format!(
                "no pg_hba entry for host {:?}, user {}, database {}",
                self.ip, self.username, self.database
            ))),
            Some(method) => Ok(method),
        }
    }

    async fn authenticate(&mut self, method: AuthMethod) -> Result<(), Error> {
        let method = match method {
            AuthMethod::Any => {
                if config::user_known(&self.username) {
                    AuthMethod::Md5
                } else {
                    AuthMethod::Trust
                }
            }
            method => method,
        };

        match method {
            AuthMethod::Trust => Ok(()),
            AuthMethod::Password => self.authenticate_password().await,
            AuthMethod::Md5 => self.authenticate_md5().await,
            AuthMethod::ScramSha256 => self.authenticate_scram().await,
            AuthMethod::Reject | AuthMethod::Any => unreachable!("resolved above"),
        }
    }

    async fn authenticate_password(&mut self) -> Result<(), Error> {
        let stored = config::user_password(&self.username);
        let known = stored.is_some();
        let stored = stored.unwrap_or_else(decoy_password);

        plain_password_challenge(&mut self.write).await?;
        let response = read_password(&mut self.read).await?;

        if !known || password_str(&response) != stored {
            wrong_password(&mut self.write, &self.username).await?;
            return Err(Error::AuthError(format!(
                "password authentication failed for {}",
                self.username
            )));
        }

        Ok(())
    }

    async fn authenticate_md5(&mut self) -> Result<(), Error> {
        let stored = config::user_password(&self.username);
        let known = stored.is_some();
        let stored = stored.unwrap_or_else(decoy_password);

        let salt = md5_challenge(&mut self.write).await?;
        let response = read_password(&mut self.read).await?;

        let expected = md5_hash_password(&self.username, &stored, &salt);
        if !known || expected != response {
            wrong_password(&mut self.write, &self.username).await?;
            return Err(Error::AuthError(format!(
                "md5 authentication failed for {}",
                self.username
            )));
        }

        Ok(())
    }

    async fn authenticate_scram(&mut self) -> Result<(), Error> {
        let stored = config::user_password(&self.username);
        let known = stored.is_some();
        let stored = stored.unwrap_or_else(decoy_password);

        let mut exchange = ServerExchange::new(&stored);

        scram_start_challenge(&mut self.write).await?;

        // SASLInitialResponse: mechanism name, an i32 payload length, then
        // client-first-message.
        let initial = read_password(&mut self.read).await?;
        let mechanism_end = initial
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::ProtocolSyncError("bad SASLInitialResponse".into()))?;
        let mechanism = String::from_utf8_lossy(&initial[..mechanism_end]);
        if mechanism != SCRAM_SHA_256 {
            error_response_terminal(
                &mut self.write,
                "unsupported SASL mechanism",
                SQLSTATE_INVALID_AUTHORIZATION,
            )
            .await?;
            return Err(Error::AuthError(format!(
                "unsupported SASL mechanism {mechanism}"
            )));
        }
        if initial.len() < mechanism_end + 5 {
            return Err(Error::ProtocolSyncError("bad SASLInitialResponse".into()));
        }
        let client_first = String::from_utf8_lossy(&initial[mechanism_end + 5..]).to_string();

        let server_first = match exchange.handle_client_first(&client_first) {
            Ok(server_first) => server_first,
            Err(err) => {
                wrong_password(&mut self.write, &self.username).await?;
                return Err(err);
            }
        };
        scram_server_response(&mut self.write, SASL_CONTINUE, &server_first).await?;

        let final_message = read_password(&mut self.read).await?;
        let client_final = String::from_utf8_lossy(&final_message).to_string();

        let server_final = match exchange.handle_client_final(&client_final) {
            Ok(server_final) if known => server_final,
            _ => {
                wrong_password(&mut self.write, &self.username).await?;
                return Err(Error::AuthError(format!(
                    "SCRAM authentication failed for {}",
                    self.username
                )));
            }
        };
        scram_server_response(&mut self.write, SASL_FINAL, &server_final).await?;

        Ok(())
    }

    /// Admin clients get synthesized parameters; there is no backend behind
    /// the console.
    async fn finish_admin_startup(&mut self) -> Result<(), Error> {
        let mut buf = auth_ok_message();

        for (key, value) in [
            ("client_encoding", "UTF8"),
            ("server_encoding", "UTF8"),
            ("server_version", VERSION),
            ("application_name", "pg_warden"),
            ("DateStyle", "ISO, MDY"),
            ("TimeZone", "Etc/UTC"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
        ] {
            buf.put_u8(b'S');
            buf.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }

        buf.put(backend_key_data(rand::random(), rand::random()));
        buf.put(ready_for_query(false));

        write_all_flush(&mut self.write, &buf).await
    }

    /// Admin console access authenticates with md5 against the configured
    /// admin credentials.
    pub(crate) async fn authenticate_admin(&mut self) -> Result<(), Error> {
        let config = get_config();

        let salt = md5_challenge(&mut self.write).await?;
        let response = read_password(&mut self.read).await?;

        let expected = md5_hash_password(
            &config.general.admin_username,
            &config.general.admin_password,
            &salt,
        );

        if expected != response || self.username != config.general.admin_username {
            wrong_password(&mut self.write, &self.username).await?;
            return Err(Error::AuthError(format!(
                "admin authentication failed for {}",
                self.username
            )));
        }

        Ok(())
    }
}
