// The session pipeline: the backend slot acquired at startup is pinned for
// the whole client session and frames are forwarded without interpretation.
// The only frames looked at are 'Q'/'E' (query counting), 'Z' (transaction
// state), 'X' (clean termination, not forwarded) and server errors carrying
// FATAL/PANIC severity.

use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::AsyncBufReadExt;

use crate::client::core::SessionOutcome;
use crate::client::{registry, Client};
use crate::config::get_config;
use crate::errors::Error;
use crate::messages::{read_message, write_all_flush, FrameScanner};
use crate::pool::SlotLease;
use crate::servers;
use crate::stats;

enum Side {
    ClientReadable(std::io::Result<usize>),
    Server(Result<usize, Error>),
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub async fn run_session(&mut self, mut lease: SlotLease<'static>) -> SessionOutcome {
        let mut server_buf = BytesMut::with_capacity(8192);
        let mut scanner = FrameScanner::new();
        let mut events = Vec::new();
        let mut in_tx = false;
        let mut fatal = false;

        loop {
            let side = tokio::select! {
                readable = self.read.fill_buf() => Side::ClientReadable(readable.map(|buf| buf.len())),
                chunk = lease.conn().read_chunk(&mut server_buf) => Side::Server(chunk),
            };

            match side {
                Side::ClientReadable(Ok(0)) => {
                    // Clean TCP close; most clients skip Terminate.
                    debug!("Client {} closed the connection", self.addr);
                    lease.release(false).await;
                    return SessionOutcome::Success;
                }

                Side::ClientReadable(Ok(_)) => {
                    let frame = match read_message(&mut self.read).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            lease.release(false).await;
                            return SessionOutcome::Success;
                        }
                        Err(err) => {
                            warn!("Client {} read error: {err}", self.addr);
                            lease.kill();
                            return SessionOutcome::ClientFailure;
                        }
                    };

                    registry::touch(self.id);

                    match frame[0] {
                        b'X' => {
                            debug!("Client {} sent Terminate", self.addr);
                            lease.release(false).await;
                            return SessionOutcome::Success;
                        }
                        b'Q' | b'E' => {
                            stats::query();
                            registry::set_active(self.id, true);
                        }
                        _ => (),
                    }

                    if lease.conn().send(&frame).await.is_err() {
                        return self.server_went_away(lease).await;
                    }
                }

                Side::ClientReadable(Err(err)) => {
                    warn!("Client {} socket error: {err}", self.addr);
                    lease.kill();
                    return SessionOutcome::ClientFailure;
                }

                Side::Server(Ok(0)) => {
                    warn!("Server closed the connection on {}", self.addr);
                    lease.kill();
                    return SessionOutcome::ServerFailure;
                }

                Side::Server(Ok(_)) => {
                    events.clear();
                    scanner.scan(&server_buf, &mut events);

                    for event in &events {
                        match event.kind {
                            b'Z' => {
                                let state =
                                    event.peek_bytes().first().copied().unwrap_or(b'I');
                                if state != b'I' && !in_tx {
                                    in_tx = true;
                                } else if state == b'I' && in_tx {
                                    in_tx = false;
                                    stats::transaction();
                                }
                                registry::set_active(self.id, false);
                            }
                            b'E' => {
                                // Severity sits right behind the 'S' field tag.
                                let peek = event.peek_bytes();
                                if peek.len() > 6
                                    && (&peek[1..6] == b"FATAL" || &peek[1..6] == b"PANIC")
                                {
                                    fatal = true;
                                }
                            }
                            _ => (),
                        }
                    }

                    if write_all_flush(&mut self.write, &server_buf).await.is_err() {
                        warn!("Write to client {} failed", self.addr);
                        lease.kill();
                        return SessionOutcome::ClientFailure;
                    }
                    server_buf.clear();

                    if fatal {
                        warn!("Server reported FATAL on {}", self.addr);
                        lease.kill();
                        return SessionOutcome::ServerFatal;
                    }
                }

                Side::Server(Err(err)) => {
                    warn!("Server read error on {}: {err}", self.addr);
                    lease.kill();
                    return SessionOutcome::ServerFailure;
                }
            }
        }
    }

    /// A write to the backend failed mid-session. Run failover when it is
    /// configured; either way the slot is dead.
    pub(crate) async fn server_went_away(
        &mut self,
        lease: SlotLease<'static>,
    ) -> SessionOutcome {
        let config = get_config();
        let server = lease.server_index();

        lease.kill();

        if config.general.failover {
            let _ = servers::force_failover(server).await;
            let _ = crate::messages::server_failover_error(&mut self.write).await;
            SessionOutcome::Failover
        } else {
            SessionOutcome::ServerFailure
        }
    }
}
