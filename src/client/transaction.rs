// The transaction pipeline: the worker holds no slot while the client is
// idle. The first client frame acquires one; ReadyForQuery with state 'I'
// gives it back. Named Parse messages set the deallocate bit so the slot is
// scrubbed of prepared statements before the next client sees it.

use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::AsyncBufReadExt;

use crate::client::core::SessionOutcome;
use crate::client::{registry, Client};
use crate::errors::Error;
use crate::messages::{pool_full_error, read_message, write_all_flush, FrameScanner};
use crate::pool::{get_pool, SlotLease};
use crate::stats;
use crate::utils::clock;

enum Side {
    ClientReadable(std::io::Result<usize>),
    Server(Result<usize, Error>),
}

/// A Parse ('P') frame carrying a non-empty statement name leaves a prepared
/// statement on the backend.
fn is_named_parse(frame: &BytesMut) -> bool {
    frame[0] == b'P' && frame.len() > 5 && frame[5] != 0
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub async fn run_transaction(&mut self) -> SessionOutcome {
        let Some(pool) = get_pool() else {
            return SessionOutcome::ServerFailure;
        };

        // Idle phase: no slot, just the client.
        loop {
            let frame = match read_message(&mut self.read).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return SessionOutcome::Success,
                Err(err) => {
                    warn!("Client {} read error: {err}", self.addr);
                    return SessionOutcome::ClientFailure;
                }
            };

            registry::touch(self.id);

            if frame[0] == b'X' {
                debug!("Client {} sent Terminate", self.addr);
                return SessionOutcome::Success;
            }

            // First frame of a transaction: get a backend now.
            let lease = match pool
                .get_connection(&self.username, &self.database, true, true, self.id)
                .await
            {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(
                        "Failed to get connection for {}/{}: {err}",
                        self.username, self.database
                    );
                    let _ = pool_full_error(&mut self.write).await;
                    return SessionOutcome::ServerFailure;
                }
            };

            registry::set_active(self.id, true);

            match self.drive_transaction(lease, frame).await {
                Ok(()) => {
                    registry::set_active(self.id, false);
                }
                Err(outcome) => return outcome,
            }
        }
    }

    /// Hold the slot from the first frame until ReadyForQuery says idle.
    /// `Ok(())` means the slot went back FREE and the client lives on; an
    /// `Err` carries the session outcome.
    async fn drive_transaction(
        &mut self,
        mut lease: SlotLease<'static>,
        first_frame: BytesMut,
    ) -> Result<(), SessionOutcome> {
        let started_at = clock::now();
        let mut deallocate = is_named_parse(&first_frame);
        let mut in_tx = false;
        let mut fatal = false;

        let mut server_buf = BytesMut::with_capacity(8192);
        let mut scanner = FrameScanner::new();
        let mut events = Vec::new();

        if matches!(first_frame[0], b'Q' | b'E') {
            stats::query();
        }

        if lease.conn().send(&first_frame).await.is_err() {
            return Err(self.server_went_away(lease).await);
        }

        loop {
            let side = tokio::select! {
                readable = self.read.fill_buf() => Side::ClientReadable(readable.map(|buf| buf.len())),
                chunk = lease.conn().read_chunk(&mut server_buf) => Side::Server(chunk),
            };

            match side {
                Side::ClientReadable(Ok(0)) => {
                    // Client vanished mid-transaction; scrub and give back.
                    debug!("Client {} closed mid-transaction", self.addr);
                    if in_tx {
                        let _ = lease.conn().rollback().await;
                    }
                    lease.release(true).await;
                    return Err(SessionOutcome::Success);
                }

                Side::ClientReadable(Ok(_)) => {
                    let frame = match read_message(&mut self.read).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            if in_tx {
                                let _ = lease.conn().rollback().await;
                            }
                            lease.release(true).await;
                            return Err(SessionOutcome::Success);
                        }
                        Err(err) => {
                            warn!("Client {} read error: {err}", self.addr);
                            lease.kill();
                            return Err(SessionOutcome::ClientFailure);
                        }
                    };

                    registry::touch(self.id);

                    match frame[0] {
                        b'X' => {
                            debug!("Client {} sent Terminate in transaction", self.addr);
                            if in_tx {
                                let _ = lease.conn().rollback().await;
                            }
                            lease.release(true).await;
                            return Err(SessionOutcome::Success);
                        }
                        b'Q' | b'E' => stats::query(),
                        b'P' => {
                            if is_named_parse(&frame) {
                                deallocate = true;
                            }
                        }
                        _ => (),
                    }

                    if lease.conn().send(&frame).await.is_err() {
                        return Err(self.server_went_away(lease).await);
                    }
                }

                Side::ClientReadable(Err(err)) => {
                    warn!("Client {} socket error: {err}", self.addr);
                    lease.kill();
                    return Err(SessionOutcome::ClientFailure);
                }

                Side::Server(Ok(0)) => {
                    warn!("Server closed mid-transaction on {}", self.addr);
                    lease.kill();
                    return Err(SessionOutcome::ServerFailure);
                }

                Side::Server(Ok(_)) => {
                    events.clear();
                    scanner.scan(&server_buf, &mut events);

                    for event in &events {
                        match event.kind {
                            b'Z' => {
                                let state =
                                    event.peek_bytes().first().copied().unwrap_or(b'I');
                                in_tx = state != b'I';
                            }
                            b'E' => {
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

                    // The slot is returned the moment ReadyForQuery reports
                    // idle and nothing trails it in the stream.
                    let transaction_over = events
                        .last()
                        .map(|event| {
                            event.kind == b'Z'
                                && event.peek_bytes().first() == Some(&b'I')
                        })
                        .unwrap_or(false);

                    if write_all_flush(&mut self.write, &server_buf).await.is_err() {
                        warn!("Write to client {} failed", self.addr);
                        lease.kill();
                        return Err(SessionOutcome::ClientFailure);
                    }
                    server_buf.clear();

                    // The transaction is over only when the chunk ended
                    // exactly on the ReadyForQuery boundary.
                    if transaction_over && scanner.at_boundary() {
                        if fatal {
                            lease.kill();
                            return Err(SessionOutcome::ServerFatal);
                        }

                        if deallocate {
                            if lease.conn().deallocate_all().await.is_err() {
                                lease.kill();
                                return Err(SessionOutcome::ServerFailure);
                            }
                        }

                        stats::transaction();
                        stats::query_time(started_at.elapsed().as_micros() as u64);
                        lease.release(true).await;
                        return Ok(());
                    }

                    if fatal && scanner.at_boundary() {
                        lease.kill();
                        return Err(SessionOutcome::ServerFatal);
                    }
                }

                Side::Server(Err(err)) => {
                    warn!("Server read error on {}: {err}", self.addr);
                    lease.kill();
                    return Err(SessionOutcome::ServerFailure);
                }
            }
        }
    }
}
