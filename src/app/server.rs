//! The supervisor: listeners, the accept loop, signal handling, sweeps and
//! graceful shutdown.

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use socket2::SockRef;
use tokio::net::{TcpSocket, UnixListener};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::Notify;

use crate::app::args::Args;
use crate::app::tls::init_tls;
use crate::client::{self, registry, SessionOutcome};
use crate::config::{get_config, reload_config, Config};
use crate::pool::{self, get_pool, sweep, FlushMode};
use crate::server::cancel;
use crate::servers;
use crate::stats;

/// Global flag indicating graceful shutdown is in progress.
pub static SHUTDOWN_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

static SHUTDOWN_NOTIFY: Lazy<Notify> = Lazy::new(Notify::new);

/// Ask the supervisor to begin a graceful shutdown; used by the admin
/// console's SHUTDOWN verb.
pub fn request_shutdown() {
    SHUTDOWN_NOTIFY.notify_one();
}

pub fn run_server(_args: Args, config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    let tls_acceptor = init_tls(&config)?;

    let mut runtime_builder = Builder::new_multi_thread();
    runtime_builder
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("worker-pg-warden");

    let runtime = runtime_builder.build()?;

    runtime.block_on(async move {
        servers::init_servers(&config.servers);
        pool::init_pool(config.general.max_connections, &config.limits);

        // TCP listener.
        let addr = format!("{}:{}", config.general.host, config.general.port)
            .to_socket_addrs()
            .expect("listen address resolves")
            .next()
            .expect("listen address resolves");

        let listen_socket = if addr.is_ipv4() {
            TcpSocket::new_v4().expect("can't create socket")
        } else {
            TcpSocket::new_v6().expect("can't create socket")
        };
        listen_socket.set_reuseaddr(true).expect("can't set reuseaddr");
        listen_socket.set_nodelay(true).expect("can't set nodelay");
        {
            let sock_ref = SockRef::from(&listen_socket);
            sock_ref
                .set_linger(Some(Duration::from_secs(0)))
                .expect("could not configure tcp_so_linger for socket");
        }
        listen_socket.bind(addr).expect("can't bind");

        let listener = match listen_socket.listen(config.general.max_connections as u32) {
            Ok(sock) => sock,
            Err(err) => {
                error!("Listener socket error: {err:?}");
                std::process::exit(exitcode::CONFIG);
            }
        };

        // Optional Unix listener, named the way the server names its own.
        let unix_listener: Option<UnixListener> = match config.general.unix_socket_dir {
            Some(ref dir) => {
                let path = format!("{dir}/.s.PGSQL.{}", config.general.port);
                let _ = std::fs::remove_file(&path);
                match UnixListener::bind(&path) {
                    Ok(listener) => {
                        info!("Listening on {path}");
                        Some(listener)
                    }
                    Err(err) => {
                        error!("Could not bind {path}: {err}");
                        std::process::exit(exitcode::CONFIG);
                    }
                }
            }
            None => None,
        };

        info!("Running on {addr}");
        config.show();

        // Warm the pool before the first client shows up.
        sweep::prefill_if_can(true);

        tokio::task::spawn(sweep::run_sweeps());

        if config.general.disconnect_client > 0 {
            tokio::task::spawn(disconnect_client_sweep());
        }

        let mut term_signal = unix_signal(SignalKind::terminate()).unwrap();
        let mut interrupt_signal = unix_signal(SignalKind::interrupt()).unwrap();
        let mut sighup_signal = unix_signal(SignalKind::hangup()).unwrap();

        let mut listener = Some(listener);

        info!("Waiting for clients");
        loop {
            let accept_future = async {
                match listener {
                    Some(ref l) => l.accept().await,
                    None => std::future::pending().await,
                }
            };
            let unix_accept_future = async {
                match unix_listener {
                    Some(ref l) if listener.is_some() => l.accept().await,
                    _ => std::future::pending().await,
                }
            };

            tokio::select! {
                // Reload config: kill -SIGHUP $(pgrep pg_warden)
                _ = sighup_signal.recv() => {
                    info!("Reloading config");
                    let _ = reload_config().await;
                    get_config().show();
                },

                _ = term_signal.recv() => {
                    info!("Got SIGTERM, starting graceful shutdown");
                    listener = None;
                    if graceful_shutdown().await {
                        break;
                    }
                },

                _ = SHUTDOWN_NOTIFY.notified() => {
                    info!("Shutdown requested, starting graceful shutdown");
                    listener = None;
                    if graceful_shutdown().await {
                        break;
                    }
                },

                _ = interrupt_signal.recv() => {
                    info!("Got SIGINT, closing immediately");
                    break;
                },

                new_client = accept_future => {
                    match new_client {
                        Ok((socket, peer)) => {
                            crate::messages::configure_tcp_socket(&socket);
                            let tls_acceptor = tls_acceptor.clone();
                            spawn_client(move |id| async move {
                                client::client_entrypoint(socket, peer, id, tls_acceptor).await
                            }, peer.to_string());
                        }
                        Err(err) => {
                            error!("accept error: {err:?}");
                            continue;
                        }
                    }
                },

                new_client = unix_accept_future => {
                    match new_client {
                        Ok((socket, _)) => {
                            spawn_client(move |id| async move {
                                client::client_entrypoint_unix(socket, id).await
                            }, "unix".to_string());
                        }
                        Err(err) => {
                            error!("unix accept error: {err:?}");
                            continue;
                        }
                    }
                },
            }
        }

        // Push every cached backend out before the process exits.
        if let Some(pool) = get_pool() {
            pool.flush(FlushMode::Gracefully, "*");
        }

        info!("Shutting down...");
    });

    Ok(())
}

/// Spawn one client task and register it so flush ALL and the
/// disconnect-client sweep can reach it.
fn spawn_client<F, Fut>(entry: F, addr: String)
where
    F: FnOnce(i64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<SessionOutcome, crate::errors::Error>>
        + Send
        + 'static,
{
    let id = pool::next_client_id();
    stats::TOTAL_CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);

    let task_addr = addr.clone();
    let handle = tokio::task::spawn(async move {
        let start = chrono::offset::Utc::now().naive_utc();

        match entry(id).await {
            Ok(outcome) => {
                stats::session_finished(outcome);
                let duration = chrono::offset::Utc::now().naive_utc() - start;
                debug!(
                    "Client {task_addr} disconnected ({outcome:?}), session duration: {}",
                    crate::format_duration(&duration)
                );
            }
            Err(err) => {
                let duration = chrono::offset::Utc::now().naive_utc() - start;
                warn!(
                    "Client {task_addr} disconnected with error {err}, duration: {}",
                    crate::format_duration(&duration)
                );
            }
        }

        registry::unregister(id);
    });

    registry::register(id, addr, String::new(), String::new(), handle.abort_handle());
}

/// Wait for live clients to drain. Returns true when the supervisor should
/// exit.
async fn graceful_shutdown() -> bool {
    SHUTDOWN_IN_PROGRESS.store(true, Ordering::SeqCst);

    let timeout = Duration::from_secs(get_config().general.shutdown_timeout);
    let start = std::time::Instant::now();

    loop {
        let clients = registry::count();
        if clients == 0 {
            info!("All clients disconnected, shutting down");
            return true;
        }
        if start.elapsed() >= timeout {
            error!("Graceful shutdown timed out with {clients} clients connected");
            return true;
        }

        info!("Waiting for {clients} client{}", if clients == 1 { "" } else { "s" });
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Cancel and drop clients idle beyond `disconnect_client` seconds. The
/// cancel goes to the backend first so an in-flight query dies with the
/// client.
async fn disconnect_client_sweep() {
    loop {
        let config = get_config();
        let threshold = config.general.disconnect_client;
        if threshold == 0 {
            return;
        }

        tokio::time::sleep(Duration::from_secs(threshold.max(1))).await;

        for id in registry::idle_clients(threshold, config.general.disconnect_client_force) {
            if let Some(pool) = get_pool() {
                if let Some((server, pid, secret)) = pool.find_slot_by_owner(id) {
                    if let Err(err) = cancel::cancel(server, pid, secret).await {
                        warn!("Cancel for idle client {id} failed: {err}");
                    }
                }
            }
            registry::disconnect(id);
        }
    }
}
