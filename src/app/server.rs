use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpSocket;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::runtime::Builder;

use crate::app::args::Args;
use crate::config::Config;
use crate::handler;
use crate::metrics::start_metrics_server;
use crate::pool;
use crate::protocol::configure_tcp_socket;

/// Global counter for clients currently connected to the proxy.
pub static CURRENT_CLIENT_COUNT: AtomicI64 = AtomicI64::new(0);

/// Global flag indicating graceful shutdown is in progress.
pub static SHUTDOWN_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub fn run_server(_args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .enable_all()
        .thread_name("worker-aproxy")
        .build()?;

    runtime.block_on(async move {
        let addr = match format!("{}:{}", config.server.host, config.server.port).to_socket_addrs()
        {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    error!("listen address resolves to nothing");
                    std::process::exit(exitcode::CONFIG);
                }
            },
            Err(err) => {
                error!("can't resolve listen address: {err}");
                std::process::exit(exitcode::CONFIG);
            }
        };

        let listen_socket = if addr.is_ipv4() {
            TcpSocket::new_v4().expect("can't create listen socket")
        } else {
            TcpSocket::new_v6().expect("can't create listen socket")
        };
        listen_socket
            .set_reuseaddr(true)
            .expect("can't set reuseaddr");
        listen_socket.set_nodelay(true).expect("can't set nodelay");
        listen_socket.bind(addr).expect("can't bind");
        let listener = match listen_socket.listen(1024) {
            Ok(sock) => sock,
            Err(err) => {
                error!("listener socket error: {err:?}");
                std::process::exit(exitcode::CONFIG);
            }
        };

        info!("Running on {addr}");
        config.show();

        if let Err(err) = pool::init_from_config().await {
            error!("pool initialization failed: {err}");
            std::process::exit(exitcode::CONFIG);
        }
        if let Err(err) = pool::get_pool().ping().await {
            warn!("backend is not reachable at startup: {err}");
        }

        if config.observability.metrics_port != 0 {
            let host = config.observability.metrics_host.clone();
            let port = config.observability.metrics_port;
            tokio::spawn(async move {
                start_metrics_server(&host, port).await;
            });
        }

        #[cfg(unix)]
        let mut sigterm = unix_signal(SignalKind::terminate()).expect("can't install SIGTERM");

        loop {
            #[cfg(unix)]
            let terminate = sigterm.recv();
            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Got SIGINT, shutting down");
                    break;
                }
                _ = terminate => {
                    info!("Got SIGTERM, shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                // The counter gates shutdown; decrement even
                                // if the handler panics.
                                let _count = scopeguard::guard((), |_| {
                                    CURRENT_CLIENT_COUNT.fetch_sub(1, Ordering::SeqCst);
                                });
                                configure_tcp_socket(&stream);
                                info!("client {peer} connected");
                                match handler::handle_client(stream, peer).await {
                                    Ok(()) => info!("client {peer} disconnected"),
                                    Err(err) => warn!("client {peer} closed: {err}"),
                                }
                            });
                        }
                        Err(err) => {
                            error!("accept failed: {err}");
                        }
                    }
                }
            }
        }

        SHUTDOWN_IN_PROGRESS.store(true, Ordering::SeqCst);
        drop(listener);

        // In-flight commands get a grace period, then we go down anyway.
        let deadline = Duration::from_millis(config.server.shutdown_timeout);
        let started = std::time::Instant::now();
        while CURRENT_CLIENT_COUNT.load(Ordering::SeqCst) > 0 && started.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = CURRENT_CLIENT_COUNT.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("shutdown grace period expired with {remaining} clients still connected");
        }
        pool::get_pool().close();
        info!("bye");
    });

    Ok(())
}
