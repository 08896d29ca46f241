/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::server::{Listener, ServerProtocol},
    listener::{
        limiter::{ConcurrencyLimiter, InFlight},
        tracker::{CLEANUP_INTERVAL_SECS, STALE_AGE_SECS},
    },
    Server,
};

pub mod limiter;
pub mod tracker;

pub struct ServerInstance {
    pub id: String,
    pub listener_id: u16,
    pub protocol: ServerProtocol,
    pub hostname: String,
    pub greeting: String,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub is_tls_implicit: bool,
    pub limiter: ConcurrencyLimiter,
    pub shutdown_rx: watch::Receiver<bool>,
    pub config: Listener,
}

pub trait SessionManager: Clone + Send + Sync + 'static {
    fn handle(
        self,
        server: Server,
        instance: Arc<ServerInstance>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        in_flight: InFlight,
    ) -> impl Future<Output = ()> + Send;
}

/// Binds every configured listener and runs its accept loop until the
/// returned shutdown channel fires.
pub fn spawn_listeners<M: SessionManager>(
    server: Server,
    manager: M,
) -> Result<watch::Sender<bool>, String> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tls_acceptor = match &server.core.server.tls {
        Some(tls) => Some(tls.build_acceptor()?),
        None => None,
    };

    for (listener_id, config) in server.core.server.effective_listeners().into_iter().enumerate() {
        let instance = Arc::new(ServerInstance {
            id: config.id.clone(),
            listener_id: listener_id as u16,
            protocol: config.protocol,
            hostname: server.core.server.hostname.clone(),
            greeting: server.core.server.greeting.clone(),
            tls_acceptor: tls_acceptor.clone(),
            is_tls_implicit: config.implicit_tls,
            limiter: ConcurrencyLimiter::new(config.max_pool),
            shutdown_rx: shutdown_rx.clone(),
            config: config.clone(),
        });

        for addr in &config.bind {
            let listener = bind_with_backlog(*addr, config.backlog)
                .map_err(|err| format!("failed to bind {addr}: {err}"))?;
            tokio::spawn(accept_loop(
                listener,
                server.clone(),
                instance.clone(),
                manager.clone(),
            ));
            tracing::info!(listener = %instance.id, %addr, "listener started");
        }
    }

    spawn_tracker_maintenance(server, shutdown_rx);

    Ok(shutdown_tx)
}

fn bind_with_backlog(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog.max(1))
}

async fn accept_loop<M: SessionManager>(
    listener: TcpListener,
    server: Server,
    instance: Arc<ServerInstance>,
    manager: M,
) {
    let mut shutdown_rx = instance.shutdown_rx.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        accept_connection(
                            &server,
                            &instance,
                            &manager,
                            stream,
                            remote_addr,
                        );
                    }
                    Err(err) => {
                        tracing::debug!(listener = %instance.id, %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!(listener = %instance.id, "listener stopped");
                break;
            }
        }
    }
}

fn accept_connection<M: SessionManager>(
    server: &Server,
    instance: &Arc<ServerInstance>,
    manager: &M,
    stream: TcpStream,
    remote_addr: SocketAddr,
) {
    let ip = remote_addr.ip();

    if server.is_ip_blocked(&ip) {
        tracing::debug!(remote = %ip, "connection from blocked address dropped");
        tokio::spawn(reject(stream, b"554 5.7.1 Service unavailable.\r\n"));
        return;
    }

    if let Err(reason) = server
        .inner
        .data
        .tracker
        .try_accept(ip, &instance.config.dos)
    {
        tracing::debug!(remote = %ip, ?reason, "connection denied by limits");
        tokio::spawn(reject(stream, b"421 4.7.0 Too many connections.\r\n"));
        return;
    }

    let in_flight = match instance.limiter.is_allowed() {
        Some(in_flight) => in_flight,
        None => {
            server.inner.data.tracker.release(ip);
            tokio::spawn(reject(
                stream,
                b"421 4.3.2 All server ports are busy, try again later.\r\n",
            ));
            return;
        }
    };

    tokio::spawn(manager.clone().handle(
        server.clone(),
        instance.clone(),
        stream,
        remote_addr,
        in_flight,
    ));
}

async fn reject(mut stream: TcpStream, reply: &'static [u8]) {
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.write_all(reply)).await;
    let _ = stream.shutdown().await;
}

/// Periodic tracker cleanup, stopped by the same shutdown channel as the
/// listeners.
fn spawn_tracker_maintenance(server: Server, mut shutdown_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    server.inner.data.tracker.cleanup(STALE_AGE_SECS);
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}
