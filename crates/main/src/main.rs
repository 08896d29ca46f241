/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{process::exit, time::Duration};

use common::{
    config::Config,
    dns::Resolvers,
    ipc::{build_ipc, QueueEvent},
    listener::spawn_listeners,
    policy::Hooks,
    Core, Server, DAEMON_NAME,
};
use smtp::{core::SmtpSessionManager, queue::manager::QueueManager};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/relay-mta/config.json".to_string());
    let config = match std::fs::read_to_string(&config_path)
        .map_err(|err| format!("failed to read {config_path}: {err}"))
        .and_then(|contents| Config::parse(&contents))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            exit(1);
        }
    };

    let core = Core {
        server: config.server,
        queue: config.queue,
        rules: config.rules,
        resolvers: Resolvers::new_system(),
        hooks: Hooks::default(),
    };

    let (ipc, mut ipc_rxs) = build_ipc();
    let server = Server::with_ipc(core, ipc);

    tracing::info!(name = DAEMON_NAME, "starting");

    let queue_handle = QueueManager::spawn(
        server.clone(),
        ipc_rxs.queue_rx.take().expect("queue receiver"),
    );

    let shutdown_tx = match spawn_listeners(server.clone(), SmtpSessionManager) {
        Ok(shutdown_tx) => shutdown_tx,
        Err(err) => {
            tracing::error!(%err, "failed to start listeners");
            exit(1);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(err) => tracing::error!(%err, "failed to listen for shutdown signal"),
    }

    // Stop accepting, let in-flight sessions drain, stop the dequeuer
    // after its current item.
    let _ = shutdown_tx.send(true);
    let _ = server.inner.ipc.queue_tx.send(QueueEvent::Stop).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, queue_handle).await;
    tracing::info!("bye");
}
