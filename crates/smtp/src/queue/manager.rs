/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use ahash::AHashSet;
use common::{ipc::QueueEvent, Server};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use uuid::Uuid;

use crate::outbound::delivery::DeliveryAttempt;

use super::{dsn, now, spool};

pub struct QueueManager;

impl QueueManager {
    /// Runs the scheduler loop: a periodic pass plus a pass on every
    /// enqueue notification, until `Stop` or channel close.
    pub fn spawn(server: Server, mut queue_rx: mpsc::Receiver<QueueEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(server.core.queue.interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        process_batch(&server, server.core.queue.max_dequeue, now()).await;
                    }
                    event = queue_rx.recv() => {
                        match event {
                            Some(QueueEvent::Stop) | None => {
                                tracing::debug!("queue manager stopped");
                                break;
                            }
                            Some(QueueEvent::Refresh) | Some(QueueEvent::WorkerDone) => {
                                process_batch(&server, server.core.queue.max_dequeue, now()).await;
                            }
                        }
                    }
                }
            }
        })
    }
}

/// One scheduler pass: pops up to `max_dequeue` items, delivers the due
/// ones and re-enqueues the rest. Returns the number of items for which a
/// delivery was attempted.
pub async fn process_batch(server: &Server, max_dequeue: usize, now_epoch: u64) -> usize {
    let store = match spool::queue(&server.core.queue) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(%err, "failed to open relay queue");
            return 0;
        }
    };

    let mut processed = 0;
    let mut seen: AHashSet<Uuid> = AHashSet::new();

    for _ in 0..max_dequeue {
        let item = match store.dequeue() {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "failed to dequeue item, skipping");
                continue;
            }
        };
        let relay = item.inner;
        let uid = relay.uid();

        if !seen.insert(uid) {
            // Every remaining item was already touched this pass.
            requeue(&*store, relay, "pass complete");
            break;
        }

        if relay.session.envelopes.is_empty() {
            tracing::debug!(session = %uid, "dropping session without envelopes");
            continue;
        }

        let backoff = server.core.queue.backoff(relay.retry_count);
        if now_epoch.saturating_sub(relay.last_attempt) < backoff {
            requeue(&*store, relay, "backoff not elapsed");
            continue;
        }

        let attempt = DeliveryAttempt::from(relay);
        let span = attempt.span.clone();
        let mut relay = attempt.deliver(server).instrument(span).await;
        processed += 1;

        if !prune_delivered(&mut relay) {
            tracing::info!(session = %uid, "session delivered");
            notify(server, QueueEvent::WorkerDone).await;
            continue;
        }

        if relay.retry_count < server.core.queue.max_retries {
            relay.retry_count += 1;
            relay.last_attempt = now_epoch;
            // Surviving recipients are attempted again on the next pass;
            // their diagnostics are re-recorded by that attempt.
            for envelope in relay.session.envelopes.iter_mut() {
                for rcpt in envelope.recipients.iter_mut() {
                    rcpt.status = super::Status::Scheduled;
                }
            }
            requeue(&*store, relay, "delivery incomplete");
        } else {
            // Retry budget exhausted: one bounce per remaining envelope,
            // then the originals are released.
            tracing::info!(session = %uid, "retry budget exhausted, generating bounces");
            for envelope in &relay.session.envelopes {
                if let Some(bounce) = dsn::build_bounce(server, &relay, envelope) {
                    match store.enqueue(bounce) {
                        Ok(_) => notify(server, QueueEvent::Refresh).await,
                        Err(err) => tracing::error!(%err, "failed to enqueue bounce"),
                    }
                }
            }
            relay.session.delete_artifacts();
        }
    }

    processed
}

fn requeue(store: &dyn spool::QueueStore, relay: super::RelaySession, reason: &str) {
    let uid = relay.uid();
    let retry_count = relay.retry_count;
    match store.enqueue(relay) {
        Ok(_) => {
            tracing::debug!(session = %uid, retry = retry_count, reason, "session re-enqueued");
        }
        Err(err) => {
            tracing::error!(session = %uid, %err, "failed to re-enqueue session");
        }
    }
}

async fn notify(server: &Server, event: QueueEvent) {
    let _ = server.inner.ipc.queue_tx.try_send(event);
}

/// Removes delivered recipients and emptied envelopes, releasing their
/// artifacts. The recipient set only ever shrinks. Returns `true` while
/// envelopes remain to be delivered.
pub fn prune_delivered(relay: &mut super::RelaySession) -> bool {
    relay.session.envelopes.retain_mut(|envelope| {
        envelope
            .recipients
            .retain(|rcpt| !rcpt.status.is_completed());
        if envelope.recipients.is_empty() {
            envelope.delete_artifact();
            false
        } else {
            true
        }
    });
    !relay.session.envelopes.is_empty()
}
