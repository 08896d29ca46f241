/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::{Duration, Instant};

use mail_auth::MX;
use smtp::queue::{manager, now, spool, Status};

use crate::smtp::{session::TestSession, spawn_mock_remote, DnsCache, TestSMTP};
use smtp::core::Session;

pub mod retry;

fn in_one_hour() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

fn seed_route(test: &TestSMTP, domain: &str) {
    let mx_host = format!("mx1.{domain}");
    test.server.mx_add(
        domain,
        vec![MX {
            preference: 10,
            exchanges: vec![mx_host.clone()],
        }],
        in_one_hour(),
    );
    test.server
        .ipv4_add(&mx_host, vec!["127.0.0.1".parse().unwrap()], in_one_hour());
    test.server
        .txt_add_none(&format!("_mta-sts.{domain}"), in_one_hour());
}

#[tokio::test]
#[serial_test::serial]
async fn happy_path_relay_delivers_and_cleans_up() {
    let remote = spawn_mock_remote().await;
    let test = TestSMTP::new("smtp_queue_happy");
    seed_route(&test, "rcpt.test");

    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .send_message(
            "a@sender.test",
            &["b@rcpt.test"],
            "From: a@sender.test\r\nTo: b@rcpt.test\r\nSubject: happy\r\n\r\nhello over there",
            "250",
        )
        .await;

    let store = test.queue_store();
    assert_eq!(store.len(), 1);
    assert_eq!(test.spooled_artifacts(), 1);

    let processed = manager::process_batch(&test.server, 16, now()).await;
    assert_eq!(processed, 1);

    // Delivered on the first MX: queue drained, artifact gone.
    assert!(store.is_empty());
    assert_eq!(test.spooled_artifacts(), 0);

    let messages = remote.messages.lock().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from, "a@sender.test");
    assert_eq!(messages[0].rcpt, vec!["b@rcpt.test"]);
    assert!(messages[0].body.contains("hello over there"));
    assert!(messages[0].body.contains("Received: from mail.sender.test"));
}

#[tokio::test]
#[serial_test::serial]
async fn backoff_defers_requeued_sessions() {
    let test = TestSMTP::new("smtp_queue_backoff");
    seed_route(&test, "defer.test");

    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .send_message("a@sender.test", &["x@defer.test"], "Subject: w\r\n\r\nbody", "250")
        .await;

    let store = test.queue_store();
    let mut item = store.dequeue().unwrap().unwrap().inner;
    item.retry_count = 2;
    item.last_attempt = now();
    store.enqueue(item).unwrap();

    // Within the backoff window nothing is attempted, the item survives
    // untouched.
    let processed = manager::process_batch(&test.server, 16, now()).await;
    assert_eq!(processed, 0);
    assert_eq!(store.len(), 1);
    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot[0].inner.retry_count, 2);
    snapshot[0].inner.session.delete_artifacts();
    store.clear().unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn queue_contract_roundtrip() {
    let test = TestSMTP::new("smtp_queue_contract");
    let store = test.queue_store();

    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    for rcpt in ["a@one.test", "b@two.test", "c@three.test"] {
        session
            .send_message("s@sender.test", &[rcpt], "Subject: q\r\n\r\nbody", "250")
            .await;
    }
    assert_eq!(store.len(), 3);

    // Snapshot is pure and repeatable.
    let first = store.snapshot().unwrap();
    let second = store.snapshot().unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(
        first.iter().map(|item| item.seq).collect::<Vec<_>>(),
        second.iter().map(|item| item.seq).collect::<Vec<_>>()
    );

    // Uid removal targets the exact item.
    let uid = first[1].inner.uid();
    let removed = store.remove_by_uid(uid).unwrap().unwrap();
    assert_eq!(removed.inner.uid(), uid);
    removed.inner.session.delete_artifacts();

    // FIFO: the remaining items come out in enqueue order.
    let head = store.dequeue().unwrap().unwrap();
    assert_eq!(head.seq, first[0].seq);
    head.inner.session.delete_artifacts();
    let tail = store.dequeue().unwrap().unwrap();
    assert_eq!(tail.seq, first[2].seq);
    tail.inner.session.delete_artifacts();
    assert!(store.dequeue().unwrap().is_none());
}

#[test]
fn pruning_is_monotone() {
    use smtp::queue::{Envelope, HostResponse, Recipient, RelaySession, SessionRecord};
    use smtp_proto::Response;

    let mut envelope = Envelope::new("a@sender.test");
    let mut delivered = Recipient::new("x@a.test");
    delivered.status = Status::Completed(HostResponse {
        hostname: "mx1.a.test".to_string(),
        response: Response::new(250, 2, 0, 0, "OK".to_string()),
    });
    let mut rejected = Recipient::new("y@a.test");
    rejected.status = Status::PermanentFailure(smtp::queue::Error::UnexpectedResponse(
        HostResponse {
            hostname: "mx1.a.test".to_string(),
            response: Response::new(550, 5, 7, 1, "No".to_string()),
        },
    ));
    envelope.recipients.push(delivered);
    envelope.recipients.push(rejected);

    let mut record = SessionRecord::default();
    record.envelopes.push(envelope);
    let mut relay = RelaySession::new(record);

    assert!(manager::prune_delivered(&mut relay));
    let recipients: Vec<_> = relay.session.envelopes[0]
        .recipients
        .iter()
        .map(|rcpt| rcpt.address_lcase.clone())
        .collect();
    assert_eq!(recipients, vec!["y@a.test"]);

    // A fully delivered envelope disappears.
    relay.session.envelopes[0].recipients[0].status = Status::Completed(HostResponse {
        hostname: "mx1.a.test".to_string(),
        response: Response::new(250, 2, 0, 0, "OK".to_string()),
    });
    assert!(!manager::prune_delivered(&mut relay));
    assert!(relay.session.envelopes.is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn local_domains_use_the_delivery_agent() {
    use std::sync::Arc;

    use crate::smtp::RecordingDelivery;

    let agent = Arc::new(RecordingDelivery::default());
    let hook = agent.clone();
    let test = TestSMTP::with_config("smtp_queue_local", move |core| {
        core.server.local_domains = vec!["local.test".to_string()];
        core.hooks.local_delivery = hook;
    });

    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .send_message(
            "a@sender.test",
            &["user@local.test"],
            "Subject: local\r\n\r\nbody",
            "250",
        )
        .await;

    manager::process_batch(&test.server, 16, now()).await;
    assert!(test.queue_store().is_empty());
    assert_eq!(test.spooled_artifacts(), 0);
    assert_eq!(
        agent.delivered.lock().clone(),
        vec!["user@local.test".to_string()]
    );
}

#[tokio::test]
#[serial_test::serial]
async fn sessions_without_envelopes_are_dropped() {
    let test = TestSMTP::new("smtp_queue_empty");
    let store = spool::queue(&test.server.core.queue).unwrap();
    store
        .enqueue(smtp::queue::RelaySession::new(Default::default()))
        .unwrap();
    assert_eq!(store.len(), 1);
    manager::process_batch(&test.server, 16, now()).await;
    assert!(store.is_empty());
}
