/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use smtp::queue::{manager, now};

use crate::smtp::{session::TestSession, spawn_mock_remote, TestSMTP};
use smtp::core::Session;

use super::seed_route;

#[tokio::test]
#[serial_test::serial]
async fn partial_rejection_prunes_then_bounces() {
    let remote = spawn_mock_remote().await;
    let test = TestSMTP::with_config("smtp_queue_retry", |core| {
        core.queue.max_retries = 1;
    });
    seed_route(&test, "a.test");
    seed_route(&test, "origin.test");

    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .send_message(
            "sender@origin.test",
            &["x@a.test", "fail@a.test"],
            "From: sender@origin.test\r\nTo: x@a.test\r\nSubject: partial\r\n\r\nbody",
            "250",
        )
        .await;

    let store = test.queue_store();
    assert_eq!(store.len(), 1);

    // First attempt: x is delivered, fail is rejected with a 550 and the
    // recipient set shrinks to the rejected subset.
    manager::process_batch(&test.server, 1, now()).await;
    {
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        let relay = &snapshot[0].inner;
        assert_eq!(relay.retry_count, 1);
        let recipients: Vec<_> = relay.session.envelopes[0]
            .recipients
            .iter()
            .map(|rcpt| rcpt.address_lcase.clone())
            .collect();
        assert_eq!(recipients, vec!["fail@a.test"]);
        // The 550 is on the envelope's transaction log for the bounce.
        assert!(relay.session.envelopes[0]
            .transactions
            .iter()
            .any(|t| t.error && t.detail.contains("550")));
    }
    assert_eq!(remote.messages.lock().len(), 1);
    assert_eq!(remote.messages.lock()[0].rcpt, vec!["x@a.test"]);

    // Second attempt past the backoff window: still 550, the budget is
    // exhausted and exactly one bounce replaces the session.
    manager::process_batch(&test.server, 1, now() + 3700).await;
    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    let bounce = &snapshot[0].inner;
    assert!(bounce.is_bounce());
    let envelope = &bounce.session.envelopes[0];
    assert_eq!(envelope.sender, "");
    assert_eq!(envelope.recipients[0].address_lcase, "sender@origin.test");

    let contents = std::fs::read_to_string(&envelope.artifact).unwrap();
    assert!(contents.contains("Final-Recipient: RFC822; fail@a.test"));
    assert!(contents.contains("Action: failed"));
    assert!(contents.contains("Status: 5.0.0"));
    assert!(contents.contains("Diagnostic-Code: SMTP; "));
    assert!(contents.contains("550"));

    // Delivering the bounce consumes the queue entirely.
    manager::process_batch(&test.server, 1, now() + 3700).await;
    assert!(store.is_empty());
    let messages = remote.messages.lock().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].rcpt, vec!["sender@origin.test"]);
    assert_eq!(messages[1].from, "");
    assert!(messages[1].body.contains("Reporting-MTA: dns; mx.example.org"));
}

#[tokio::test]
#[serial_test::serial]
async fn bounces_are_never_bounced() {
    let remote = spawn_mock_remote().await;
    drop(remote);
    let test = TestSMTP::with_config("smtp_queue_noloop", |core| {
        core.queue.max_retries = 0;
    });
    seed_route(&test, "dead.test");

    // A null-sender message to an unreachable destination: the budget is
    // exhausted immediately and no bounce is synthesized for it.
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session.cmd("MAIL FROM:<>", "250").await;
    session.rcpt_to("x@dead.test", "250").await;
    session.data("Subject: dsn\r\n\r\nreport", "250").await;

    let store = test.queue_store();
    assert_eq!(store.len(), 1);
    manager::process_batch(&test.server, 1, now()).await;
    assert!(store.is_empty());
    assert_eq!(test.spooled_artifacts(), 0);
}
