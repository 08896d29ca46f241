/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use common::listener::tracker::{ConnectionTracker, DenyReason};

use crate::smtp::{session::TestSession, TestSMTP};
use smtp::{core::Session, inbound::session::Flow};

#[tokio::test]
#[serial_test::serial]
async fn recipient_limit_keeps_the_session_open() {
    let test = TestSMTP::with_config("smtp_limits_rcpt", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.recipients_limit = 2;
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("one@rcpt.test", "250").await;
    session.rcpt_to("two@rcpt.test", "250").await;
    // The (N+1)-th recipient is refused but the session carries on.
    session.rcpt_to("three@rcpt.test", "452").await;
    session.data("Subject: limit\r\n\r\nbody", "250").await;

    let item = test.queue_store().dequeue().unwrap().unwrap();
    let envelope = item.inner.session.envelopes.first().unwrap();
    assert_eq!(envelope.recipients.len(), 2);
    envelope.delete_artifact();
}

#[tokio::test]
#[serial_test::serial]
async fn error_limit_drops_the_connection() {
    let test = TestSMTP::with_config("smtp_limits_errors", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.error_limit = 2;
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.cmd("RCPT TO:<x@y>", "503").await;
    session.cmd("DATA", "503").await;
    // The (K+1)-th error turns into a 421 and the connection closes.
    let result = session.ingest_line("RCPT TO:<x@y>\r\n").await;
    assert!(result.is_err());
    session.response().assert_code("421");
}

#[tokio::test]
#[serial_test::serial]
async fn declared_size_over_the_limit_is_refused() {
    let test = TestSMTP::with_config("smtp_limits_size", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.email_size_limit = 1024;
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.cmd("MAIL FROM:<a@sender.test> SIZE=1025", "552").await;
    session.cmd("MAIL FROM:<a@sender.test> SIZE=1024", "250").await;
}

#[tokio::test]
#[serial_test::serial]
async fn oversized_payload_is_refused() {
    let test = TestSMTP::with_config("smtp_limits_payload", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.email_size_limit = 256;
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("b@rcpt.test", "250").await;
    session.cmd("DATA", "354").await;
    let body = format!("Subject: big\r\n\r\n{}\r\n.\r\n", "x".repeat(300));
    session.ingest_line(&body).await.unwrap();
    session.response().assert_code("552");
    assert!(test.queue_store().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn transaction_limit_closes_the_session() {
    let test = TestSMTP::with_config("smtp_limits_transactions", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.transactions_limit = 3;
    });
    let mut session = Session::test(test.server.clone());

    session.cmd("NOOP", "250").await;
    session.cmd("NOOP", "250").await;
    session.cmd("NOOP", "250").await;
    let flow = session.ingest_line("NOOP\r\n").await.unwrap();
    assert!(matches!(flow, Flow::Close));
    session.response().assert_code("421");
}

#[tokio::test]
#[serial_test::serial]
async fn envelope_limit_caps_mail_transactions() {
    let test = TestSMTP::with_config("smtp_limits_envelopes", |core| {
        core.server.listeners = vec![Default::default()];
        core.server.listeners[0].limits.envelope_limit = 1;
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session
        .send_message("a@sender.test", &["b@rcpt.test"], "Subject: one\r\n\r\n1", "250")
        .await;
    session.cmd("MAIL FROM:<a@sender.test>", "451").await;

    let store = test.queue_store();
    assert_eq!(store.len(), 1);
    store
        .dequeue()
        .unwrap()
        .unwrap()
        .inner
        .session
        .delete_artifacts();
}

#[test]
fn connection_window_counts_denied_attempts() {
    // Six connections in a sixty second window with a budget of five:
    // the sixth gets refused and still shows up in the recent count.
    let tracker = ConnectionTracker::default();
    let ip = "198.51.100.7".parse().unwrap();
    let dos = common::config::session::DosConfig {
        enabled: true,
        rate_limit_window_secs: 60,
        max_connections_per_window: 5,
        ..Default::default()
    };

    for _ in 0..5 {
        assert!(tracker.try_accept(ip, &dos).is_ok());
    }
    assert_eq!(tracker.try_accept(ip, &dos), Err(DenyReason::RateWindow));
    assert_eq!(
        tracker.recent_connection_count(&ip, Duration::from_secs(60)),
        6
    );
}
