/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use crate::smtp::{
    session::{DummyIo, TestSession},
    FixedUserLookup, TestSMTP,
};
use smtp::core::Session;

#[tokio::test]
#[serial_test::serial]
async fn accepted_envelope_is_enqueued_once() {
    let test = TestSMTP::new("smtp_inbound_basic");
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session
        .send_message(
            "a@sender.test",
            &["b@rcpt.test"],
            "From: a@sender.test\r\nTo: b@rcpt.test\r\nSubject: test\r\n\r\nhello",
            "250",
        )
        .await;

    let store = test.queue_store();
    assert_eq!(store.len(), 1);
    assert_eq!(test.spooled_artifacts(), 1);

    let item = store.dequeue().unwrap().unwrap();
    let envelope = item.inner.session.envelopes.first().unwrap();
    assert_eq!(envelope.sender, "a@sender.test");
    assert_eq!(envelope.recipients.len(), 1);
    assert_eq!(envelope.recipients[0].address_lcase, "b@rcpt.test");
    assert_eq!(envelope.recipients[0].domain, "rcpt.test");
    assert_eq!(item.inner.retry_count, 0);

    // The artifact carries the trace header and the body.
    let contents = std::fs::read_to_string(&envelope.artifact).unwrap();
    assert!(contents.starts_with("Received: from mail.sender.test"));
    assert!(contents.contains("by mx.example.org (Relay MTA) with ESMTP"));
    assert!(contents.contains("hello"));
    envelope.delete_artifact();
}

#[tokio::test]
#[serial_test::serial]
async fn verbs_out_of_order_are_rejected() {
    let test = TestSMTP::new("smtp_inbound_order");
    let mut session = Session::test(test.server.clone());

    session.cmd("MAIL FROM:<a@sender.test>", "503").await;
    session.ehlo("mail.sender.test").await;
    session.cmd("RCPT TO:<b@rcpt.test>", "503").await;
    session.cmd("DATA", "503").await;

    session.mail_from("a@sender.test", "250").await;
    session.cmd("MAIL FROM:<x@sender.test>", "503").await;
    session.cmd("DATA", "503").await;

    session.rset().await;
    session.cmd("DATA", "503").await;
    assert!(test.queue_store().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn recipients_are_deduplicated_and_validated() {
    let test = TestSMTP::with_config("smtp_inbound_rcpt", |core| {
        core.hooks.user_lookup = Arc::new(FixedUserLookup::new([
            "bill@foobar.org",
            "jane@domain.net",
        ]));
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.mail_from("john@sender.test", "250").await;
    session.rcpt_to("bill@foobar.org", "250").await;
    session.rcpt_to("BILL@foobar.org", "250").await;
    session.rcpt_to("unknown@foobar.org", "550").await;
    session.rcpt_to("jane@domain.net", "250").await;
    session.data("Subject: dedup\r\n\r\nbody", "250").await;

    let item = test.queue_store().dequeue().unwrap().unwrap();
    let envelope = item.inner.session.envelopes.first().unwrap();
    assert_eq!(
        envelope
            .recipients
            .iter()
            .map(|rcpt| rcpt.address_lcase.as_str())
            .collect::<Vec<_>>(),
        ["bill@foobar.org", "jane@domain.net"]
    );
    envelope.delete_artifact();
}

#[tokio::test]
#[serial_test::serial]
async fn helo_and_misc_verbs() {
    let test = TestSMTP::new("smtp_inbound_misc");
    let mut session = Session::test(test.server.clone());

    session.cmd("NOOP", "250").await;
    session.cmd("HELP", "214").await;
    session.cmd("HELO mail.sender.test", "250").await;
    session.cmd("LHLO mail.sender.test", "250").await;
    session.cmd("VRFY someone@rcpt.test", "250").await;
    session.cmd("EXPN list@rcpt.test", "550").await;
    session.cmd("EHLO mail.sender.test", "250").await;

    let reply = session.cmd("EHLO mail.sender.test", "250").await;
    reply.assert_contains("PIPELINING");
    reply.assert_contains("8BITMIME");
    reply.assert_contains("SMTPUTF8");
    reply.assert_contains("CHUNKING");
    assert!(session.data.record.helo_domain == "mail.sender.test");
}

#[tokio::test]
#[serial_test::serial]
async fn bdat_chunks_are_accepted() {
    let test = TestSMTP::new("smtp_inbound_bdat");
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("b@rcpt.test", "250").await;

    session.ingest_line("BDAT 6\r\nFrom: ").await.unwrap();
    session.response().assert_code("250 2.6.0");
    session
        .ingest_line("BDAT 11 LAST\r\na\r\n\r\nbody\r\n")
        .await
        .unwrap();
    session.response().assert_code("250 2.0.0");

    let item = test.queue_store().dequeue().unwrap().unwrap();
    let envelope = item.inner.session.envelopes.first().unwrap();
    assert_ne!(envelope.flags & smtp::queue::FLAG_BINARY, 0);
    envelope.delete_artifact();
}

#[tokio::test]
#[serial_test::serial]
async fn quit_closes_the_session() {
    let test = TestSMTP::new("smtp_inbound_quit");
    let mut session: Session<DummyIo> = Session::test(test.server.clone());
    let flow = session.ingest_line("QUIT\r\n").await.unwrap();
    assert!(matches!(flow, smtp::inbound::session::Flow::Close));
    session.response().assert_code("221");
}
