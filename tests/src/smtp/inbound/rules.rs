/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::config::rules::{BlackholeRule, BotRule, Pattern};

use crate::smtp::{session::TestSession, TestSMTP};
use smtp::core::Session;

#[tokio::test]
#[serial_test::serial]
async fn blackholed_sessions_accept_and_discard() {
    let test = TestSMTP::with_config("smtp_rules_blackhole", |core| {
        core.rules.blackhole.enabled = true;
        core.rules.blackhole.rules = vec![BlackholeRule {
            ip: Some(Pattern::new(r"203\.0\.113\..*").unwrap()),
            rcpt: Some(Pattern::new(r".*@honeypot\.test").unwrap()),
            ..Default::default()
        }];
    });
    let mut session = Session::test(test.server.clone());
    session.data.record.remote_ip = "203.0.113.5".parse().unwrap();

    session.ehlo("mail.sender.test").await;
    // The conversation looks perfectly normal from the outside.
    session
        .send_message(
            "a@sender.test",
            &["trap@honeypot.test"],
            "Subject: trap\r\n\r\nbody",
            "250",
        )
        .await;

    // Nothing is enqueued and no artifact survives.
    assert!(test.queue_store().is_empty());
    assert_eq!(test.spooled_artifacts(), 0);
}

#[tokio::test]
#[serial_test::serial]
async fn non_matching_sessions_are_not_blackholed() {
    let test = TestSMTP::with_config("smtp_rules_blackhole_miss", |core| {
        core.rules.blackhole.enabled = true;
        core.rules.blackhole.rules = vec![BlackholeRule {
            ip: Some(Pattern::new(r"203\.0\.113\..*").unwrap()),
            rcpt: Some(Pattern::new(r".*@honeypot\.test").unwrap()),
            ..Default::default()
        }];
    });
    let mut session = Session::test(test.server.clone());

    session.ehlo("mail.sender.test").await;
    session
        .send_message(
            "a@sender.test",
            &["b@rcpt.test"],
            "Subject: normal\r\n\r\nbody",
            "250",
        )
        .await;

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

#[tokio::test]
#[serial_test::serial]
async fn bot_recipients_require_authorization() {
    let test = TestSMTP::with_config("smtp_rules_bots", |core| {
        core.rules.bots.bots = vec![BotRule {
            bot_name: "tickets".to_string(),
            address_pattern: Some(Pattern::new(r"^tickets\+?.*@support\.test$").unwrap()),
            allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
            allowed_tokens: vec!["s3cret".to_string()],
        }];
    });

    // 10.0.0.1 is inside the allow-listed network.
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("tickets@support.test", "250").await;
    session.rset().await;

    // An outside address needs the plus token.
    session.data.record.remote_ip = "192.0.2.55".parse().unwrap();
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("tickets@support.test", "550").await;
    session.rcpt_to("tickets+wrong@support.test", "550").await;
    session.rcpt_to("tickets+s3cret@support.test", "250").await;
}

#[tokio::test]
#[serial_test::serial]
async fn blocklist_matches_by_cidr() {
    let test = TestSMTP::with_config("smtp_rules_blocklist", |core| {
        core.rules.blocklist.enabled = true;
        core.rules.blocklist.entries = vec!["198.51.100.0/24".parse().unwrap()];
    });

    assert!(test.server.is_ip_blocked(&"198.51.100.20".parse().unwrap()));
    assert!(!test.server.is_ip_blocked(&"198.51.101.20".parse().unwrap()));

    test.server.block_ip("192.0.2.9".parse().unwrap());
    assert!(test.server.is_ip_blocked(&"192.0.2.9".parse().unwrap()));
}

#[tokio::test]
#[serial_test::serial]
async fn xclient_overrides_are_gated() {
    // Disabled: the verb is an unknown command.
    let test = TestSMTP::new("smtp_rules_xclient_off");
    let mut session = Session::test(test.server.clone());
    session.cmd("XCLIENT ADDR=203.0.113.9", "500").await;

    // Enabled: attributes override the session metadata.
    let test = TestSMTP::with_config("smtp_rules_xclient_on", |core| {
        core.server.xclient_enabled = true;
    });
    let mut session = Session::test(test.server.clone());
    session
        .ingest_line("XCLIENT ADDR=203.0.113.9 NAME=proxy.test HELO=spoofed.test\r\n")
        .await
        .unwrap();
    session.response().assert_code("250");
    assert_eq!(
        session.data.record.remote_ip,
        "203.0.113.9".parse::<std::net::IpAddr>().unwrap()
    );
    assert_eq!(session.data.record.remote_ptr.as_deref(), Some("proxy.test"));
    assert_eq!(session.data.record.helo_domain, "spoofed.test");
}

#[tokio::test]
#[serial_test::serial]
async fn chaos_replies_only_fire_when_enabled() {
    let message = "Subject: chaos\r\nX-Chaos-Reply: 554 5.7.1 Forced failure\r\n\r\nbody";

    // Off by default: the header is inert and the message is queued.
    let test = TestSMTP::new("smtp_rules_chaos_off");
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .send_message("a@sender.test", &["b@rcpt.test"], message, "250")
        .await;
    let store = test.queue_store();
    assert_eq!(store.len(), 1);
    store
        .dequeue()
        .unwrap()
        .unwrap()
        .inner
        .session
        .delete_artifacts();

    // Enabled: the configured header forces the reply.
    let test = TestSMTP::with_config("smtp_rules_chaos_on", |core| {
        core.server.chaos_headers = true;
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session.mail_from("a@sender.test", "250").await;
    session.rcpt_to("b@rcpt.test", "250").await;
    session.data(message, "554").await;
    assert!(test.queue_store().is_empty());
}
