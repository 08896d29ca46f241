/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::smtp::{session::TestSession, FixedAuth, TestSMTP};
use smtp::core::Session;

fn plain_response(authcid: &str, secret: &str) -> String {
    STANDARD.encode(format!("\u{0}{authcid}\u{0}{secret}"))
}

#[tokio::test]
#[serial_test::serial]
async fn auth_plain_with_initial_response() {
    let test = TestSMTP::with_config("smtp_auth_plain", |core| {
        core.server.auth.enabled = true;
        core.server.auth.allow_plain_text = true;
        core.hooks.authenticator = Arc::new(FixedAuth {
            username: "jdoe".to_string(),
            secret: "hunter2".to_string(),
        });
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;

    session
        .cmd(
            &format!("AUTH PLAIN {}", plain_response("jdoe", "wrong")),
            "535",
        )
        .await;
    session
        .cmd(
            &format!("AUTH PLAIN {}", plain_response("jdoe", "hunter2")),
            "235",
        )
        .await;
    assert_eq!(session.data.record.authenticated_as.as_deref(), Some("jdoe"));

    // A second AUTH is refused.
    session
        .cmd(
            &format!("AUTH PLAIN {}", plain_response("jdoe", "hunter2")),
            "503",
        )
        .await;
}

#[tokio::test]
#[serial_test::serial]
async fn auth_login_continuation() {
    let test = TestSMTP::with_config("smtp_auth_login", |core| {
        core.server.auth.enabled = true;
        core.server.auth.allow_plain_text = true;
        core.hooks.authenticator = Arc::new(FixedAuth {
            username: "jdoe".to_string(),
            secret: "hunter2".to_string(),
        });
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;

    session.cmd("AUTH LOGIN", "334").await;
    session
        .ingest_line(&format!("{}\r\n", STANDARD.encode("jdoe")))
        .await
        .unwrap();
    session.response().assert_code("334");
    session
        .ingest_line(&format!("{}\r\n", STANDARD.encode("hunter2")))
        .await
        .unwrap();
    session.response().assert_code("235");
    assert_eq!(session.data.record.authenticated_as.as_deref(), Some("jdoe"));
}

#[tokio::test]
#[serial_test::serial]
async fn auth_requires_tls_unless_allowed() {
    let test = TestSMTP::with_config("smtp_auth_tls_gate", |core| {
        core.server.auth.enabled = true;
        core.server.auth.allow_plain_text = false;
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;
    session
        .cmd(&format!("AUTH PLAIN {}", plain_response("a", "b")), "530")
        .await;
}

#[tokio::test]
#[serial_test::serial]
async fn mail_requires_authentication_when_configured() {
    let test = TestSMTP::with_config("smtp_auth_required", |core| {
        core.server.auth.enabled = true;
        core.server.auth.required = true;
        core.server.auth.allow_plain_text = true;
        core.hooks.authenticator = Arc::new(FixedAuth {
            username: "jdoe".to_string(),
            secret: "hunter2".to_string(),
        });
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;

    session.cmd("MAIL FROM:<a@sender.test>", "530").await;
    session
        .cmd(
            &format!("AUTH PLAIN {}", plain_response("jdoe", "hunter2")),
            "235",
        )
        .await;
    session.mail_from("a@sender.test", "250").await;
}

#[tokio::test]
#[serial_test::serial]
async fn cancelled_and_malformed_exchanges() {
    let test = TestSMTP::with_config("smtp_auth_cancel", |core| {
        core.server.auth.enabled = true;
        core.server.auth.allow_plain_text = true;
    });
    let mut session = Session::test(test.server.clone());
    session.ehlo("mail.sender.test").await;

    session.cmd("AUTH PLAIN", "334").await;
    session.ingest_line("*\r\n").await.unwrap();
    session.response().assert_code("501");

    session.cmd("AUTH LOGIN", "334").await;
    session.ingest_line("not-base64!!\r\n").await.unwrap();
    session.response().assert_code("501");
}
