/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Write;

use chrono::{TimeZone, Utc};
use common::Server;
use mail_builder::{
    headers::{content_type::ContentType, HeaderType},
    mime::{BodyPart, MimePart},
    MessageBuilder,
};

use super::{
    Direction, Envelope, Error, Recipient, RelaySession, SessionRecord, Status,
};

/// Builds the delivery status notification for an envelope whose retry
/// budget is exhausted: a human-readable part, an RFC 3464 machine part
/// and the original header section, addressed to the original sender with
/// a null reverse path and a fresh retry budget.
pub fn build_bounce(
    server: &Server,
    relay: &RelaySession,
    envelope: &Envelope,
) -> Option<RelaySession> {
    if envelope.sender.is_empty() {
        // Never bounce a bounce.
        tracing::debug!(session = %relay.session.id, "suppressing bounce of a null sender");
        return None;
    }

    let hostname = &server.core.server.hostname;
    let from_addr = format!("MAILER-DAEMON@{hostname}");

    // Human-readable part.
    let mut text = format!(
        concat!(
            "This is the mail system at host {}.\r\n\r\n",
            "Your message could not be delivered to one or more recipients.\r\n",
            "It is attached below.\r\n\r\n",
        ),
        hostname
    );
    for rcpt in &envelope.recipients {
        let _ = write!(text, "<{}> ({})\r\n", rcpt.address, rcpt.status);
    }

    // Machine-readable delivery-status part.
    let mut dsn = format!("Reporting-MTA: dns; {hostname}\r\n");
    if let Some(arrival) = Utc.timestamp_opt(relay.first_enqueue as i64, 0).single() {
        let _ = write!(dsn, "Arrival-Date: {}\r\n", arrival.to_rfc2822());
    }
    for rcpt in &envelope.recipients {
        dsn.push_str("\r\n");
        let _ = write!(dsn, "Final-Recipient: RFC822; {}\r\n", rcpt.address);
        dsn.push_str("Action: failed\r\n");
        let _ = write!(dsn, "Status: {}\r\n", rcpt.status_code());
        if let Some(diagnostic) = rcpt.diagnostic_code() {
            let _ = write!(dsn, "Diagnostic-Code: SMTP; {diagnostic}\r\n");
        }
        if let Some(remote_mta) = rcpt.remote_mta() {
            let _ = write!(dsn, "Remote-MTA: dns; {remote_mta}\r\n");
        }
        if relay.last_attempt > 0 {
            if let Some(attempted) = Utc.timestamp_opt(relay.last_attempt as i64, 0).single() {
                let _ = write!(dsn, "Last-Attempt-Date: {}\r\n", attempted.to_rfc2822());
            }
        }
    }

    let original_headers = read_header_section(envelope);

    let message = MessageBuilder::new()
        .from(("Mail Delivery Subsystem", from_addr.as_str()))
        .header("To", HeaderType::Text(envelope.sender.as_str().into()))
        .header("Auto-Submitted", HeaderType::Text("auto-replied".into()))
        .message_id(format!("{}@{}", uuid::Uuid::new_v4(), hostname))
        .subject("Delivery Status Notification (Failure)")
        .body(MimePart::new(
            ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
            BodyPart::Multipart(vec![
                MimePart::new(ContentType::new("text/plain"), BodyPart::Text(text.into())),
                MimePart::new(
                    ContentType::new("message/delivery-status"),
                    BodyPart::Text(dsn.into()),
                ),
                MimePart::new(
                    ContentType::new("text/rfc822-headers"),
                    BodyPart::Text(original_headers.into()),
                ),
            ]),
        ))
        .write_to_vec()
        .unwrap_or_default();

    // Spool the bounce as its own artifact.
    let artifact = server
        .core
        .queue
        .path
        .join(format!("dsn-{}.eml", uuid::Uuid::new_v4()));
    if let Some(parent) = artifact.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(&artifact, &message) {
        tracing::error!(%err, "failed to write bounce artifact");
        return None;
    }

    let mut session = SessionRecord::new(
        Direction::Outbound,
        relay.session.local_ip,
        relay.session.local_ip,
    );
    session.helo_domain = hostname.clone();
    let mut bounce_envelope = Envelope::new("");
    bounce_envelope.add_recipient(Recipient::new(envelope.sender.clone()));
    bounce_envelope.artifact = artifact;
    bounce_envelope.size = message.len();
    session.envelopes.push(bounce_envelope);
    session.log(
        "DSN",
        format!("bounce for session {}", relay.session.id),
        false,
    );

    Some(RelaySession::new(session))
}

/// Header section of the original message, up to the first empty line.
fn read_header_section(envelope: &Envelope) -> String {
    match std::fs::read(&envelope.artifact) {
        Ok(bytes) => {
            let end = bytes
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|position| position + 2)
                .unwrap_or_else(|| bytes.len().min(2048));
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        Err(_) => "(original message unavailable)\r\n".to_string(),
    }
}

impl Recipient {
    /// Enhanced status for the DSN: permanent verdicts report 5.0.0,
    /// everything else 4.0.0.
    pub fn status_code(&self) -> &'static str {
        match &self.status {
            Status::PermanentFailure(_) => "5.0.0",
            _ => "4.0.0",
        }
    }

    /// The last SMTP reply recorded for this recipient, when there is one.
    pub fn diagnostic_code(&self) -> Option<String> {
        match &self.status {
            Status::TemporaryFailure(Error::UnexpectedResponse(response))
            | Status::PermanentFailure(Error::UnexpectedResponse(response)) => {
                Some(crate::queue::response_line(&response.response))
            }
            Status::TemporaryFailure(err) | Status::PermanentFailure(err) => Some(err.to_string()),
            _ => None,
        }
    }

    pub fn remote_mta(&self) -> Option<&str> {
        match &self.status {
            Status::TemporaryFailure(Error::UnexpectedResponse(response))
            | Status::PermanentFailure(Error::UnexpectedResponse(response)) => {
                Some(response.hostname.as_str())
            }
            Status::TemporaryFailure(Error::ConnectionError(details))
            | Status::PermanentFailure(Error::ConnectionError(details))
            | Status::TemporaryFailure(Error::TlsError(details))
            | Status::PermanentFailure(Error::TlsError(details))
            | Status::TemporaryFailure(Error::DaneError(details))
            | Status::PermanentFailure(Error::DaneError(details)) => Some(details.entity.as_str()),
            _ => None,
        }
    }
}
