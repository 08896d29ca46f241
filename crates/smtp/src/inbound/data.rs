/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    config::server::ServerProtocol,
    ipc::QueueEvent,
    policy::{ScanVerdict, SpamScore},
};
use smtp_proto::request::receiver::{BdatReceiver, DataReceiver};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    core::{Session, State},
    inbound::session::Dispatch,
    queue::{spool, RelaySession, ScanRecord, Transaction, FLAG_BINARY},
};

use super::IsTls;

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_data_start(&mut self) -> Result<Dispatch, ()> {
        match &self.data.envelope {
            None => {
                self.reply_error(b"503 5.5.1 MAIL is required first.\r\n").await?;
                Ok(Dispatch::Continue)
            }
            Some(envelope) if envelope.recipients.is_empty() => {
                self.reply_error(b"503 5.5.1 RCPT is required first.\r\n").await?;
                Ok(Dispatch::Continue)
            }
            Some(_) => {
                self.write(b"354 3.0.0 Start mail input, end with <CRLF>.<CRLF>\r\n")
                    .await?;
                Ok(Dispatch::ChangeState(State::Data(DataReceiver::new())))
            }
        }
    }

    pub async fn handle_bdat_start(
        &mut self,
        chunk_size: usize,
        is_last: bool,
    ) -> Result<Dispatch, ()> {
        let mut discard = false;
        if !self.params.can_chunking {
            self.reply_error(b"502 5.5.1 Command not implemented.\r\n").await?;
            discard = true;
        } else if self
            .data
            .envelope
            .as_ref()
            .map_or(true, |envelope| envelope.recipients.is_empty())
        {
            self.reply_error(b"503 5.5.1 RCPT is required first.\r\n").await?;
            discard = true;
        } else {
            let max = self.params.max_message_size;
            if max > 0 && self.data.message.len() + chunk_size > max {
                self.reply_error(b"552 5.3.4 Message exceeds maximum allowed size.\r\n")
                    .await?;
                discard = true;
            }
        }

        if discard {
            self.data.bdat_discard = true;
            self.data.bdat_last = is_last;
            return Ok(Dispatch::ChangeState(State::Bdat(BdatReceiver::new(
                chunk_size, is_last,
            ))));
        }

        if let Some(envelope) = self.data.envelope.as_mut() {
            envelope.flags |= FLAG_BINARY;
        }
        self.data.bdat_last = is_last;
        Ok(Dispatch::ChangeState(State::Bdat(BdatReceiver::new(
            chunk_size, is_last,
        ))))
    }

    /// End of DATA or of the terminal BDAT chunk: size ceiling, scanner
    /// gates, trace header, blackhole evaluation, and the enqueue that
    /// hands the envelope to the relay queue.
    pub async fn handle_data_end(&mut self) -> Result<(), ()> {
        let message = std::mem::take(&mut self.data.message);
        self.data.bdat_last = false;
        let Some(mut envelope) = self.data.envelope.take() else {
            return self.reply_error(b"503 5.5.1 MAIL is required first.\r\n").await;
        };

        let max = self.params.max_message_size;
        if max > 0 && message.len() > max {
            self.data.record.log(
                "DATA",
                format!("{} bytes over the {} limit", message.len(), max),
                true,
            );
            return self
                .reply_error(b"552 5.3.4 Message exceeds maximum allowed size.\r\n")
                .await;
        }
        if message.is_empty() {
            return self.reply_error(b"554 5.6.0 Empty message.\r\n").await;
        }

        // Forced replies through a message header; inert unless the dev
        // knob is on.
        if self.params.chaos_headers {
            if let Some(reply) = chaos_reply(&message) {
                tracing::warn!(parent: &self.span, reply = reply.trim_end(), "chaos reply forced");
                self.data.reset_envelope();
                return if reply.as_bytes()[0] >= b'4' {
                    self.reply_error(reply.as_bytes()).await
                } else {
                    self.write(reply.as_bytes()).await
                };
            }
        }

        // Assemble the artifact: trace header first.
        let mut contents = self.received_header();
        contents.extend_from_slice(&message);

        let artifact = self.params.spool_path.join(format!(
            "{}-{}.eml",
            self.data.record.id, self.data.envelopes_accepted
        ));
        if let Err(err) = tokio::fs::create_dir_all(&self.params.spool_path).await {
            tracing::error!(parent: &self.span, %err, "failed to create spool directory");
            return self
                .reply_error(b"451 4.3.0 Temporary server failure.\r\n")
                .await;
        }

        // Content gates run against the artifact on disk.
        let core = self.server.snapshot();
        let scanner_config = &core.server.scanner;
        let mut discard_by_score = false;

        if let Err(err) = tokio::fs::write(&artifact, &contents).await {
            tracing::error!(parent: &self.span, %err, "failed to write artifact");
            return self
                .reply_error(b"451 4.3.0 Temporary server failure.\r\n")
                .await;
        }

        if scanner_config.virus_enabled {
            match self.server.core.hooks.virus_scanner.scan(&artifact).await {
                ScanVerdict::Clean => {
                    envelope.scan_results.push(ScanRecord {
                        scanner: "antivirus".to_string(),
                        verdict: "clean".to_string(),
                        detail: String::new(),
                    });
                }
                ScanVerdict::Infected(name) => {
                    envelope.scan_results.push(ScanRecord {
                        scanner: "antivirus".to_string(),
                        verdict: "infected".to_string(),
                        detail: name.clone(),
                    });
                    self.data.record.log("DATA", format!("infected: {name}"), true);
                    let _ = tokio::fs::remove_file(&artifact).await;
                    return self
                        .reply_error(b"554 5.7.1 Message refused by content scanner.\r\n")
                        .await;
                }
                ScanVerdict::Error(detail) => {
                    tracing::warn!(parent: &self.span, detail = detail.as_str(), "virus scan failed");
                    envelope.scan_results.push(ScanRecord {
                        scanner: "antivirus".to_string(),
                        verdict: "error".to_string(),
                        detail,
                    });
                }
            }
        }

        if scanner_config.spam_enabled {
            match self.server.core.hooks.spam_scorer.score(&artifact).await {
                Ok(SpamScore { score, symbols }) => {
                    envelope.scan_results.push(ScanRecord {
                        scanner: "spam".to_string(),
                        verdict: format!("{score:.2}"),
                        detail: symbols.join(","),
                    });
                    if scanner_config.reject_threshold > 0.0
                        && score >= scanner_config.reject_threshold
                    {
                        self.data
                            .record
                            .log("DATA", format!("spam score {score:.2}"), true);
                        let _ = tokio::fs::remove_file(&artifact).await;
                        return self
                            .reply_error(b"554 5.7.1 Message refused by content scanner.\r\n")
                            .await;
                    }
                    if scanner_config.discard_threshold > 0.0
                        && score >= scanner_config.discard_threshold
                    {
                        discard_by_score = true;
                    } else if scanner_config.tag_threshold > 0.0
                        && score >= scanner_config.tag_threshold
                    {
                        let mut tagged = format!(
                            "X-Spam-Status: Yes, score={score:.2}\r\nX-Spam-Symbols: {}\r\n",
                            symbols.join(", ")
                        )
                        .into_bytes();
                        tagged.extend_from_slice(&contents);
                        if let Some(tag) = &scanner_config.subject_tag {
                            tag_subject(&mut tagged, tag);
                        }
                        contents = tagged;
                        if let Err(err) = tokio::fs::write(&artifact, &contents).await {
                            tracing::error!(parent: &self.span, %err, "failed to rewrite artifact");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(parent: &self.span, err = err.as_str(), "spam scoring failed");
                    envelope.scan_results.push(ScanRecord {
                        scanner: "spam".to_string(),
                        verdict: "error".to_string(),
                        detail: err,
                    });
                }
            }
        }

        envelope.artifact = artifact.clone();
        envelope.size = contents.len();
        envelope
            .transactions
            .push(Transaction::new("DATA", format!("{} bytes", contents.len()), false));

        // Blackhole rules: matching sessions are accepted and dropped.
        let rcpts: Vec<&str> = envelope
            .recipients
            .iter()
            .map(|rcpt| rcpt.address.as_str())
            .collect();
        if core.rules.blackhole.matches(
            &self.data.record.remote_ip.to_string(),
            &self.data.record.helo_domain,
            &envelope.sender,
            &rcpts,
        ) {
            self.data.blackholed = true;
        }

        if self.data.blackholed || discard_by_score {
            tracing::info!(parent: &self.span, sender = envelope.sender.as_str(), "message discarded");
            let recipients = envelope.recipients.len();
            envelope.delete_artifact();
            self.data.record.log("DATA", "discarded", false);
            self.data.envelopes_accepted += 1;
            self.data.reset_envelope();
            return self.accept_reply(recipients).await;
        }

        if let Some(reply) = self.webhook("data").await {
            if reply.code >= 400 {
                envelope.delete_artifact();
                self.data.reset_envelope();
                return self.write_reply_override(&reply).await;
            }
        }

        // Exactly one relay session per accepted envelope.
        let recipients = envelope.recipients.len();
        let mut record = self.data.record.deep_clone();
        record.envelopes = vec![envelope];
        let relay = RelaySession::new(record);

        match spool::queue(&core.queue).and_then(|store| store.enqueue(relay)) {
            Ok(seq) => {
                tracing::info!(parent: &self.span, queue_seq = seq, "message queued for delivery");
                self.data.record.log("DATA", format!("queued as {seq}"), false);
                let _ = self
                    .server
                    .inner
                    .ipc
                    .queue_tx
                    .try_send(QueueEvent::Refresh);
                self.data.envelopes_accepted += 1;
                self.data.reset_envelope();
                self.accept_reply(recipients).await
            }
            Err(err) => {
                tracing::error!(parent: &self.span, %err, "failed to enqueue message");
                let _ = tokio::fs::remove_file(&artifact).await;
                self.data.reset_envelope();
                self.reply_error(b"451 4.3.0 Temporary server failure.\r\n").await
            }
        }
    }

    /// 250 to the peer; LMTP listeners reply once per accepted recipient.
    async fn accept_reply(&mut self, recipients: usize) -> Result<(), ()> {
        if self.instance.protocol == ServerProtocol::Lmtp {
            let reply = "250 2.0.0 Message queued for delivery.\r\n".repeat(recipients.max(1));
            self.write(reply.as_bytes()).await
        } else {
            self.write(b"250 2.0.0 Message queued for delivery.\r\n").await
        }
    }

    /// Trace header for the artifact, including TLS details when the
    /// conversation was encrypted.
    pub fn received_header(&self) -> Vec<u8> {
        let record = &self.data.record;
        let mut header = String::with_capacity(256);
        header.push_str("Received: from ");
        header.push_str(if record.helo_domain.is_empty() {
            "unknown"
        } else {
            &record.helo_domain
        });
        header.push_str(" (");
        header.push_str(record.remote_ptr.as_deref().unwrap_or("unknown"));
        header.push_str(" [");
        header.push_str(&record.remote_ip.to_string());
        header.push_str("])\r\n\tby ");
        header.push_str(&self.instance.hostname);
        header.push_str(" (Relay MTA) with ");
        header.push_str(match (self.instance.protocol, record.tls.negotiated) {
            (ServerProtocol::Lmtp, _) => "LMTP",
            (ServerProtocol::Smtp, true) => "ESMTPS",
            (ServerProtocol::Smtp, false) => "ESMTP",
        });
        if record.authenticated_as.is_some() {
            header.push('A');
        }
        header.push_str(" id ");
        header.push_str(&record.id.to_string());
        if let (Some(protocol), Some(cipher)) = (&record.tls.protocol, &record.tls.cipher) {
            header.push_str("\r\n\t(using ");
            header.push_str(protocol);
            header.push_str(" with cipher ");
            header.push_str(cipher);
            header.push(')');
        }
        header.push_str(";\r\n\t");
        header.push_str(&chrono::Utc::now().to_rfc2822());
        header.push_str("\r\n");
        header.into_bytes()
    }
}

/// Reply forced through an `X-Chaos-Reply` header, dev-only.
fn chaos_reply(message: &[u8]) -> Option<String> {
    let parsed = mail_parser::MessageParser::default().parse(message)?;
    let value = parsed.header("X-Chaos-Reply")?.as_text()?;
    let code = value.split(' ').next()?;
    if code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()) {
        Some(format!("{value}\r\n"))
    } else {
        None
    }
}

/// Prefixes the Subject header with the configured tag, adding one when
/// the message has none.
fn tag_subject(message: &mut Vec<u8>, tag: &str) {
    let header_end = message
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .unwrap_or(message.len());

    let mut offset = 0;
    while offset < header_end {
        let line_end = message[offset..header_end]
            .windows(2)
            .position(|window| window == b"\r\n")
            .map(|position| offset + position)
            .unwrap_or(header_end);
        if message[offset..]
            .get(..8)
            .map_or(false, |line| line.eq_ignore_ascii_case(b"subject:"))
        {
            let insert_at = offset + 8;
            let insertion = format!(" {tag}");
            message.splice(insert_at..insert_at, insertion.into_bytes());
            return;
        }
        offset = line_end + 2;
    }

    let insertion = format!("Subject: {tag}\r\n");
    message.splice(0..0, insertion.into_bytes());
}
