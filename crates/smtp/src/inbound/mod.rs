/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::server::TlsStream;

use crate::core::Session;

pub mod auth;
pub mod data;
pub mod ehlo;
pub mod mail;
pub mod rcpt;
pub mod session;
pub mod vrfy;

pub trait IsTls {
    fn is_tls(&self) -> bool;
    /// `(protocol, cipher)` of the negotiated connection.
    fn tls_info(&self) -> Option<(String, String)>;
}

impl IsTls for TcpStream {
    fn is_tls(&self) -> bool {
        false
    }

    fn tls_info(&self) -> Option<(String, String)> {
        None
    }
}

impl IsTls for TlsStream<TcpStream> {
    fn is_tls(&self) -> bool {
        true
    }

    fn tls_info(&self) -> Option<(String, String)> {
        let (_, connection) = self.get_ref();
        match (
            connection.protocol_version(),
            connection.negotiated_cipher_suite(),
        ) {
            (Some(protocol), Some(suite)) => {
                Some((format!("{protocol:?}"), format!("{:?}", suite.suite())))
            }
            _ => None,
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Session<T> {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        match self.stream.write_all(bytes).await {
            Ok(()) => match self.stream.flush().await {
                Ok(()) => {
                    tracing::trace!(parent: &self.span, reply = %String::from_utf8_lossy(bytes).trim_end());
                    Ok(())
                }
                Err(err) => {
                    tracing::debug!(parent: &self.span, %err, "failed to flush stream");
                    Err(())
                }
            },
            Err(err) => {
                tracing::debug!(parent: &self.span, %err, "failed to write to stream");
                Err(())
            }
        }
    }

    pub async fn read(&mut self, bytes: &mut [u8]) -> Result<usize, ()> {
        match self.stream.read(bytes).await {
            Ok(len) => Ok(len),
            Err(err) => {
                tracing::debug!(parent: &self.span, %err, "failed to read from stream");
                Err(())
            }
        }
    }

    /// Notifies the webhook collaborator; a returned override replaces the
    /// verb's reply. Dispatch failures are ignored unless the snapshot says
    /// they fail the verb.
    pub async fn webhook(&mut self, stage: &'static str) -> Option<common::policy::ReplyOverride> {
        use ahash::AHashMap;

        let mut fields = AHashMap::new();
        fields.insert("remote-ip".to_string(), self.data.record.remote_ip.to_string());
        fields.insert("helo".to_string(), self.data.record.helo_domain.clone());
        if let Some(envelope) = &self.data.envelope {
            fields.insert("sender".to_string(), envelope.sender.clone());
            fields.insert(
                "recipients".to_string(),
                envelope
                    .recipients
                    .iter()
                    .map(|rcpt| rcpt.address.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        let event = common::policy::WebhookEvent {
            stage,
            session_id: self.data.record.id.to_string(),
            fields,
        };
        match self.server.core.hooks.webhook.dispatch(event).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(parent: &self.span, stage, err = err.as_str(), "webhook dispatch failed");
                if self.server.snapshot().server.scanner.webhook_strict {
                    Some(common::policy::ReplyOverride {
                        code: 451,
                        message: "4.3.0 Temporary server failure.".to_string(),
                    })
                } else {
                    None
                }
            }
        }
    }

    pub async fn write_reply_override(
        &mut self,
        reply: &common::policy::ReplyOverride,
    ) -> Result<(), ()> {
        let line = format!("{} {}\r\n", reply.code, reply.message);
        if reply.code >= 400 {
            self.reply_error(line.as_bytes()).await
        } else {
            self.write(line.as_bytes()).await
        }
    }

    /// Writes a 4xx/5xx reply and enforces the per-connection error budget:
    /// one reply past the limit the peer gets a 421 and the connection
    /// closes.
    pub async fn reply_error(&mut self, bytes: &[u8]) -> Result<(), ()> {
        self.data.errors += 1;
        let limit = self.params.limits.error_limit;
        if limit > 0 && self.data.errors > limit {
            tracing::debug!(parent: &self.span, errors = self.data.errors, "error limit exceeded");
            self.write(b"421 4.7.0 Too many errors, closing connection.\r\n")
                .await?;
            return Err(());
        }
        self.write(bytes).await
    }
}
