/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use smtp_proto::MailFrom;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    core::Session,
    inbound::session::Dispatch,
    queue::{Envelope, Transaction},
};

use super::IsTls;

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_mail_from(&mut self, from: MailFrom<String>) -> Result<Dispatch, ()> {
        if self.data.record.helo_domain.is_empty() {
            self.reply_error(b"503 5.5.1 Polite people say EHLO first.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }
        if self.data.envelope.is_some() {
            self.reply_error(b"503 5.5.1 Multiple MAIL commands.\r\n").await?;
            return Ok(Dispatch::Continue);
        }
        if self.params.auth_required && self.data.record.authenticated_as.is_none() {
            self.reply_error(b"530 5.7.0 Authentication required.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }

        let envelope_limit = self.params.limits.envelope_limit;
        if envelope_limit > 0 && self.data.envelopes_accepted >= envelope_limit {
            self.reply_error(b"451 4.4.5 Too many messages in one session.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }

        let max_size = self.params.max_message_size;
        if max_size > 0 && from.size > max_size {
            self.data.record.log(
                "MAIL",
                format!("declared size {} over limit", from.size),
                true,
            );
            self.reply_error(b"552 5.3.4 Message exceeds maximum allowed size.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }

        let mut envelope = Envelope::new(from.address);
        if from.size > 0 {
            envelope.declared_size = Some(from.size);
        }
        envelope
            .transactions
            .push(Transaction::new("MAIL", envelope.sender.clone(), false));
        self.data
            .record
            .log("MAIL", envelope.sender.clone(), false);
        self.data.envelope = Some(envelope);

        if let Some(rule) = self.proxy_match() {
            return Ok(Dispatch::Tunnel(rule));
        }

        if let Some(reply) = self.webhook("mail").await {
            if reply.code >= 400 {
                self.data.envelope = None;
            }
            self.write_reply_override(&reply).await?;
            return Ok(Dispatch::Continue);
        }

        self.write(b"250 2.1.0 OK\r\n").await?;
        Ok(Dispatch::Continue)
    }
}
