/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use smtp_proto::RcptTo;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    core::Session,
    inbound::session::Dispatch,
    queue::{Recipient, Transaction},
};

use super::IsTls;

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_rcpt_to(&mut self, to: RcptTo<String>) -> Result<Dispatch, ()> {
        if self.data.envelope.is_none() {
            self.reply_error(b"503 5.5.1 MAIL is required first.\r\n").await?;
            return Ok(Dispatch::Continue);
        }
        if to.address.is_empty() {
            self.reply_error(b"501 5.1.3 Bad destination system address.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }

        let recipients_limit = self.params.limits.recipients_limit;
        let recipients = self
            .data
            .envelope
            .as_ref()
            .map(|envelope| envelope.recipients.len())
            .unwrap_or(0);
        if recipients_limit > 0 && recipients >= recipients_limit {
            self.data
                .record
                .log("RCPT", format!("{}: recipient limit", to.address), true);
            self.reply_error(b"452 4.5.3 Too many recipients.\r\n").await?;
            return Ok(Dispatch::Continue);
        }

        // Bot mailboxes require an allow-listed source or a valid plus
        // token before the directory is even consulted.
        let core = self.server.snapshot();
        if core
            .rules
            .bots
            .authorize(&to.address, &self.data.record.remote_ip)
            == Some(false)
        {
            self.data
                .record
                .log("RCPT", format!("{}: bot denied", to.address), true);
            self.reply_error(b"550 5.7.1 Not authorized.\r\n").await?;
            return Ok(Dispatch::Continue);
        }

        match self.server.core.hooks.user_lookup.exists(&to.address).await {
            Ok(true) => (),
            Ok(false) => {
                self.data
                    .record
                    .log("RCPT", format!("{}: unknown user", to.address), true);
                self.reply_error(b"550 5.1.1 No such user here.\r\n").await?;
                return Ok(Dispatch::Continue);
            }
            Err(err) => {
                tracing::debug!(parent: &self.span, ?err, "recipient lookup unavailable");
                self.reply_error(b"451 4.3.0 Unable to verify recipient, try again later.\r\n")
                    .await?;
                return Ok(Dispatch::Continue);
            }
        }

        let mut recipient = Recipient::new(to.address);
        recipient.orcpt = to.orcpt;
        if let Some(envelope) = self.data.envelope.as_mut() {
            envelope
                .transactions
                .push(Transaction::new("RCPT", recipient.address.clone(), false));
            envelope.add_recipient(recipient);
        }

        if let Some(rule) = self.proxy_match() {
            return Ok(Dispatch::Tunnel(rule));
        }

        if let Some(reply) = self.webhook("rcpt").await {
            if reply.code >= 400 {
                if let Some(envelope) = self.data.envelope.as_mut() {
                    envelope.recipients.pop();
                }
            }
            self.write_reply_override(&reply).await?;
            return Ok(Dispatch::Continue);
        }

        self.write(b"250 2.1.5 OK\r\n").await?;
        Ok(Dispatch::Continue)
    }
}
