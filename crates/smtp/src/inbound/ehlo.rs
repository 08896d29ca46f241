/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use smtp_proto::{
    EhloResponse, EXT_8BIT_MIME, EXT_AUTH, EXT_BINARY_MIME, EXT_CHUNKING,
    EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE, EXT_SMTP_UTF8, EXT_START_TLS,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{core::Session, inbound::session::Dispatch};

use super::IsTls;

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_ehlo(&mut self, domain: String, extended: bool) -> Result<Dispatch, ()> {
        if self.data.envelope.is_some() {
            self.reply_error(b"503 5.5.1 HELO not allowed inside a transaction.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }
        if domain.is_empty() {
            self.reply_error(b"501 5.5.4 A domain is required.\r\n").await?;
            return Ok(Dispatch::Continue);
        }

        self.data.record.helo_domain = domain.clone();
        self.data.record.put_magic("helo", domain.clone());
        self.data
            .record
            .log(if extended { "EHLO" } else { "HELO" }, &domain, false);

        if !extended {
            return self
                .write(format!("250 {} you had me at HELO\r\n", self.instance.hostname).as_bytes())
                .await
                .map(|_| Dispatch::Continue);
        }

        let mut response = EhloResponse::new(self.instance.hostname.as_str());
        response.capabilities =
            EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8 | EXT_PIPELINING | EXT_SIZE;
        response.size = self.params.max_message_size;
        if self.params.can_chunking {
            response.capabilities |= EXT_CHUNKING | EXT_BINARY_MIME;
        }
        if self.params.can_starttls {
            response.capabilities |= EXT_START_TLS;
        }
        if self.params.can_auth && self.data.record.authenticated_as.is_none() {
            response.capabilities |= EXT_AUTH;
            response.auth_mechanisms = self.params.auth_mechanisms;
        }
        self.data.record.advertised = response.capabilities;

        let mut buf = Vec::with_capacity(64);
        response.write(&mut buf).ok();
        self.write(&buf).await.map(|_| Dispatch::Continue)
    }
}
