/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{core::Session, inbound::session::Dispatch};

use super::IsTls;

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_vrfy(&mut self, address: String) -> Result<Dispatch, ()> {
        if address.is_empty() {
            self.reply_error(b"501 5.5.4 An address is required.\r\n").await?;
            return Ok(Dispatch::Continue);
        }
        match self.server.core.hooks.user_lookup.exists(&address).await {
            Ok(true) => {
                self.write(format!("250 2.1.5 {address}\r\n").as_bytes()).await?;
            }
            Ok(false) => {
                self.reply_error(b"550 5.1.2 Address not found.\r\n").await?;
            }
            Err(_) => {
                self.write(b"252 2.4.3 Unable to verify address at this time.\r\n")
                    .await?;
            }
        }
        Ok(Dispatch::Continue)
    }

    pub async fn handle_expn(&mut self, _list: String) -> Result<Dispatch, ()> {
        self.reply_error(b"550 5.3.3 EXPN not supported.\r\n").await?;
        Ok(Dispatch::Continue)
    }
}
