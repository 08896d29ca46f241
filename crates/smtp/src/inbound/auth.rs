/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use base64::{engine::general_purpose::STANDARD, Engine};
use common::policy::{AuthResult, SaslCredentials};
use smtp_proto::{
    request::receiver::LineReceiver, AUTH_CRAM_MD5, AUTH_LOGIN, AUTH_PLAIN,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    core::{Session, State},
    inbound::session::Dispatch,
};

use super::IsTls;

const MAX_AUTH_ERRORS: usize = 3;

/// SASL exchange in progress; one variant per continuation point.
#[derive(Debug, Clone)]
pub enum SaslToken {
    Plain,
    LoginUser,
    LoginSecret { username: String },
    CramMd5 { challenge: String },
}

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    pub async fn handle_auth(
        &mut self,
        mechanism: u64,
        initial_response: String,
    ) -> Result<Dispatch, ()> {
        if self.data.record.authenticated_as.is_some() {
            self.reply_error(b"503 5.5.1 Already authenticated.\r\n").await?;
            return Ok(Dispatch::Continue);
        }
        if !self.params.can_auth {
            if self.server.snapshot().server.auth.enabled && !self.data.record.tls.negotiated {
                self.reply_error(b"530 5.7.0 Must issue a STARTTLS command first.\r\n")
                    .await?;
            } else {
                self.reply_error(b"502 5.5.1 Command not implemented.\r\n").await?;
            }
            return Ok(Dispatch::Continue);
        }
        if mechanism & self.params.auth_mechanisms == 0 {
            self.reply_error(b"504 5.5.4 Authentication mechanism not supported.\r\n")
                .await?;
            return Ok(Dispatch::Continue);
        }

        match mechanism {
            AUTH_PLAIN => {
                if !initial_response.is_empty() {
                    self.auth_plain(initial_response.as_bytes()).await?;
                    Ok(Dispatch::Continue)
                } else {
                    self.write(b"334 Go ahead.\r\n").await?;
                    Ok(Dispatch::ChangeState(State::Sasl(LineReceiver::new(
                        SaslToken::Plain,
                    ))))
                }
            }
            AUTH_LOGIN => {
                // "Username:"
                self.write(b"334 VXNlcm5hbWU6\r\n").await?;
                Ok(Dispatch::ChangeState(State::Sasl(LineReceiver::new(
                    SaslToken::LoginUser,
                ))))
            }
            AUTH_CRAM_MD5 => {
                let challenge = format!(
                    "<{}.{}@{}>",
                    rand::random::<u64>(),
                    crate::queue::now(),
                    self.instance.hostname
                );
                let reply = format!("334 {}\r\n", STANDARD.encode(&challenge));
                self.write(reply.as_bytes()).await?;
                Ok(Dispatch::ChangeState(State::Sasl(LineReceiver::new(
                    SaslToken::CramMd5 { challenge },
                ))))
            }
            _ => {
                self.reply_error(b"504 5.5.4 Authentication mechanism not supported.\r\n")
                    .await?;
                Ok(Dispatch::Continue)
            }
        }
    }

    /// One continuation line of the exchange. Returns `true` when the
    /// exchange is over, `false` when another line is expected.
    pub async fn handle_sasl_response(
        &mut self,
        token: &mut SaslToken,
        line: &[u8],
    ) -> Result<bool, ()> {
        let line = trim_line(line);
        if line == b"*" {
            self.reply_error(b"501 5.0.0 Authentication cancelled.\r\n").await?;
            return Ok(true);
        }

        match token {
            SaslToken::Plain => {
                self.auth_plain(line).await?;
                Ok(true)
            }
            SaslToken::LoginUser => {
                let Some(username) = decode_text(line) else {
                    self.reply_error(b"501 5.5.2 Invalid base64 string.\r\n").await?;
                    return Ok(true);
                };
                // "Password:"
                self.write(b"334 UGFzc3dvcmQ6\r\n").await?;
                *token = SaslToken::LoginSecret { username };
                Ok(false)
            }
            SaslToken::LoginSecret { username } => {
                let Some(secret) = decode_text(line) else {
                    self.reply_error(b"501 5.5.2 Invalid base64 string.\r\n").await?;
                    return Ok(true);
                };
                let credentials = SaslCredentials::Login {
                    username: std::mem::take(username),
                    secret,
                };
                self.finish_auth(credentials).await?;
                Ok(true)
            }
            SaslToken::CramMd5 { challenge } => {
                let Some(response) = decode_text(line) else {
                    self.reply_error(b"501 5.5.2 Invalid base64 string.\r\n").await?;
                    return Ok(true);
                };
                let Some((username, digest)) = response.rsplit_once(' ') else {
                    self.reply_error(b"501 5.5.2 Invalid CRAM-MD5 response.\r\n")
                        .await?;
                    return Ok(true);
                };
                let credentials = SaslCredentials::CramMd5 {
                    username: username.to_string(),
                    challenge: std::mem::take(challenge),
                    digest: digest.to_string(),
                };
                self.finish_auth(credentials).await?;
                Ok(true)
            }
        }
    }

    /// AUTH PLAIN payload: `authzid NUL authcid NUL passwd`, base64.
    async fn auth_plain(&mut self, line: &[u8]) -> Result<bool, ()> {
        let line = trim_line(line);
        let Ok(decoded) = STANDARD.decode(line) else {
            self.reply_error(b"501 5.5.2 Invalid base64 string.\r\n").await?;
            return Ok(false);
        };
        let mut parts = decoded.split(|&byte| byte == 0).skip(1);
        let (Some(authcid), Some(secret)) = (parts.next(), parts.next()) else {
            self.reply_error(b"501 5.5.2 Invalid AUTH PLAIN response.\r\n")
                .await?;
            return Ok(false);
        };
        let credentials = SaslCredentials::Plain {
            authcid: String::from_utf8_lossy(authcid).into_owned(),
            secret: String::from_utf8_lossy(secret).into_owned(),
        };
        self.finish_auth(credentials).await?;
        Ok(true)
    }

    async fn finish_auth(&mut self, credentials: SaslCredentials) -> Result<(), ()> {
        match self
            .server
            .core
            .hooks
            .authenticator
            .authenticate(&credentials)
            .await
        {
            AuthResult::Success(principal) => {
                tracing::debug!(parent: &self.span, principal = principal.as_str(), "authenticated");
                self.data.record.authenticated_as = Some(principal);
                self.write(b"235 2.7.0 Authentication succeeded.\r\n").await
            }
            AuthResult::Failed => {
                self.data.auth_errors += 1;
                if self.data.auth_errors >= MAX_AUTH_ERRORS {
                    self.write(b"421 4.7.0 Too many authentication failures.\r\n")
                        .await?;
                    return Err(());
                }
                self.reply_error(b"535 5.7.8 Authentication credentials invalid.\r\n")
                    .await
            }
            AuthResult::Unavailable => {
                if self.params.auth_required {
                    // Without a reachable backend nothing can proceed.
                    self.write(b"421 4.7.0 Temporary authentication failure.\r\n")
                        .await?;
                    return Err(());
                }
                self.reply_error(b"454 4.7.0 Temporary authentication failure.\r\n")
                    .await
            }
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while line.last().map_or(false, |b| *b == b'\r' || *b == b'\n') {
        line = &line[..line.len() - 1];
    }
    line
}

fn decode_text(line: &[u8]) -> Option<String> {
    STANDARD
        .decode(trim_line(line))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
