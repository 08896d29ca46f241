/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, time::Duration};

use mail_send::SmtpClient;
use rustls_pki_types::ServerName;
use smtp_proto::{EhloResponse, Response, Severity, EXT_START_TLS};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::queue::{RecipientStatus, TlsState};

pub async fn connect(
    remote_addr: SocketAddr,
    timeout: Duration,
) -> Result<SmtpClient<TcpStream>, mail_send::Error> {
    match tokio::time::timeout(timeout, TcpStream::connect(remote_addr)).await {
        Ok(Ok(stream)) => Ok(SmtpClient { stream, timeout }),
        Ok(Err(err)) => Err(mail_send::Error::Io(err)),
        Err(_) => Err(mail_send::Error::Timeout),
    }
}

pub async fn read_greeting<T: AsyncRead + AsyncWrite + Unpin>(
    smtp_client: &mut SmtpClient<T>,
    hostname: &str,
) -> Result<(), RecipientStatus> {
    match smtp_client.read().await {
        Ok(response) if response.severity() == Severity::PositiveCompletion => Ok(()),
        Ok(response) => Err(RecipientStatus::from_smtp_error(
            hostname,
            mail_send::Error::UnexpectedReply(response),
        )),
        Err(err) => Err(RecipientStatus::from_smtp_error(hostname, err)),
    }
}

pub async fn say_ehlo<T: AsyncRead + AsyncWrite + Unpin>(
    smtp_client: &mut SmtpClient<T>,
    local_hostname: &str,
    remote_hostname: &str,
) -> Result<EhloResponse<String>, RecipientStatus> {
    smtp_client
        .ehlo(local_hostname)
        .await
        .map_err(|err| RecipientStatus::from_smtp_error(remote_hostname, err))
}

pub enum StartTlsResult {
    Success {
        smtp_client: SmtpClient<TlsStream<TcpStream>>,
    },
    Unavailable {
        response: Option<Response<String>>,
        smtp_client: SmtpClient<TcpStream>,
    },
}

/// Attempts STARTTLS when the server advertises it; the cleartext client is
/// handed back otherwise so opportunistic delivery can proceed.
pub async fn try_start_tls(
    mut smtp_client: SmtpClient<TcpStream>,
    tls_connector: &TlsConnector,
    hostname: &str,
    capabilities: &EhloResponse<String>,
) -> Result<StartTlsResult, RecipientStatus> {
    if capabilities.capabilities & EXT_START_TLS == 0 {
        return Ok(StartTlsResult::Unavailable {
            response: None,
            smtp_client,
        });
    }
    match smtp_client.cmd(b"STARTTLS\r\n").await {
        Ok(response) if response.severity() == Severity::PositiveCompletion => {
            into_tls(smtp_client, tls_connector, hostname)
                .await
                .map(|smtp_client| StartTlsResult::Success { smtp_client })
        }
        Ok(response) => Ok(StartTlsResult::Unavailable {
            response: Some(response),
            smtp_client,
        }),
        Err(err) => Err(RecipientStatus::from_smtp_error(hostname, err)),
    }
}

pub async fn into_tls(
    smtp_client: SmtpClient<TcpStream>,
    tls_connector: &TlsConnector,
    hostname: &str,
) -> Result<SmtpClient<TlsStream<TcpStream>>, RecipientStatus> {
    let timeout = smtp_client.timeout;
    let server_name = ServerName::try_from(hostname.to_string()).map_err(|_| {
        RecipientStatus::from_tls_error(
            hostname,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid hostname"),
        )
    })?;
    match tokio::time::timeout(
        timeout,
        tls_connector.connect(server_name, smtp_client.stream),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(SmtpClient { stream, timeout }),
        Ok(Err(err)) => Err(RecipientStatus::from_tls_error(hostname, err)),
        Err(_) => Err(RecipientStatus::timeout(hostname, "handshaking TLS")),
    }
}

/// TLS parameters of a negotiated client connection, for the session record
/// and the Received header.
pub fn tls_details(stream: &TlsStream<TcpStream>) -> TlsState {
    let (_, connection) = stream.get_ref();
    TlsState {
        requested: true,
        negotiated: true,
        protocol: connection
            .protocol_version()
            .map(|version| format!("{version:?}")),
        cipher: connection
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
    }
}

/// Sends the payload after DATA, dot-stuffed, and returns the final reply.
pub async fn send_message<T: AsyncRead + AsyncWrite + Unpin>(
    smtp_client: &mut SmtpClient<T>,
    message: &[u8],
) -> Result<Response<String>, mail_send::Error> {
    let response = smtp_client.cmd(b"DATA\r\n").await?;
    if response.severity() != Severity::PositiveIntermediate {
        return Err(mail_send::Error::UnexpectedReply(response));
    }

    let payload = dot_stuff(message);
    tokio::time::timeout(smtp_client.timeout, async {
        smtp_client.stream.write_all(&payload).await?;
        smtp_client.stream.flush().await
    })
    .await
    .map_err(|_| mail_send::Error::Timeout)?
    .map_err(mail_send::Error::Io)?;

    smtp_client.read().await
}

/// Sends the payload as a single terminal BDAT chunk.
pub async fn send_message_chunked<T: AsyncRead + AsyncWrite + Unpin>(
    smtp_client: &mut SmtpClient<T>,
    message: &[u8],
) -> Result<Response<String>, mail_send::Error> {
    tokio::time::timeout(smtp_client.timeout, async {
        smtp_client
            .stream
            .write_all(format!("BDAT {} LAST\r\n", message.len()).as_bytes())
            .await?;
        smtp_client.stream.write_all(message).await?;
        smtp_client.stream.flush().await
    })
    .await
    .map_err(|_| mail_send::Error::Timeout)?
    .map_err(mail_send::Error::Io)?;

    smtp_client.read().await
}

/// Doubles leading dots and guarantees a CRLF-dot-CRLF terminator.
fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 8);
    let mut at_line_start = true;
    for &byte in message {
        if at_line_start && byte == b'.' {
            payload.push(b'.');
        }
        payload.push(byte);
        at_line_start = byte == b'\n';
    }
    if !payload.ends_with(b"\r\n") {
        payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(b".\r\n");
    payload
}
