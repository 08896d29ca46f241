/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::{
    config::rules::ProxyRule,
    listener::{
        limiter::InFlight,
        tracker::{TrackedConnection, TransferError, TransferMonitor, TRANSFER_GRACE},
        ServerInstance,
    },
    Server,
};
use smtp_proto::{
    request::receiver::{DummyDataReceiver, DummyLineReceiver},
    Error, Request,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::core::{Session, State};

use super::IsTls;

/// Outcome of one ingested chunk.
pub enum Flow {
    Continue,
    Close,
    UpgradeTls,
    Tunnel(ProxyRule),
}

/// Outcome of one dispatched verb.
pub enum Dispatch {
    Continue,
    ChangeState(State),
    UpgradeTls,
    Tunnel(ProxyRule),
    Quit,
}

enum SessionEnd {
    Close,
    UpgradeTls,
    Tunnel(ProxyRule),
}

pub async fn handle_conn(
    server: Server,
    instance: Arc<ServerInstance>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    in_flight: InFlight,
) {
    let _in_flight = in_flight;
    let _tracked = TrackedConnection::new(server.clone(), remote_addr.ip());
    let local_addr = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

    if instance.is_tls_implicit {
        let Some(acceptor) = instance.tls_acceptor.clone() else {
            tracing::warn!(listener = %instance.id, "implicit TLS listener without key material");
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let mut session =
                    Session::new(server, instance, tls_stream, local_addr, remote_addr);
                session.data.record.tls.requested = true;
                session.data.record.tls.negotiated = true;
                if let Some((protocol, cipher)) = session.stream.tls_info() {
                    session.data.record.tls.protocol = Some(protocol);
                    session.data.record.tls.cipher = Some(cipher);
                }
                session.init().await;
                if let SessionEnd::Tunnel(rule) = handle_session(&mut session).await {
                    run_tunnel(session, rule).await;
                }
            }
            Err(err) => {
                tracing::debug!(remote = %remote_addr.ip(), %err, "implicit TLS handshake failed");
            }
        }
        return;
    }

    let mut session = Session::new(server, instance.clone(), stream, local_addr, remote_addr);
    session.init().await;
    match handle_session(&mut session).await {
        SessionEnd::Close => (),
        SessionEnd::Tunnel(rule) => run_tunnel(session, rule).await,
        SessionEnd::UpgradeTls => {
            let Some(acceptor) = instance.tls_acceptor.clone() else {
                return;
            };
            let Session {
                server,
                instance,
                span,
                stream,
                mut data,
                ..
            } = session;
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    data.record.tls.requested = true;
                    data.record.tls.negotiated = true;
                    // A successful STARTTLS resets the HELO state.
                    data.record.helo_domain.clear();
                    data.reset_envelope();
                    let mut session = Session {
                        state: State::default(),
                        server,
                        instance,
                        span,
                        stream: tls_stream,
                        data,
                        params: Default::default(),
                    };
                    if let Some((protocol, cipher)) = session.stream.tls_info() {
                        session.data.record.tls.protocol = Some(protocol);
                        session.data.record.tls.cipher = Some(cipher);
                    }
                    session.init().await;
                    if let SessionEnd::Tunnel(rule) = handle_session(&mut session).await {
                        run_tunnel(session, rule).await;
                    }
                }
                Err(err) => {
                    data.record.tls.requested = true;
                    tracing::debug!(remote = %remote_addr.ip(), %err, "TLS handshake failed");
                }
            }
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + IsTls> Session<T> {
    /// Resolves the peer's PTR record and evaluates the session knobs;
    /// runs once per connection and again after STARTTLS.
    pub async fn init(&mut self) {
        self.eval_session_params();
        if self.data.record.remote_ptr.is_none() {
            self.data.record.remote_ptr = self
                .server
                .ptr_lookup(self.data.record.remote_ip)
                .await
                .and_then(|names| names.first().cloned());
            if let Some(ptr) = self.data.record.remote_ptr.clone() {
                self.data.record.put_magic("remote.ptr", ptr);
            }
        }
    }

    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<Flow, ()> {
        // Dev-only XCLIENT pre-pass: only recognised at a command boundary.
        let mut bytes = bytes;
        while self.params.xclient_enabled
            && matches!(self.state, State::Request(_))
            && !self.data.partial_command
            && bytes.len() > 8
            && bytes[..8].eq_ignore_ascii_case(b"XCLIENT ")
        {
            let Some(end) = bytes.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = String::from_utf8_lossy(&bytes[..end]).trim_end().to_string();
            bytes = &bytes[end + 1..];
            self.handle_xclient(&line).await?;
        }

        let mut iter = bytes.iter();
        let mut state = std::mem::replace(&mut self.state, State::None);
        let mut flow = Flow::Continue;

        'outer: loop {
            match &mut state {
                State::Request(receiver) => loop {
                    match receiver.ingest(&mut iter, bytes) {
                        Ok(request) => {
                            self.data.partial_command = false;
                            match self.pre_dispatch().await? {
                                true => (),
                                false => {
                                    flow = Flow::Close;
                                    break 'outer;
                                }
                            }
                            match self.handle_request(request).await? {
                                Dispatch::Continue => (),
                                Dispatch::ChangeState(new_state) => {
                                    state = new_state;
                                    continue 'outer;
                                }
                                Dispatch::UpgradeTls => {
                                    flow = Flow::UpgradeTls;
                                    break 'outer;
                                }
                                Dispatch::Tunnel(rule) => {
                                    flow = Flow::Tunnel(rule);
                                    break 'outer;
                                }
                                Dispatch::Quit => {
                                    flow = Flow::Close;
                                    break 'outer;
                                }
                            }
                        }
                        Err(err) => match err {
                            Error::NeedsMoreData { .. } => {
                                self.data.partial_command = !receiver.buf.is_empty();
                                break 'outer;
                            }
                            Error::UnknownCommand | Error::InvalidResponse { .. } => {
                                self.reply_error(b"500 5.5.1 Invalid command.\r\n").await?;
                            }
                            Error::InvalidSenderAddress => {
                                self.reply_error(b"501 5.1.8 Bad sender's system address.\r\n")
                                    .await?;
                            }
                            Error::InvalidRecipientAddress => {
                                self.reply_error(
                                    b"501 5.1.3 Bad destination system address.\r\n",
                                )
                                .await?;
                            }
                            Error::SyntaxError { syntax } => {
                                self.reply_error(
                                    format!("501 5.5.2 Syntax error, expected: {syntax}\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::InvalidParameter { param } => {
                                self.reply_error(
                                    format!("501 5.5.4 Invalid parameter {param:?}.\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::UnsupportedParameter { param } => {
                                self.reply_error(
                                    format!("504 5.5.4 Unsupported parameter {param:?}.\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::ResponseTooLong => {
                                state = State::RequestTooLarge(DummyLineReceiver::default());
                                continue 'outer;
                            }
                        },
                    }
                },
                State::Data(receiver) => {
                    if receiver.ingest(&mut iter, &mut self.data.message) {
                        self.handle_data_end().await?;
                        state = State::default();
                        continue 'outer;
                    } else {
                        let max = self.params.max_message_size;
                        if max > 0 && self.data.message.len() > max.saturating_mul(2) {
                            let skip = DummyDataReceiver::new_data(receiver);
                            state = State::DataTooLarge(skip);
                            continue 'outer;
                        }
                        break 'outer;
                    }
                }
                State::Bdat(receiver) => {
                    if receiver.ingest(&mut iter, &mut self.data.message) {
                        if self.data.bdat_discard {
                            // The chunk was already refused; eat the bytes.
                            self.data.message = Vec::with_capacity(0);
                            self.data.bdat_discard = false;
                            if self.data.bdat_last {
                                self.data.reset_envelope();
                            }
                        } else if self.data.bdat_last {
                            self.handle_data_end().await?;
                        } else {
                            self.write(b"250 2.6.0 Chunk accepted.\r\n").await?;
                        }
                        state = State::default();
                        continue 'outer;
                    } else {
                        break 'outer;
                    }
                }
                State::Sasl(receiver) => {
                    if receiver.ingest(&mut iter) {
                        let line = std::mem::take(&mut receiver.buf);
                        let mut token = receiver.state.clone();
                        if self.handle_sasl_response(&mut token, &line).await? {
                            state = State::default();
                        } else {
                            receiver.state = token;
                        }
                        continue 'outer;
                    } else {
                        break 'outer;
                    }
                }
                State::DataTooLarge(receiver) => {
                    if receiver.ingest(&mut iter) {
                        tracing::debug!(parent: &self.span, "data too large, message discarded");
                        self.data.reset_envelope();
                        self.reply_error(b"552 5.3.4 Message too big for system.\r\n")
                            .await?;
                        state = State::default();
                        continue 'outer;
                    } else {
                        break 'outer;
                    }
                }
                State::RequestTooLarge(receiver) => {
                    if receiver.ingest(&mut iter) {
                        self.reply_error(b"500 5.2.3 Line is too long.\r\n").await?;
                        state = State::default();
                        continue 'outer;
                    } else {
                        break 'outer;
                    }
                }
                State::None => break 'outer,
            }
        }

        self.state = state;
        Ok(flow)
    }

    /// Per-verb bookkeeping: transaction cap, tracker accounting and the
    /// command-rate tarpit. Returns `false` when the connection has to
    /// close.
    async fn pre_dispatch(&mut self) -> Result<bool, ()> {
        self.data.transactions += 1;
        let limit = self.params.limits.transactions_limit;
        if limit > 0 && self.data.transactions > limit {
            self.write(b"421 4.7.0 Too many requests, closing connection.\r\n")
                .await?;
            return Ok(false);
        }

        self.server
            .inner
            .data
            .tracker
            .record_command(self.data.record.remote_ip);
        if let Some(delay) = self.data.command_rate.ingest(&self.params.dos) {
            tracing::debug!(parent: &self.span, ?delay, "tarpitting abusive client");
            tokio::time::sleep(delay).await;
            self.data.errors += 1;
            let error_limit = self.params.limits.error_limit;
            if error_limit > 0 && self.data.errors > error_limit {
                self.write(b"421 4.7.0 Too many errors, closing connection.\r\n")
                    .await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_request(&mut self, request: Request<String>) -> Result<Dispatch, ()> {
        match request {
            Request::Ehlo { host } => self.handle_ehlo(host, true).await,
            Request::Lhlo { host } => self.handle_ehlo(host, true).await,
            Request::Helo { host } => self.handle_ehlo(host, false).await,
            Request::Mail { from } => self.handle_mail_from(from).await,
            Request::Rcpt { to } => self.handle_rcpt_to(to).await,
            Request::Data => self.handle_data_start().await,
            Request::Bdat {
                chunk_size,
                is_last,
            } => self.handle_bdat_start(chunk_size, is_last).await,
            Request::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth(mechanism, initial_response).await,
            Request::StartTls => {
                if self.params.can_starttls {
                    self.write(b"220 2.0.0 Ready to start TLS.\r\n").await?;
                    Ok(Dispatch::UpgradeTls)
                } else if self.data.record.tls.negotiated {
                    self.reply_error(b"503 5.5.1 Already in TLS mode.\r\n").await?;
                    Ok(Dispatch::Continue)
                } else {
                    self.reply_error(b"502 5.5.1 Command not implemented.\r\n")
                        .await?;
                    Ok(Dispatch::Continue)
                }
            }
            Request::Rset => {
                self.data.reset_envelope();
                self.data.record.log("RSET", "", false);
                self.write(b"250 2.0.0 OK\r\n").await?;
                Ok(Dispatch::Continue)
            }
            Request::Noop { .. } => {
                self.write(b"250 2.0.0 OK\r\n").await?;
                Ok(Dispatch::Continue)
            }
            Request::Quit => {
                self.write(b"221 2.0.0 Bye.\r\n").await?;
                Ok(Dispatch::Quit)
            }
            Request::Vrfy { value } => self.handle_vrfy(value).await,
            Request::Expn { value } => self.handle_expn(value).await,
            Request::Help { .. } => {
                self.write(
                    b"214 2.0.0 Commands: HELO EHLO MAIL RCPT DATA BDAT RSET NOOP QUIT VRFY HELP\r\n",
                )
                .await?;
                Ok(Dispatch::Continue)
            }
            _ => {
                self.reply_error(b"502 5.5.1 Command not implemented.\r\n")
                    .await?;
                Ok(Dispatch::Continue)
            }
        }
    }

    /// XCLIENT override: trusted dev-only attribute injection, accepted
    /// only before the first MAIL transaction.
    async fn handle_xclient(&mut self, line: &str) -> Result<(), ()> {
        if self.data.envelope.is_some() || self.data.envelopes_accepted > 0 {
            return self
                .reply_error(b"503 5.5.1 XCLIENT not allowed in transaction.\r\n")
                .await;
        }
        for attribute in line.split_whitespace().skip(1) {
            let Some((key, value)) = attribute.split_once('=') else {
                continue;
            };
            match key.to_uppercase().as_str() {
                "ADDR" => {
                    if let Ok(ip) = value.parse() {
                        self.data.record.remote_ip = ip;
                        self.data.record.put_magic("remote.ip", value.to_string());
                    }
                }
                "NAME" => {
                    self.data.record.remote_ptr = Some(value.to_string());
                }
                "HELO" => {
                    self.data.record.helo_domain = value.to_string();
                }
                _ => (),
            }
        }
        self.data.record.log("XCLIENT", line, false);
        self.write(b"250 2.0.0 OK\r\n").await
    }

    /// Evaluates the proxy rules against the current conversation state;
    /// the first match wins.
    pub fn proxy_match(&self) -> Option<ProxyRule> {
        let core = self.server.snapshot();
        if !core.rules.proxy.enabled {
            return None;
        }
        let ip = self.data.record.remote_ip.to_string();
        let mail = self
            .data
            .envelope
            .as_ref()
            .map(|envelope| envelope.sender.clone())
            .unwrap_or_default();
        let rcpts: Vec<&str> = self
            .data
            .envelope
            .as_ref()
            .map(|envelope| {
                envelope
                    .recipients
                    .iter()
                    .map(|rcpt| rcpt.address.as_str())
                    .collect()
            })
            .unwrap_or_default();
        core.rules
            .proxy
            .find(&ip, &self.data.record.helo_domain, &mail, &rcpts)
            .cloned()
    }
}

async fn handle_session<T: AsyncRead + AsyncWrite + Unpin + IsTls>(
    session: &mut Session<T>,
) -> SessionEnd {
    if session
        .write(
            format!(
                "220 {} {}\r\n",
                session.instance.hostname, session.instance.greeting
            )
            .as_bytes(),
        )
        .await
        .is_err()
    {
        return SessionEnd::Close;
    }

    let mut buf = vec![0u8; 8192];
    let mut shutdown_rx = session.instance.shutdown_rx.clone();
    let mut monitor: Option<TransferMonitor> = None;
    let mut payload_bytes: u64 = 0;

    loop {
        let in_data = matches!(
            session.state,
            State::Data(_) | State::Bdat(_) | State::DataTooLarge(_)
        );
        if in_data {
            if monitor.is_none() {
                monitor = Some(TransferMonitor::start());
                payload_bytes = 0;
            }
        } else {
            monitor = None;
        }
        let timeout = if in_data {
            session.params.data_timeout.min(TRANSFER_GRACE)
        } else {
            session.params.timeout
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, session.read(&mut buf)) => {
                match result {
                    Ok(Ok(0)) => return SessionEnd::Close,
                    Ok(Ok(bytes_read)) => {
                        if in_data {
                            payload_bytes += bytes_read as u64;
                            session
                                .server
                                .inner
                                .data
                                .tracker
                                .record_bytes(session.data.record.remote_ip, bytes_read as u64);
                            if let Some(monitor) = monitor.as_mut() {
                                if let Err(err) =
                                    monitor.check(payload_bytes, &session.params.dos)
                                {
                                    let _ = session
                                        .write(transfer_error_reply(err))
                                        .await;
                                    return SessionEnd::Close;
                                }
                            }
                        }
                        match session.ingest(&buf[..bytes_read]).await {
                            Ok(Flow::Continue) => (),
                            Ok(Flow::Close) | Err(()) => return SessionEnd::Close,
                            Ok(Flow::UpgradeTls) => return SessionEnd::UpgradeTls,
                            Ok(Flow::Tunnel(rule)) => return SessionEnd::Tunnel(rule),
                        }
                    }
                    Ok(Err(())) => return SessionEnd::Close,
                    Err(_) => {
                        if in_data {
                            // Idle slice during a payload: run the slow
                            // transfer checks and keep waiting until the
                            // payload read ceiling.
                            if let Some(monitor) = monitor.as_mut() {
                                if let Err(err) =
                                    monitor.check(payload_bytes, &session.params.dos)
                                {
                                    let _ = session.write(transfer_error_reply(err)).await;
                                    return SessionEnd::Close;
                                }
                                if monitor.elapsed() >= session.params.data_timeout {
                                    let _ = session
                                        .write(transfer_error_reply(TransferError::Timeout))
                                        .await;
                                    return SessionEnd::Close;
                                }
                            }
                            continue;
                        }
                        let _ = session
                            .write(b"221 2.0.0 Disconnecting inactive client.\r\n")
                            .await;
                        return SessionEnd::Close;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = session.write(b"421 4.3.0 Server shutting down.\r\n").await;
                return SessionEnd::Close;
            }
        }
    }
}

fn transfer_error_reply(err: TransferError) -> &'static [u8] {
    match err {
        TransferError::TooSlow => b"421 4.4.2 Data transfer rate too low, closing connection.\r\n",
        TransferError::Timeout => b"421 4.4.2 Data transfer timeout, closing connection.\r\n",
    }
}

/// Turns the session into a byte tunnel to the configured upstream: the
/// conversation so far is replayed, the client's pending state continues
/// against the upstream.
async fn run_tunnel<T: AsyncRead + AsyncWrite + Unpin + IsTls>(
    mut session: Session<T>,
    rule: ProxyRule,
) {
    let upstream_addr = format!("{}:{}", rule.host, rule.port);
    tracing::info!(parent: &session.span, upstream = upstream_addr.as_str(), "proxying session");

    let upstream = match tokio::time::timeout(
        Duration::from_secs(30),
        TcpStream::connect(&upstream_addr),
    )
    .await
    {
        Ok(Ok(upstream)) => upstream,
        _ => {
            let _ = session
                .write(b"421 4.3.2 Upstream unavailable, closing connection.\r\n")
                .await;
            return;
        }
    };

    if rule.tls {
        let connector = if session.server.core.server.allow_self_signed {
            session.server.inner.data.smtp_connectors.dummy_verify.clone()
        } else {
            session.server.inner.data.smtp_connectors.pki_verify.clone()
        };
        let server_name = match rustls_pki_types::ServerName::try_from(rule.host.clone()) {
            Ok(server_name) => server_name,
            Err(_) => {
                let _ = session
                    .write(b"421 4.3.2 Upstream unavailable, closing connection.\r\n")
                    .await;
                return;
            }
        };
        match tokio::time::timeout(
            Duration::from_secs(30),
            connector.connect(server_name, upstream),
        )
        .await
        {
            Ok(Ok(tls_upstream)) => finish_tunnel(session, tls_upstream).await,
            _ => {
                let _ = session
                    .write(b"421 4.3.2 Upstream TLS failure, closing connection.\r\n")
                    .await;
            }
        }
    } else {
        finish_tunnel(session, upstream).await;
    }
}

async fn finish_tunnel<T, U>(mut session: Session<T>, mut upstream: U)
where
    T: AsyncRead + AsyncWrite + Unpin + IsTls,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if replay_conversation(&mut session, &mut upstream).await.is_err() {
        let _ = session
            .write(b"421 4.3.2 Upstream rejected the session.\r\n")
            .await;
        return;
    }

    match tokio::io::copy_bidirectional(&mut session.stream, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            tracing::debug!(
                parent: &session.span,
                client_to_upstream,
                upstream_to_client,
                "tunnel closed"
            );
        }
        Err(err) => {
            tracing::debug!(parent: &session.span, %err, "tunnel failed");
        }
    }
}

/// Replays greeting, EHLO and the open transaction to the upstream, then
/// relays the upstream's reply to the triggering verb back to the client.
async fn replay_conversation<T, U>(
    session: &mut Session<T>,
    upstream: &mut U,
) -> Result<(), ()>
where
    T: AsyncRead + AsyncWrite + Unpin + IsTls,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];

    read_smtp_reply(upstream, &mut buf).await?;
    upstream
        .write_all(format!("EHLO {}\r\n", session.instance.hostname).as_bytes())
        .await
        .map_err(|_| ())?;
    read_smtp_reply(upstream, &mut buf).await?;

    // The verb that triggered the tunnel has not been answered yet; its
    // upstream verdict is the one relayed to the client, everything before
    // it was already acknowledged locally.
    if let Some(envelope) = session.data.envelope.clone() {
        upstream
            .write_all(format!("MAIL FROM:<{}>\r\n", envelope.sender).as_bytes())
            .await
            .map_err(|_| ())?;
        let mut pending = read_smtp_reply(upstream, &mut buf).await?;
        for rcpt in &envelope.recipients {
            upstream
                .write_all(format!("RCPT TO:<{}>\r\n", rcpt.address).as_bytes())
                .await
                .map_err(|_| ())?;
            pending = read_smtp_reply(upstream, &mut buf).await?;
        }
        session.write(pending.as_bytes()).await?;
    }
    Ok(())
}

async fn read_smtp_reply<U: AsyncRead + AsyncWrite + Unpin>(
    upstream: &mut U,
    buf: &mut [u8],
) -> Result<String, ()> {
    use tokio::io::AsyncReadExt;

    let mut reply = String::new();
    loop {
        let len = tokio::time::timeout(Duration::from_secs(30), upstream.read(buf))
            .await
            .map_err(|_| ())?
            .map_err(|_| ())?;
        if len == 0 {
            return Err(());
        }
        reply.push_str(&String::from_utf8_lossy(&buf[..len]));
        // Last line of a reply: "NNN " separator instead of "NNN-".
        if reply
            .lines()
            .last()
            .map_or(false, |line| line.len() >= 4 && line.as_bytes()[3] == b' ')
            && reply.ends_with('\n')
        {
            return Ok(reply);
        }
    }
}
