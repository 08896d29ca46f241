/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, time::Duration};

use ahash::AHashMap;
use common::{
    config::smtp::resolver::{Mode, SecurityPolicy},
    Server,
};
use mail_send::SmtpClient;
use smtp_proto::{Severity, EXT_CHUNKING, EXT_START_TLS};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Span;

use crate::{
    outbound::{
        dane::verify::TlsaVerify,
        lookup::{MxLookup, MxRoute},
        session::{
            connect, read_greeting, say_ehlo, send_message, send_message_chunked, tls_details,
            try_start_tls, StartTlsResult,
        },
    },
    queue::{
        Error, ErrorDetails, HostResponse, RecipientStatus, RelaySession, SessionRecord, Status,
        Transaction, FLAG_BINARY,
    },
};

pub struct DeliveryAttempt {
    pub span: Span,
    pub relay: RelaySession,
}

impl From<RelaySession> for DeliveryAttempt {
    fn from(relay: RelaySession) -> Self {
        DeliveryAttempt {
            span: tracing::info_span!(
                "delivery",
                "session-id" = %relay.session.id,
                "retry" = relay.retry_count,
                "nrcpt" = relay
                    .session
                    .envelopes
                    .iter()
                    .map(|envelope| envelope.recipients.len())
                    .sum::<usize>(),
            ),
            relay,
        }
    }
}

impl DeliveryAttempt {
    /// Hands local recipients to the delivery agent, then resolves routes
    /// for the remaining domains, splits the session per route and attempts
    /// delivery, recording per-recipient outcomes and the transaction log
    /// on the embedded session.
    pub async fn deliver(mut self, server: &Server) -> RelaySession {
        self.deliver_local(server).await;

        let domains: Vec<String> = self
            .relay
            .session
            .recipient_domains()
            .into_iter()
            .filter(|domain| !server.core.server.local_domains.contains(domain))
            .collect();
        let resolution = server.resolve_routes(&domains).await;

        for (domain, err) in &resolution.failed {
            let status = RecipientStatus::from_dns_error(domain, err);
            for envelope in self.relay.session.envelopes.iter_mut() {
                let mut affected = false;
                for rcpt in envelope
                    .recipients
                    .iter_mut()
                    .filter(|r| r.domain == *domain && matches!(r.status, Status::Scheduled))
                {
                    rcpt.status = status.clone();
                    affected = true;
                }
                if affected {
                    envelope
                        .transactions
                        .push(Transaction::new("MX", format!("{domain}: {err}"), true));
                }
            }
        }

        for route in &resolution.routes {
            let Some(mut routed) = split_for_route(&self.relay.session, route) else {
                continue;
            };
            let policies = route_policies(server, route).await;
            deliver_route(server, &mut routed, route, &policies).await;
            merge_results(&mut self.relay.session, &routed);
        }

        self.relay
    }

    /// Recipients in the configured local domains skip the MX path and go
    /// through the local delivery agent.
    async fn deliver_local(&mut self, server: &Server) {
        let local_domains = &server.core.server.local_domains;
        if local_domains.is_empty() {
            return;
        }
        let hostname = server.core.server.hostname.clone();
        for envelope in self.relay.session.envelopes.iter_mut() {
            let artifact = envelope.artifact.clone();
            for rcpt in envelope.recipients.iter_mut().filter(|rcpt| {
                matches!(rcpt.status, Status::Scheduled) && local_domains.contains(&rcpt.domain)
            }) {
                let outcome = server
                    .core
                    .hooks
                    .local_delivery
                    .deliver(&rcpt.address, &artifact)
                    .await;
                rcpt.status = match outcome {
                    common::policy::DeliveryOutcome::Delivered => {
                        Status::Completed(HostResponse {
                            hostname: hostname.clone(),
                            response: smtp_proto::Response::new(
                                250,
                                2,
                                0,
                                0,
                                "Delivered locally".to_string(),
                            ),
                        })
                    }
                    common::policy::DeliveryOutcome::TempFail => {
                        Status::TemporaryFailure(Error::ConnectionError(ErrorDetails {
                            entity: hostname.clone(),
                            details: "Local delivery failed temporarily".to_string(),
                        }))
                    }
                    common::policy::DeliveryOutcome::PermFail => {
                        Status::PermanentFailure(Error::ConnectionError(ErrorDetails {
                            entity: hostname.clone(),
                            details: "Local delivery failed".to_string(),
                        }))
                    }
                };
            }
        }
    }
}

/// Per-route clone: a fresh session id, only the envelopes and recipients
/// reachable through this route, targets set to the route addresses. The
/// original session is untouched.
pub fn split_for_route(session: &SessionRecord, route: &MxRoute) -> Option<SessionRecord> {
    let mut clone = session.deep_clone();
    clone.mx = route.ips();
    #[cfg(not(any(test, feature = "test_mode")))]
    {
        clone.port = 25;
    }
    #[cfg(any(test, feature = "test_mode"))]
    {
        clone.port = 9925;
    }
    clone.envelopes.retain_mut(|envelope| {
        envelope.transactions.clear();
        envelope.recipients.retain(|rcpt| {
            route.domains.contains(&rcpt.domain) && matches!(rcpt.status, Status::Scheduled)
        });
        !envelope.recipients.is_empty()
    });
    if clone.envelopes.is_empty() {
        None
    } else {
        Some(clone)
    }
}

/// Copies per-recipient outcomes and transaction entries from a routed
/// clone back onto the original session.
fn merge_results(original: &mut SessionRecord, routed: &SessionRecord) {
    for routed_envelope in &routed.envelopes {
        let Some(envelope) = original
            .envelopes
            .iter_mut()
            .find(|envelope| envelope.artifact == routed_envelope.artifact)
        else {
            continue;
        };
        envelope
            .transactions
            .extend(routed_envelope.transactions.iter().cloned());
        for routed_rcpt in &routed_envelope.recipients {
            if matches!(routed_rcpt.status, Status::Scheduled) {
                continue;
            }
            if let Some(rcpt) = envelope
                .recipients
                .iter_mut()
                .find(|rcpt| rcpt.address_lcase == routed_rcpt.address_lcase)
            {
                rcpt.status = routed_rcpt.status.clone();
            }
        }
    }
}

/// The policy for each MX host of a route. Domains sharing a route resolve
/// independently; when they disagree for a host, the strictest policy wins.
async fn route_policies(server: &Server, route: &MxRoute) -> AHashMap<String, SecurityPolicy> {
    fn rank(policy: &SecurityPolicy) -> u8 {
        match policy {
            SecurityPolicy::Dane { .. } => 3,
            SecurityPolicy::MtaSts {
                mode: Mode::Enforce,
                ..
            } => 2,
            SecurityPolicy::MtaSts { .. } => 1,
            SecurityPolicy::Opportunistic { .. } => 0,
        }
    }

    let mut policies: AHashMap<String, SecurityPolicy> = AHashMap::new();
    for domain in &route.domains {
        match server.resolve_policies(domain).await {
            Ok(resolved) => {
                for policy in resolved {
                    match policies.get(policy.mx()) {
                        Some(existing) if rank(existing) >= rank(&policy) => (),
                        _ => {
                            policies.insert(policy.mx().to_string(), policy);
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(domain = domain.as_str(), %err, "policy resolution failed");
            }
        }
    }
    policies
}

async fn deliver_route(
    server: &Server,
    session: &mut SessionRecord,
    route: &MxRoute,
    policies: &AHashMap<String, SecurityPolicy>,
) {
    let queue_config = &server.core.queue;
    let connect_timeout = Duration::from_secs(queue_config.connect_timeout_secs);
    let mut last_status: Option<RecipientStatus> = None;

    'next_host: for mx in &route.servers {
        let Some(policy) = policies.get(&mx.hostname) else {
            continue;
        };
        if mx.ips.is_empty() {
            last_status = Some(Status::TemporaryFailure(Error::DnsError(format!(
                "No IP addresses found for {:?}",
                mx.hostname
            ))));
            continue;
        }

        'next_ip: for ip in &mx.ips {
            let mut smtp_client = match connect(SocketAddr::new(*ip, session.port), connect_timeout)
                .await
            {
                Ok(smtp_client) => smtp_client,
                Err(err) => {
                    last_status = Some(RecipientStatus::from_smtp_error(&mx.hostname, err));
                    continue 'next_ip;
                }
            };

            smtp_client.timeout = Duration::from_secs(queue_config.greeting_timeout_secs);
            if let Err(status) = read_greeting(&mut smtp_client, &mx.hostname).await {
                last_status = Some(status);
                continue 'next_host;
            }

            let capabilities = match say_ehlo(
                &mut smtp_client,
                &server.core.server.hostname,
                &mx.hostname,
            )
            .await
            {
                Ok(capabilities) => capabilities,
                Err(status) => {
                    last_status = Some(status);
                    continue 'next_host;
                }
            };

            session.policy = Some(policy.clone());
            let starttls_advertised = capabilities.capabilities & EXT_START_TLS != 0;
            let use_chunking = capabilities.capabilities & EXT_CHUNKING != 0;
            smtp_client.timeout = Duration::from_secs(queue_config.tls_timeout_secs);

            let result = match policy {
                SecurityPolicy::Dane { tlsa, .. } => {
                    if !starttls_advertised {
                        last_status =
                            Some(RecipientStatus::from_starttls_error(&mx.hostname, None));
                        continue 'next_host;
                    }
                    // DANE usages validate through the TLSA set; a set with
                    // only PKIX usages keeps chain verification on.
                    let connector = if tlsa
                        .entries
                        .iter()
                        .any(|entry| !entry.usage.requires_pkix())
                    {
                        &server.inner.data.smtp_connectors.dummy_verify
                    } else {
                        &server.inner.data.smtp_connectors.pki_verify
                    };
                    match try_start_tls(smtp_client, connector, &mx.hostname, &capabilities).await
                    {
                        Ok(StartTlsResult::Success { mut smtp_client }) => {
                            let verified = {
                                let (_, connection) = smtp_client.stream.get_ref();
                                tlsa.verify(&mx.hostname, connection.peer_certificates())
                            };
                            if let Err(status) = verified {
                                last_status = Some(status);
                                continue 'next_host;
                            }
                            session.tls = tls_details(&smtp_client.stream);
                            deliver_envelopes(
                                queue_config,
                                session,
                                &mut smtp_client,
                                &mx.hostname,
                                use_chunking,
                            )
                            .await
                        }
                        Ok(StartTlsResult::Unavailable { response, .. }) => {
                            last_status = Some(RecipientStatus::from_starttls_error(
                                &mx.hostname,
                                response,
                            ));
                            continue 'next_host;
                        }
                        Err(status) => {
                            last_status = Some(status);
                            continue 'next_host;
                        }
                    }
                }
                SecurityPolicy::MtaSts { mode, .. } => {
                    let mandatory = *mode == Mode::Enforce;
                    if !starttls_advertised {
                        if mandatory {
                            last_status =
                                Some(RecipientStatus::from_starttls_error(&mx.hostname, None));
                            continue 'next_host;
                        }
                        deliver_envelopes(
                            queue_config,
                            session,
                            &mut smtp_client,
                            &mx.hostname,
                            use_chunking,
                        )
                        .await
                    } else {
                        // Enforced policies require PKIX validation with a
                        // hostname match; in testing mode failures are
                        // logged and delivery proceeds.
                        let connector = if mandatory {
                            &server.inner.data.smtp_connectors.pki_verify
                        } else {
                            tracing::info!(
                                mx = mx.hostname.as_str(),
                                "MTA-STS testing mode, certificate failures are not enforced"
                            );
                            &server.inner.data.smtp_connectors.dummy_verify
                        };
                        match try_start_tls(smtp_client, connector, &mx.hostname, &capabilities)
                            .await
                        {
                            Ok(StartTlsResult::Success { mut smtp_client }) => {
                                session.tls = tls_details(&smtp_client.stream);
                                deliver_envelopes(
                                    queue_config,
                                    session,
                                    &mut smtp_client,
                                    &mx.hostname,
                                    use_chunking,
                                )
                                .await
                            }
                            Ok(StartTlsResult::Unavailable {
                                response,
                                mut smtp_client,
                            }) => {
                                if mandatory {
                                    last_status = Some(RecipientStatus::from_starttls_error(
                                        &mx.hostname,
                                        response,
                                    ));
                                    continue 'next_host;
                                }
                                deliver_envelopes(
                                    queue_config,
                                    session,
                                    &mut smtp_client,
                                    &mx.hostname,
                                    use_chunking,
                                )
                                .await
                            }
                            Err(status) => {
                                last_status = Some(status);
                                continue 'next_host;
                            }
                        }
                    }
                }
                SecurityPolicy::Opportunistic { .. } => {
                    if starttls_advertised {
                        match try_start_tls(
                            smtp_client,
                            &server.inner.data.smtp_connectors.dummy_verify,
                            &mx.hostname,
                            &capabilities,
                        )
                        .await
                        {
                            Ok(StartTlsResult::Success { mut smtp_client }) => {
                                session.tls = tls_details(&smtp_client.stream);
                                deliver_envelopes(
                                    queue_config,
                                    session,
                                    &mut smtp_client,
                                    &mx.hostname,
                                    use_chunking,
                                )
                                .await
                            }
                            Ok(StartTlsResult::Unavailable {
                                response: _,
                                mut smtp_client,
                            }) => {
                                deliver_envelopes(
                                    queue_config,
                                    session,
                                    &mut smtp_client,
                                    &mx.hostname,
                                    use_chunking,
                                )
                                .await
                            }
                            Err(status) => {
                                // TLS negotiation failed; deliver in clear
                                // over a fresh connection.
                                tracing::debug!(
                                    mx = mx.hostname.as_str(),
                                    status = %status,
                                    "opportunistic TLS failed, falling back to cleartext"
                                );
                                match reconnect_cleartext(
                                    server,
                                    *ip,
                                    session.port,
                                    &mx.hostname,
                                )
                                .await
                                {
                                    Ok(mut smtp_client) => {
                                        deliver_envelopes(
                                            queue_config,
                                            session,
                                            &mut smtp_client,
                                            &mx.hostname,
                                            use_chunking,
                                        )
                                        .await
                                    }
                                    Err(status) => {
                                        last_status = Some(status);
                                        continue 'next_host;
                                    }
                                }
                            }
                        }
                    } else {
                        deliver_envelopes(
                            queue_config,
                            session,
                            &mut smtp_client,
                            &mx.hostname,
                            use_chunking,
                        )
                        .await
                    }
                }
            };

            match result {
                Ok(()) => return,
                Err(status) => {
                    // Connection dropped mid-session; completed recipients
                    // keep their status, the rest moves on to the next MX.
                    last_status = Some(status);
                    continue 'next_host;
                }
            }
        }
    }

    // All hosts exhausted; recipients never attempted inherit the last
    // connection-level status.
    let status = last_status.unwrap_or_else(|| {
        Status::TemporaryFailure(Error::ConnectionError(ErrorDetails {
            entity: route
                .servers
                .first()
                .map(|mx| mx.hostname.clone())
                .unwrap_or_default(),
            details: "No usable MX hosts for route".to_string(),
        }))
    });
    for envelope in session.envelopes.iter_mut() {
        let mut affected = false;
        for rcpt in envelope
            .recipients
            .iter_mut()
            .filter(|rcpt| matches!(rcpt.status, Status::Scheduled))
        {
            rcpt.status = status.clone();
            affected = true;
        }
        if affected {
            envelope
                .transactions
                .push(Transaction::new("CONNECT", status.to_string(), true));
        }
    }
}

async fn reconnect_cleartext(
    server: &Server,
    ip: std::net::IpAddr,
    port: u16,
    hostname: &str,
) -> Result<SmtpClient<tokio::net::TcpStream>, RecipientStatus> {
    let queue_config = &server.core.queue;
    let mut smtp_client = connect(
        SocketAddr::new(ip, port),
        Duration::from_secs(queue_config.connect_timeout_secs),
    )
    .await
    .map_err(|err| RecipientStatus::from_smtp_error(hostname, err))?;
    smtp_client.timeout = Duration::from_secs(queue_config.greeting_timeout_secs);
    read_greeting(&mut smtp_client, hostname).await?;
    say_ehlo(&mut smtp_client, &server.core.server.hostname, hostname).await?;
    Ok(smtp_client)
}

/// Runs MAIL/RCPT and the payload for every envelope that still has
/// scheduled recipients. Reply-level rejections are final per recipient;
/// a connection-level error aborts with `Err` so the caller can move to
/// the next MX.
async fn deliver_envelopes<T: AsyncRead + AsyncWrite + Unpin>(
    queue_config: &common::config::queue::QueueConfig,
    session: &mut SessionRecord,
    smtp_client: &mut SmtpClient<T>,
    hostname: &str,
    use_chunking: bool,
) -> Result<(), RecipientStatus> {
    for envelope in session.envelopes.iter_mut() {
        if !envelope
            .recipients
            .iter()
            .any(|rcpt| matches!(rcpt.status, Status::Scheduled))
        {
            continue;
        }

        smtp_client.timeout = Duration::from_secs(queue_config.command_timeout_secs);

        // MAIL FROM
        let command = format!("MAIL FROM:<{}>\r\n", envelope.sender);
        match smtp_client.cmd(command.as_bytes()).await {
            Ok(response) if response.severity() == Severity::PositiveCompletion => {
                envelope
                    .transactions
                    .push(Transaction::new("MAIL", crate::queue::response_line(&response), false));
            }
            Ok(response) => {
                envelope
                    .transactions
                    .push(Transaction::new("MAIL", crate::queue::response_line(&response), true));
                let status = reply_status(hostname, response);
                for rcpt in envelope
                    .recipients
                    .iter_mut()
                    .filter(|rcpt| matches!(rcpt.status, Status::Scheduled))
                {
                    rcpt.status = status.clone();
                }
                let _ = smtp_client.cmd(b"RSET\r\n").await;
                continue;
            }
            Err(err) => {
                envelope
                    .transactions
                    .push(Transaction::new("MAIL", err.to_string(), true));
                return Err(RecipientStatus::from_smtp_error(hostname, err));
            }
        }

        // RCPT TO
        let mut accepted = 0;
        for rcpt in envelope.recipients.iter_mut() {
            if !matches!(rcpt.status, Status::Scheduled) {
                continue;
            }
            let command = format!("RCPT TO:<{}>\r\n", rcpt.address);
            match smtp_client.cmd(command.as_bytes()).await {
                Ok(response) if response.severity() == Severity::PositiveCompletion => {
                    envelope
                        .transactions
                        .push(Transaction::new("RCPT", crate::queue::response_line(&response), false));
                    accepted += 1;
                }
                Ok(response) => {
                    envelope
                        .transactions
                        .push(Transaction::new("RCPT", crate::queue::response_line(&response), true));
                    rcpt.status = reply_status(hostname, response);
                }
                Err(err) => {
                    envelope
                        .transactions
                        .push(Transaction::new("RCPT", err.to_string(), true));
                    return Err(RecipientStatus::from_smtp_error(hostname, err));
                }
            }
        }
        if accepted == 0 {
            let _ = smtp_client.cmd(b"RSET\r\n").await;
            continue;
        }

        // Payload
        let message = match tokio::fs::read(&envelope.artifact).await {
            Ok(message) => message,
            Err(err) => {
                envelope
                    .transactions
                    .push(Transaction::new("DATA", err.to_string(), true));
                let status = Status::TemporaryFailure(Error::Io(err.to_string()));
                for rcpt in envelope
                    .recipients
                    .iter_mut()
                    .filter(|rcpt| matches!(rcpt.status, Status::Scheduled))
                {
                    rcpt.status = status.clone();
                }
                let _ = smtp_client.cmd(b"RSET\r\n").await;
                continue;
            }
        };

        smtp_client.timeout = Duration::from_secs(queue_config.data_timeout_secs);
        let result = if use_chunking && envelope.flags & FLAG_BINARY != 0 {
            send_message_chunked(smtp_client, &message).await
        } else {
            send_message(smtp_client, &message).await
        };

        match result {
            Ok(response) if response.severity() == Severity::PositiveCompletion => {
                envelope
                    .transactions
                    .push(Transaction::new("DATA", crate::queue::response_line(&response), false));
                let completed = Status::Completed(HostResponse {
                    hostname: hostname.to_string(),
                    response,
                });
                for rcpt in envelope
                    .recipients
                    .iter_mut()
                    .filter(|rcpt| matches!(rcpt.status, Status::Scheduled))
                {
                    rcpt.status = completed.clone();
                }
            }
            Ok(response) => {
                envelope
                    .transactions
                    .push(Transaction::new("DATA", crate::queue::response_line(&response), true));
                let status = reply_status(hostname, response);
                for rcpt in envelope
                    .recipients
                    .iter_mut()
                    .filter(|rcpt| matches!(rcpt.status, Status::Scheduled))
                {
                    rcpt.status = status.clone();
                }
            }
            Err(err) => {
                envelope
                    .transactions
                    .push(Transaction::new("DATA", err.to_string(), true));
                return Err(RecipientStatus::from_smtp_error(hostname, err));
            }
        }
    }

    let _ = smtp_client.cmd(b"QUIT\r\n").await;
    Ok(())
}

fn reply_status(hostname: &str, response: smtp_proto::Response<String>) -> RecipientStatus {
    let response = HostResponse {
        hostname: hostname.to_string(),
        response,
    };
    if response.response.severity() == Severity::PermanentNegativeCompletion {
        Status::PermanentFailure(Error::UnexpectedResponse(response))
    } else {
        Status::TemporaryFailure(Error::UnexpectedResponse(response))
    }
}
