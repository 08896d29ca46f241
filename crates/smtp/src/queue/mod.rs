/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use common::config::smtp::resolver::SecurityPolicy;
use serde::{Deserialize, Serialize};
use smtp_proto::Response;
use uuid::Uuid;

pub mod dsn;
pub mod manager;
pub mod spool;

/// Envelope received through BDAT/BINARYMIME; relayed with BDAT when the
/// next hop advertises CHUNKING.
pub const FLAG_BINARY: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsState {
    pub requested: bool,
    pub negotiated: bool,
    pub protocol: Option<String>,
    pub cipher: Option<String>,
}

/// One `(verb, payload-or-response, error)` entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub verb: String,
    pub detail: String,
    pub error: bool,
}

impl Transaction {
    pub fn new(verb: impl Into<String>, detail: impl Into<String>, error: bool) -> Self {
        Transaction {
            verb: verb.into(),
            detail: detail.into(),
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scanner: String,
    pub verdict: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status<T, E> {
    Scheduled,
    Completed(T),
    TemporaryFailure(E),
    PermanentFailure(E),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResponse {
    pub hostname: String,
    pub response: Response<String>,
}

/// The reply as it appeared on the wire, e.g. `550 5.7.1 No such user`.
pub fn response_line(response: &Response<String>) -> String {
    format!(
        "{} {}.{}.{} {}",
        response.code, response.esc[0], response.esc[1], response.esc[2], response.message
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub entity: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    DnsError(String),
    UnexpectedResponse(HostResponse),
    ConnectionError(ErrorDetails),
    TlsError(ErrorDetails),
    DaneError(ErrorDetails),
    MtaStsError(String),
    Io(String),
}

pub type RecipientStatus = Status<HostResponse, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub address_lcase: String,
    pub domain: String,
    pub orcpt: Option<String>,
    pub status: RecipientStatus,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let address_lcase = address.to_lowercase();
        Recipient {
            domain: address_lcase.domain_part().to_string(),
            address_lcase,
            address,
            orcpt: None,
            status: Status::Scheduled,
        }
    }
}

/// One DATA/BDAT transaction: reverse path, forward paths, and the message
/// artifact on disk. The artifact lives exactly as long as the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub sender_lcase: String,
    pub sender_domain: String,
    pub recipients: Vec<Recipient>,
    pub declared_size: Option<usize>,
    pub size: usize,
    pub artifact: PathBuf,
    pub flags: u64,
    pub scan_results: Vec<ScanRecord>,
    pub transactions: Vec<Transaction>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>) -> Self {
        let sender = sender.into();
        let sender_lcase = sender.to_lowercase();
        Envelope {
            sender_domain: sender_lcase.domain_part().to_string(),
            sender_lcase,
            sender,
            recipients: Vec::new(),
            declared_size: None,
            size: 0,
            artifact: PathBuf::new(),
            flags: 0,
            scan_results: Vec::new(),
            transactions: Vec::new(),
        }
    }

    /// Appends a forward path unless it is already present.
    pub fn add_recipient(&mut self, recipient: Recipient) -> bool {
        if self
            .recipients
            .iter()
            .any(|r| r.address_lcase == recipient.address_lcase)
        {
            false
        } else {
            self.recipients.push(recipient);
            true
        }
    }

    pub fn recipient_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for rcpt in &self.recipients {
            if !domains.contains(&rcpt.domain) {
                domains.push(rcpt.domain.clone());
            }
        }
        domains
    }

    pub fn delete_artifact(&self) {
        if !self.artifact.as_os_str().is_empty() {
            if let Err(err) = std::fs::remove_file(&self.artifact) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(artifact = ?self.artifact, %err, "failed to delete artifact");
                }
            }
        }
    }
}

/// Serialisable record of one SMTP conversation. The live connection wraps
/// this in `core::Session` together with the stream and receiver state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub direction: Direction,
    pub created: String,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub remote_ptr: Option<String>,
    pub helo_domain: String,
    pub advertised: u32,
    pub tls: TlsState,
    pub policy: Option<SecurityPolicy>,
    pub authenticated_as: Option<String>,
    pub envelopes: Vec<Envelope>,
    pub transactions: Vec<Transaction>,
    /// Read-mostly substitution values; written at construction or by an
    /// explicit `put`.
    pub magic: AHashMap<String, String>,
    /// Delivery targets, populated on per-route clones only.
    pub mx: Vec<IpAddr>,
    pub port: u16,
}

impl SessionRecord {
    pub fn new(direction: Direction, local_ip: IpAddr, remote_ip: IpAddr) -> Self {
        SessionRecord {
            id: Uuid::new_v4(),
            direction,
            created: chrono::Utc::now().to_rfc2822(),
            local_ip,
            remote_ip,
            remote_ptr: None,
            helo_domain: String::new(),
            advertised: 0,
            tls: TlsState::default(),
            policy: None,
            authenticated_as: None,
            envelopes: Vec::new(),
            transactions: Vec::new(),
            magic: AHashMap::new(),
            mx: Vec::new(),
            port: 25,
        }
    }

    pub fn log(&mut self, verb: impl Into<String>, detail: impl Into<String>, error: bool) {
        self.transactions.push(Transaction::new(verb, detail, error));
    }

    pub fn put_magic(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.magic.insert(key.into(), value.into());
    }

    /// Deep clone with a fresh id: envelopes and the transaction snapshot
    /// are copied, the magic map is shared by value (read-only after
    /// enqueue).
    pub fn deep_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.id = Uuid::new_v4();
        clone
    }

    /// Unique recipient domains across all envelopes, in first-seen order.
    pub fn recipient_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for envelope in &self.envelopes {
            for domain in envelope.recipient_domains() {
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
        }
        domains
    }

    pub fn delete_artifacts(&self) {
        for envelope in &self.envelopes {
            envelope.delete_artifact();
        }
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        let no_ip = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));
        Self::new(Direction::Inbound, no_ip, no_ip)
    }
}

/// A queued delivery attempt: the conversation snapshot plus its retry
/// bookkeeping. `retry_count` never exceeds the configured budget; at the
/// budget the item is consumed by bounce synthesis instead of re-enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySession {
    pub session: SessionRecord,
    pub retry_count: u32,
    pub last_attempt: u64,
    pub first_enqueue: u64,
}

impl RelaySession {
    pub fn new(session: SessionRecord) -> Self {
        let now = now();
        RelaySession {
            session,
            retry_count: 0,
            last_attempt: 0,
            first_enqueue: now,
        }
    }

    pub fn uid(&self) -> Uuid {
        self.session.id
    }

    pub fn is_bounce(&self) -> bool {
        self.session
            .envelopes
            .first()
            .map_or(false, |envelope| envelope.sender.is_empty())
    }
}

#[inline(always)]
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub trait DomainPart {
    fn domain_part(&self) -> &str;
}

impl DomainPart for &str {
    #[inline(always)]
    fn domain_part(&self) -> &str {
        self.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl DomainPart for String {
    #[inline(always)]
    fn domain_part(&self) -> &str {
        self.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedResponse(response) => {
                write!(
                    f,
                    "Unexpected response from '{}': {}",
                    response.hostname, response.response
                )
            }
            Error::DnsError(err) => {
                write!(f, "DNS lookup failed: {err}")
            }
            Error::ConnectionError(details) => {
                write!(
                    f,
                    "Connection to '{}' failed: {}",
                    details.entity, details.details
                )
            }
            Error::TlsError(details) => {
                write!(f, "TLS error from '{}': {}", details.entity, details.details)
            }
            Error::DaneError(details) => {
                write!(
                    f,
                    "DANE failed to authenticate '{}': {}",
                    details.entity, details.details
                )
            }
            Error::MtaStsError(details) => {
                write!(f, "MTA-STS auth failed: {details}")
            }
            Error::Io(err) => {
                write!(f, "Queue error: {err}")
            }
        }
    }
}

impl<T, E> Status<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Status::Completed(_))
    }
}

impl Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Scheduled => write!(f, "Scheduled"),
            Status::Completed(response) => write!(f, "Delivered: {}", response.response),
            Status::TemporaryFailure(err) => write!(f, "Temporary Failure: {err}"),
            Status::PermanentFailure(err) => write!(f, "Permanent Failure: {err}"),
        }
    }
}
