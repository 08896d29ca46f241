/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use ahash::AHashSet;
use async_trait::async_trait;
use common::{
    config::{queue::QueueBackend, smtp::resolver::Tlsa},
    ipc::{build_ipc, QueueEvent},
    policy::{AuthResult, LookupError, SaslAuthenticator, SaslCredentials, UserLookup},
    Core, Server,
};
use mail_auth::{common::resolver::IntoFqdn, MX};
use parking_lot::Mutex;
use smtp::queue::spool::{self, QueueStore};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, watch},
};

pub mod inbound;
pub mod outbound;
pub mod queue;

pub struct TempDir {
    pub temp_dir: PathBuf,
    pub delete: bool,
}

impl TempDir {
    pub fn new(name: &str, delete: bool) -> TempDir {
        let mut temp_dir = std::env::temp_dir();
        temp_dir.push(name);
        if !temp_dir.exists() {
            let _ = std::fs::create_dir(&temp_dir);
        } else if delete {
            let _ = std::fs::remove_dir_all(&temp_dir);
            let _ = std::fs::create_dir(&temp_dir);
        }
        TempDir { temp_dir, delete }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if self.delete {
            let _ = std::fs::remove_dir_all(&self.temp_dir);
        }
    }
}

pub struct TestSMTP {
    pub server: Server,
    pub temp_dir: TempDir,
    pub queue_rx: mpsc::Receiver<QueueEvent>,
}

impl TestSMTP {
    pub fn new(name: &str) -> TestSMTP {
        Self::with_config(name, |_| {})
    }

    /// Builds an in-process server over the in-memory queue backend; the
    /// closure tweaks the snapshot before it is frozen.
    pub fn with_config(name: &str, tweak: impl FnOnce(&mut Core)) -> TestSMTP {
        spool::reset();
        let temp_dir = TempDir::new(name, true);
        let mut core = Core::default();
        core.server.hostname = "mx.example.org".to_string();
        core.server.greeting = "Test SMTP instance".to_string();
        core.server.spool_path = temp_dir
            .temp_dir
            .join("spool")
            .to_string_lossy()
            .into_owned();
        core.queue.backend = QueueBackend::Memory;
        core.queue.path = temp_dir.temp_dir.join("queue");
        tweak(&mut core);

        let (ipc, mut ipc_rxs) = build_ipc();
        TestSMTP {
            server: Server::with_ipc(core, ipc),
            temp_dir,
            queue_rx: ipc_rxs.queue_rx.take().unwrap(),
        }
    }

    pub fn queue_store(&self) -> Arc<dyn QueueStore> {
        spool::queue(&self.server.core.queue).unwrap()
    }

    pub fn spool_path(&self) -> PathBuf {
        PathBuf::from(&self.server.core.server.spool_path)
    }

    /// Messages sitting in the spool directory.
    pub fn spooled_artifacts(&self) -> usize {
        std::fs::read_dir(self.spool_path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Seeds the DNS caches so lookups never leave the process.
pub trait DnsCache {
    fn mx_add(&self, name: &str, value: Vec<MX>, valid_until: Instant);
    fn ipv4_add(&self, name: &str, value: Vec<Ipv4Addr>, valid_until: Instant);
    fn txt_add(&self, name: &str, value: Vec<String>, valid_until: Instant);
    fn txt_add_none(&self, name: &str, valid_until: Instant);
    fn ptr_add(&self, ip: IpAddr, value: Vec<String>, valid_until: Instant);
    fn tlsa_add(&self, name: &str, value: Tlsa, valid_until: Instant);
}

impl DnsCache for Server {
    fn mx_add(&self, name: &str, value: Vec<MX>, valid_until: Instant) {
        self.inner.cache.dns_mx.insert_with_expiry(
            name.into_fqdn().into_owned(),
            Some(Arc::new(value)),
            valid_until,
        );
    }

    fn ipv4_add(&self, name: &str, value: Vec<Ipv4Addr>, valid_until: Instant) {
        self.inner.cache.dns_ip.insert_with_expiry(
            name.into_fqdn().into_owned(),
            Some(Arc::new(
                value.into_iter().map(IpAddr::V4).collect::<Vec<_>>(),
            )),
            valid_until,
        );
    }

    fn txt_add(&self, name: &str, value: Vec<String>, valid_until: Instant) {
        self.inner.cache.dns_txt.insert_with_expiry(
            name.into_fqdn().into_owned(),
            Some(Arc::new(value)),
            valid_until,
        );
    }

    fn txt_add_none(&self, name: &str, valid_until: Instant) {
        self.inner.cache.dns_txt.insert_with_expiry(
            name.into_fqdn().into_owned(),
            None,
            valid_until,
        );
    }

    fn ptr_add(&self, ip: IpAddr, value: Vec<String>, valid_until: Instant) {
        self.inner
            .cache
            .dns_ptr
            .insert_with_expiry(ip, Some(Arc::new(value)), valid_until);
    }

    fn tlsa_add(&self, name: &str, value: Tlsa, valid_until: Instant) {
        self.inner.cache.dns_tlsa.insert_with_expiry(
            name.into_fqdn().into_owned(),
            Arc::new(value),
            valid_until,
        );
    }
}

/// Directory double backed by a fixed address list.
pub struct FixedUserLookup {
    addresses: AHashSet<String>,
}

impl FixedUserLookup {
    pub fn new(addresses: impl IntoIterator<Item = &'static str>) -> Self {
        FixedUserLookup {
            addresses: addresses.into_iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[async_trait]
impl UserLookup for FixedUserLookup {
    async fn exists(&self, address: &str) -> Result<bool, LookupError> {
        Ok(self.addresses.contains(&address.to_lowercase()))
    }
}

/// Authentication double accepting one credential pair.
pub struct FixedAuth {
    pub username: String,
    pub secret: String,
}

#[async_trait]
impl SaslAuthenticator for FixedAuth {
    async fn authenticate(&self, credentials: &SaslCredentials) -> AuthResult {
        match credentials {
            SaslCredentials::Plain { authcid, secret }
            | SaslCredentials::Login {
                username: authcid,
                secret,
            } => {
                if *authcid == self.username && *secret == self.secret {
                    AuthResult::Success(authcid.clone())
                } else {
                    AuthResult::Failed
                }
            }
            SaslCredentials::CramMd5 { username, .. } => {
                if *username == self.username {
                    AuthResult::Success(username.clone())
                } else {
                    AuthResult::Failed
                }
            }
        }
    }
}

/// Local delivery double that records every handed-over recipient.
#[derive(Default)]
pub struct RecordingDelivery {
    pub delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl common::policy::LocalDelivery for RecordingDelivery {
    async fn deliver(
        &self,
        recipient: &str,
        _artifact: &std::path::Path,
    ) -> common::policy::DeliveryOutcome {
        self.delivered.lock().push(recipient.to_string());
        common::policy::DeliveryOutcome::Delivered
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockMessage {
    pub from: String,
    pub rcpt: Vec<String>,
    pub body: String,
}

pub struct MockRemote {
    pub messages: Arc<Mutex<Vec<MockMessage>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for MockRemote {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Minimal scripted SMTP server on the loopback delivery port. Recipients
/// whose local part is `fail` get a 550, `defer` a 451, everything else is
/// accepted.
pub async fn spawn_mock_remote() -> MockRemote {
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.set_reuseaddr(true).unwrap();
    socket.bind("127.0.0.1:9925".parse().unwrap()).unwrap();
    let listener = socket.listen(16).unwrap();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let accepted = messages.clone();
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        loop {
            tokio::select! {
                accepted_conn = listener.accept() => {
                    let Ok((stream, _)) = accepted_conn else { break };
                    tokio::spawn(handle_mock_conn(stream, accepted.clone()));
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    MockRemote {
        messages,
        shutdown_tx,
    }
}

async fn handle_mock_conn(stream: tokio::net::TcpStream, messages: Arc<Mutex<Vec<MockMessage>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut message = MockMessage::default();

    let _ = write_half.write_all(b"220 mock.test ESMTP ready\r\n").await;
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => (),
        }
        let upper = line.to_uppercase();
        let reply: &[u8] = if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            b"250-mock.test\r\n250 SIZE 10485760\r\n"
        } else if upper.starts_with("MAIL FROM:") {
            message.from = address_of(&line);
            b"250 2.1.0 OK\r\n"
        } else if upper.starts_with("RCPT TO:") {
            let address = address_of(&line);
            if address.starts_with("fail@") {
                b"550 5.7.1 No such user\r\n"
            } else if address.starts_with("defer@") {
                b"451 4.3.0 Try again later\r\n"
            } else {
                message.rcpt.push(address);
                b"250 2.1.5 OK\r\n"
            }
        } else if upper.starts_with("DATA") {
            let _ = write_half
                .write_all(b"354 3.0.0 End data with <CR><LF>.<CR><LF>\r\n")
                .await;
            let mut body = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => (),
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                body.push_str(&line);
            }
            message.body = body;
            messages.lock().push(std::mem::take(&mut message));
            b"250 2.0.0 Message accepted\r\n"
        } else if upper.starts_with("QUIT") {
            let _ = write_half.write_all(b"221 2.0.0 Bye\r\n").await;
            return;
        } else if upper.starts_with("RSET") {
            message = MockMessage::default();
            b"250 2.0.0 OK\r\n"
        } else {
            b"500 5.5.1 Unknown command\r\n"
        };
        if write_half.write_all(reply).await.is_err() {
            return;
        }
    }
}

fn address_of(line: &str) -> String {
    line.split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(address, _)| address.to_lowercase())
        .unwrap_or_default()
}
